//! The staged event pipeline.
//!
//! ```text
//! sessions ─▶ read ─▶ [read-decode] ─▶ decoded ─▶ [decoded-dispatch] ─┬─▶ logic-i ─▶ [logic-i] ─▶ outbound-i ─┐
//!                                                                      └─▶ cluster ─▶ [cluster-single] ─▶ logic-i
//! outbound-* ─▶ [write-encode] ─▶ wire ─▶ [write-dispatch] ─▶ sessions
//! every stage ─▶ errors ─▶ [error-consumer]
//! ```
//!
//! Each bracketed stage is one thread running a [`StageProcessor`]. Stages
//! only talk to each other through rings.

mod cluster;
mod decode;
mod errors;
mod worker;
mod write;

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use self::cluster::ClusterSingle;
pub use self::decode::{DecodedDispatch, ReadDecode};
pub use self::errors::ErrorConsumer;
pub use self::worker::LogicWorker;
pub use self::write::{WriteDispatch, WriteEncode};

use crate::config::{PipelineSettings, RaftSettings};
use crate::consistency::{Consensus, ConsistencyService};
use crate::dispatch::Dispatcher;
use crate::error::RingError;
use crate::event::{Event, EventContent, Fault};
use crate::filter::FilterChain;
use crate::logic::LogicHandler;
use crate::ring::Ring;
use crate::session::{Session, SessionRegistry};
use crate::stage::{Backoff, EventHandler, StageProcessor};

/// Every ring of one pipeline. Built before the stages so the cluster ring
/// can be shared with the consistency service and the raft runtime first.
pub struct PipelineRings {
    pub read: Arc<Ring<Event>>,
    pub decoded: Arc<Ring<Event>>,
    pub logic: Vec<Arc<Ring<Event>>>,
    pub cluster: Arc<Ring<Event>>,
    pub outbound: Vec<Arc<Ring<Event>>>,
    pub wire: Arc<Ring<Event>>,
    pub errors: Arc<Ring<Event>>,
}

impl PipelineRings {
    pub fn new(settings: &PipelineSettings) -> Self {
        let powers = settings.ring_size_power;
        let per_worker = |family: &str, power: u32| -> Vec<Arc<Ring<Event>>> {
            (0..settings.worker_count)
                .map(|index| Arc::new(Ring::new(format!("{family}-{index}"), power)))
                .collect()
        };
        Self {
            read: Arc::new(Ring::new("read", powers.read)),
            decoded: Arc::new(Ring::new("decoded", powers.read)),
            logic: per_worker("logic", powers.logic),
            cluster: Arc::new(Ring::new("cluster", powers.cluster)),
            outbound: per_worker("outbound", powers.write),
            wire: Arc::new(Ring::new("wire", powers.write)),
            errors: Arc::new(Ring::new("errors", powers.error)),
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<Ring<Event>>> {
        [&self.read, &self.decoded, &self.cluster, &self.wire, &self.errors]
            .into_iter()
            .chain(self.logic.iter())
            .chain(self.outbound.iter())
    }

    /// Wakes and stops every stage.
    pub fn halt(&self) {
        for ring in self.all() {
            ring.halt();
        }
    }
}

/// Collaborators the stages are built from.
pub struct PipelineParts {
    pub chain: Arc<FilterChain>,
    pub logic: Arc<dyn LogicHandler>,
    pub consistency: Arc<ConsistencyService>,
    pub consensus: Arc<dyn Consensus>,
    pub sessions: Arc<SessionRegistry>,
}

pub struct Pipeline {
    rings: PipelineRings,
    stages: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Spawns one thread per stage.
    pub fn start(
        settings: &PipelineSettings,
        raft: &RaftSettings,
        rings: PipelineRings,
        parts: PipelineParts,
    ) -> Result<Self> {
        let backoff = Backoff {
            yield_threshold: settings.yield_threshold,
            park: settings.park_interval(),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            rings.logic.clone(),
            Arc::clone(&parts.consistency),
            Arc::clone(&parts.consensus),
            settings.cluster_mode,
            settings.reserved_slots,
            settings.park_interval() * 50,
        ));

        let pipeline = Self {
            rings,
            stages: Mutex::new(Vec::new()),
        };
        let spawned = pipeline.spawn_stages(backoff, raft, &parts, dispatcher);
        if let Err(err) = spawned {
            pipeline.shutdown();
            return Err(err);
        }
        info!(
            workers = settings.worker_count,
            cluster_mode = settings.cluster_mode,
            "pipeline started"
        );
        Ok(pipeline)
    }

    fn spawn_stages(
        &self,
        backoff: Backoff,
        raft: &RaftSettings,
        parts: &PipelineParts,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<()> {
        let rings = &self.rings;
        let mut stages = self.stages.lock();
        stages.push(spawn(
            "read-decode",
            vec![Arc::clone(&rings.read)],
            ReadDecode::new(
                Arc::clone(&parts.chain),
                Arc::clone(&rings.decoded),
                Arc::clone(&rings.errors),
            ),
            backoff,
        )?);
        stages.push(spawn(
            "decoded-dispatch",
            vec![Arc::clone(&rings.decoded)],
            DecodedDispatch::new(Arc::clone(&dispatcher), Arc::clone(&rings.errors)),
            backoff,
        )?);
        for (index, (input, output)) in rings.logic.iter().zip(&rings.outbound).enumerate() {
            stages.push(spawn(
                &format!("logic-{index}"),
                vec![Arc::clone(input)],
                LogicWorker::new(index, Arc::clone(&parts.logic), Arc::clone(output)),
                backoff,
            )?);
        }
        stages.push(spawn(
            "cluster-single",
            vec![Arc::clone(&rings.cluster)],
            ClusterSingle::new(
                parts.consistency.node_id(),
                Arc::clone(&parts.consensus),
                Arc::clone(&parts.logic),
                Arc::clone(&parts.sessions),
                dispatcher,
                raft.proposal_timeout(),
                rings.cluster.capacity(),
            ),
            backoff,
        )?);
        stages.push(spawn(
            "write-encode",
            rings.outbound.clone(),
            WriteEncode::new(
                Arc::clone(&parts.chain),
                Arc::clone(&rings.wire),
                Arc::clone(&rings.errors),
            ),
            backoff,
        )?);
        stages.push(spawn(
            "write-dispatch",
            vec![Arc::clone(&rings.wire)],
            WriteDispatch::new(),
            backoff,
        )?);
        stages.push(spawn(
            "error-consumer",
            vec![Arc::clone(&rings.errors)],
            ErrorConsumer::new(),
            backoff,
        )?);
        Ok(())
    }

    pub fn rings(&self) -> &PipelineRings {
        &self.rings
    }

    /// Publishes bytes read from `session` without waiting for space.
    pub fn try_inbound(&self, session: &Arc<Session>, bytes: Bytes) -> Result<(), RingError> {
        self.rings
            .read
            .produce(Event::for_session(session, EventContent::Inbound(bytes)))
            .map(|_| ())
    }

    /// Publishes the close marker for `session` without waiting for space.
    pub fn try_closed(&self, session: &Arc<Session>) -> Result<(), RingError> {
        self.rings
            .read
            .produce(Event::for_session(session, EventContent::Closed))
            .map(|_| ())
    }

    /// Halts every ring and joins the stage threads. Idempotent.
    pub fn shutdown(&self) {
        self.rings.halt();
        let stages = std::mem::take(&mut *self.stages.lock());
        for stage in stages {
            if stage.join().is_err() {
                warn!("pipeline stage panicked");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn<H: EventHandler + 'static>(
    name: &str,
    inputs: Vec<Arc<Ring<Event>>>,
    handler: H,
    backoff: Backoff,
) -> Result<JoinHandle<()>> {
    StageProcessor::new(name, inputs, handler, backoff).spawn()
}

/// Pushes a session event to the next stage. A halted ring drops it.
fn forward(ring: &Ring<Event>, session: &Arc<Session>, content: EventContent) {
    let event = Event::for_session(session, content);
    let kind = event.kind();
    if let Err(err) = ring.push(event) {
        debug!(
            ring = ring.name(),
            session = session.id(),
            kind,
            error = %err,
            "ring unavailable, dropping"
        );
    }
}

/// Sends a session-scoped fault to the error consumer.
fn report(errors: &Ring<Event>, session: &Arc<Session>, fault: Fault) {
    if let Err(err) = errors.push(Event::for_session(session, EventContent::Fault(fault))) {
        warn!(session = session.id(), error = %err, "error ring unavailable");
    }
}
