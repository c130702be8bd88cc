//! Routes decoded commands to a logic worker or to the cluster stage.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::command::Routed;
use crate::consistency::{Consensus, ConsistencyService, RejectReason, SubmitStatus};
use crate::error::RingError;
use crate::event::{Event, EventContent, Fault};
use crate::ring::Ring;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Worker(usize),
    Cluster,
}

pub struct Dispatcher {
    workers: Vec<Arc<Ring<Event>>>,
    consistency: Arc<ConsistencyService>,
    consensus: Arc<dyn Consensus>,
    cluster_mode: bool,
    reserved_slots: usize,
    patience: Duration,
}

impl Dispatcher {
    pub fn new(
        workers: Vec<Arc<Ring<Event>>>,
        consistency: Arc<ConsistencyService>,
        consensus: Arc<dyn Consensus>,
        cluster_mode: bool,
        reserved_slots: usize,
        patience: Duration,
    ) -> Self {
        Self {
            workers,
            consistency,
            consensus,
            cluster_mode,
            reserved_slots,
            patience,
        }
    }

    /// Worker pinned to `session` for its whole lifetime.
    pub fn worker_for(&self, session: &Session) -> usize {
        let mut hasher = DefaultHasher::new();
        session.affinity_key().hash(&mut hasher);
        (hasher.finish() % self.workers.len() as u64) as usize
    }

    pub fn route(&self, session: &Session, routed: &Routed) -> Destination {
        if self.cluster_mode && routed.is_consensus() {
            Destination::Cluster
        } else {
            Destination::Worker(self.worker_for(session))
        }
    }

    /// Ring of the worker pinned to `session`.
    pub fn worker_ring(&self, session: &Session) -> &Arc<Ring<Event>> {
        &self.workers[self.worker_for(session)]
    }

    /// Hands `routed` to its destination. A worker ring that stays full past
    /// the patience window turns into an `Overloaded` fault for the caller to
    /// report.
    pub fn dispatch(&self, session: &Arc<Session>, routed: Routed) -> Result<(), Fault> {
        match self.route(session, &routed) {
            Destination::Worker(index) => {
                let priority = routed.command().priority();
                let event = Event::for_session(session, EventContent::Decoded(routed));
                match self.workers[index].offer(
                    event,
                    priority,
                    self.reserved_slots,
                    Some(self.patience),
                ) {
                    Ok(_) | Err(RingError::Halted) => Ok(()),
                    Err(RingError::Full) => Err(Fault::Overloaded { stage: "dispatch" }),
                }
            }
            Destination::Cluster => {
                let command = routed.into_command();
                let serial = command.serial();
                let status = self.consistency.submit(
                    session,
                    &command,
                    self.consensus.as_ref(),
                    |status| self.reject(session, serial, status),
                );
                if status == SubmitStatus::NotInCongress {
                    self.reject(session, serial, status);
                }
                Ok(())
            }
        }
    }

    /// Sends a `Rejected` event to the session's worker so the client gets an
    /// answer in order with its other replies.
    fn reject(&self, session: &Arc<Session>, serial: u16, status: SubmitStatus) {
        debug!(session = session.id(), serial, ?status, "consensus command rejected");
        let event = Event::for_session(
            session,
            EventContent::Rejected {
                serial,
                reason: RejectReason::from(status),
            },
        );
        if let Err(err) = self.worker_ring(session).push(event) {
            debug!(
                session = session.id(),
                serial,
                error = %err,
                "worker ring gone, rejection dropped"
            );
        }
    }
}
