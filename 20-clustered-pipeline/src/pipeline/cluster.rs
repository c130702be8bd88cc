use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command::{serial, Command, RaftNotify};
use crate::consistency::{Consensus, Proposal, RejectReason};
use crate::dispatch::Dispatcher;
use crate::event::{Event, EventContent};
use crate::logic::LogicHandler;
use crate::raft::NodeId;
use crate::ring::Sequence;
use crate::session::{Session, SessionRegistry};
use crate::stage::EventHandler;

struct InFlight {
    proposal_id: u64,
    session: Arc<Session>,
    serial: u16,
    started: Instant,
}

/// The single consumer of the cluster ring.
///
/// Proposals from local sessions are handed to raft one at a time; the next
/// one starts when the previous commits or times out. At most `max_queued`
/// proposals wait behind it; the rest are rejected as busy. Commits, from
/// any node, are applied in log order and turned into notifications for the
/// session workers.
pub struct ClusterSingle {
    node_id: NodeId,
    consensus: Arc<dyn Consensus>,
    logic: Arc<dyn LogicHandler>,
    sessions: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    timeout: Duration,
    max_queued: usize,
    queue: VecDeque<(Arc<Session>, Proposal)>,
    in_flight: Option<InFlight>,
    applied: u64,
}

impl ClusterSingle {
    pub fn new(
        node_id: NodeId,
        consensus: Arc<dyn Consensus>,
        logic: Arc<dyn LogicHandler>,
        sessions: Arc<SessionRegistry>,
        dispatcher: Arc<Dispatcher>,
        timeout: Duration,
        max_queued: usize,
    ) -> Self {
        Self {
            node_id,
            consensus,
            logic,
            sessions,
            dispatcher,
            timeout,
            max_queued,
            queue: VecDeque::with_capacity(max_queued),
            in_flight: None,
            applied: 0,
        }
    }

    fn enqueue(&mut self, session: Arc<Session>, proposal: Proposal) {
        if self.queue.len() >= self.max_queued {
            debug!(
                proposal = proposal.id,
                session = session.id(),
                queued = self.queue.len(),
                "proposal queue full"
            );
            self.reject(&session, proposal.serial, RejectReason::Busy);
            return;
        }
        self.queue.push_back((session, proposal));
        self.start_next();
    }

    fn start_next(&mut self) {
        while self.in_flight.is_none() {
            let Some((session, proposal)) = self.queue.pop_front() else {
                return;
            };
            if session.is_closed() {
                continue;
            }
            let proposed = proposal
                .encode()
                .map_err(anyhow::Error::from)
                .and_then(|data| self.consensus.propose(data));
            match proposed {
                Ok(()) => {
                    debug!(proposal = proposal.id, session = session.id(), "proposal in flight");
                    self.in_flight = Some(InFlight {
                        proposal_id: proposal.id,
                        session,
                        serial: proposal.serial,
                        started: Instant::now(),
                    });
                }
                Err(err) => {
                    debug!(proposal = proposal.id, error = %err, "raft refused proposal");
                    self.reject(&session, proposal.serial, RejectReason::Unavailable);
                }
            }
        }
    }

    fn apply(&mut self, index: u64, proposal: Proposal) {
        if index <= self.applied {
            warn!(index, applied = self.applied, "commit replayed, skipping");
            return;
        }
        self.applied = index;

        let applied = self.logic.apply_committed(&proposal.command());
        let notify = RaftNotify {
            payload_serial: proposal.serial,
            notify_all: applied.notify_all,
            origin: proposal.origin_session,
            result: applied.result,
        }
        .to_command();

        if notify.serial() == serial::RAFT_NOTIFY_ALL {
            for session in self.sessions.established() {
                self.notify(&session, notify.clone());
            }
        } else if proposal.origin_node == self.node_id {
            if let Some(session) = self.sessions.get(proposal.origin_session) {
                self.notify(&session, notify);
            }
        }

        let finished = proposal.origin_node == self.node_id
            && self
                .in_flight
                .as_ref()
                .is_some_and(|in_flight| in_flight.proposal_id == proposal.id);
        if finished {
            self.in_flight = None;
            self.start_next();
        }
    }

    fn notify(&self, session: &Arc<Session>, notify: Command) {
        self.send(session, EventContent::Notify(notify));
    }

    fn reject(&self, session: &Arc<Session>, serial: u16, reason: RejectReason) {
        self.send(session, EventContent::Rejected { serial, reason });
    }

    fn send(&self, session: &Arc<Session>, content: EventContent) {
        let event = Event::for_session(session, content);
        let kind = event.kind();
        if let Err(err) = self.dispatcher.worker_ring(session).push(event) {
            debug!(session = session.id(), kind, error = %err, "worker ring gone, dropping");
        }
    }

    fn check_timeout(&mut self) {
        let expired = self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.started.elapsed() >= self.timeout);
        if !expired {
            return;
        }
        if let Some(in_flight) = self.in_flight.take() {
            info!(
                proposal = in_flight.proposal_id,
                session = in_flight.session.id(),
                "proposal timed out"
            );
            self.reject(&in_flight.session, in_flight.serial, RejectReason::Timeout);
        }
        self.start_next();
    }
}

impl EventHandler for ClusterSingle {
    fn on_event(&mut self, event: Event, _sequence: Sequence, end_of_batch: bool) {
        if event.is_live() {
            let kind = event.kind();
            match event.content {
                EventContent::Proposal(proposal) => {
                    if let Some(session) = event.session {
                        self.enqueue(session, proposal);
                    }
                }
                EventContent::Committed { index, proposal } => self.apply(index, proposal),
                _ => debug!(kind, "unexpected event on cluster ring"),
            }
        }
        if end_of_batch {
            self.check_timeout();
        }
    }

    fn on_idle(&mut self) {
        self.check_timeout();
    }

    fn on_shutdown(&mut self) {
        if !self.queue.is_empty() || self.in_flight.is_some() {
            debug!(
                queued = self.queue.len(),
                in_flight = self.in_flight.is_some(),
                "cluster stage stopped with pending proposals"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::ConsistencyService;
    use crate::logic::KvLogic;
    use crate::raft::RaftState;
    use crate::ring::Ring;
    use crate::session::handshake;
    use crate::store::{MemoryStorage, Storage};
    use anyhow::{bail, Result};
    use parking_lot::Mutex;
    use tokio::sync::mpsc::unbounded_channel;

    const NODE: NodeId = 1;

    /// Records every proposal handed to raft.
    #[derive(Default)]
    struct Recorder {
        proposed: Mutex<Vec<Proposal>>,
        refuse: bool,
    }

    impl Recorder {
        fn ids(&self) -> Vec<u64> {
            self.proposed.lock().iter().map(|proposal| proposal.id).collect()
        }
    }

    impl Consensus for Recorder {
        fn role(&self) -> RaftState {
            RaftState::LEADER
        }

        fn propose(&self, data: Vec<u8>) -> Result<()> {
            if self.refuse {
                bail!("no leader");
            }
            self.proposed.lock().push(Proposal::decode(&data)?);
            Ok(())
        }
    }

    struct Fixture {
        stage: ClusterSingle,
        raft: Arc<Recorder>,
        workers: Vec<Arc<Ring<Event>>>,
        sessions: Arc<SessionRegistry>,
        storage: Arc<MemoryStorage>,
    }

    fn fixture(raft: Recorder, timeout: Duration, max_queued: usize) -> Fixture {
        let raft = Arc::new(raft);
        let workers: Vec<Arc<Ring<Event>>> = (0..2)
            .map(|i| Arc::new(Ring::new(format!("logic-{i}"), 4)))
            .collect();
        let cluster = Arc::new(Ring::new("cluster", 4));
        let consistency = Arc::new(ConsistencyService::new(NODE, cluster));
        let dispatcher = Arc::new(Dispatcher::new(
            workers.clone(),
            consistency,
            Arc::clone(&raft) as Arc<dyn Consensus>,
            true,
            0,
            Duration::from_millis(5),
        ));
        let storage = Arc::new(MemoryStorage::new());
        let logic = Arc::new(KvLogic::new(Arc::clone(&storage) as Arc<dyn Storage>, Vec::new()));
        let sessions = Arc::new(SessionRegistry::new());
        let stage = ClusterSingle::new(
            NODE,
            Arc::clone(&raft) as Arc<dyn Consensus>,
            logic,
            Arc::clone(&sessions),
            dispatcher,
            timeout,
            max_queued,
        );
        Fixture {
            stage,
            raft,
            workers,
            sessions,
            storage,
        }
    }

    impl Fixture {
        fn session(&self, id: u64) -> Arc<Session> {
            let (tx, _rx) = unbounded_channel();
            let session = Arc::new(Session::new(id, None, tx));
            session.context().mark(handshake::PROTOCOL_DETECTED);
            self.sessions.insert(Arc::clone(&session));
            session
        }

        fn propose(&mut self, session: &Arc<Session>, id: u64, serial: u16, payload: &[u8]) {
            let proposal = Proposal {
                id,
                origin_node: NODE,
                origin_session: session.id(),
                serial,
                payload: payload.to_vec(),
            };
            self.stage
                .on_event(Event::for_session(session, EventContent::Proposal(proposal)), 0, false);
        }

        fn commit(&mut self, index: u64, proposal: Proposal) {
            self.stage
                .on_event(Event::new(None, EventContent::Committed { index, proposal }), 0, false);
        }

        /// Drains every worker ring, keeping the session each event is for.
        fn delivered_all(&self) -> Vec<(u64, EventContent)> {
            let mut out = Vec::new();
            for ring in &self.workers {
                let first = ring.released() + 1;
                let claimed = ring.claimed();
                for sequence in first..=claimed {
                    let event = ring.take(sequence);
                    let id = event.session.as_ref().map_or(0, |session| session.id());
                    out.push((id, event.content));
                }
                if claimed >= first {
                    ring.release(claimed);
                }
            }
            out
        }

        fn delivered(&self, session: &Session) -> Vec<EventContent> {
            self.delivered_all()
                .into_iter()
                .filter(|(id, _)| *id == session.id())
                .map(|(_, content)| content)
                .collect()
        }
    }

    fn put(key: &str, value: &str) -> Vec<u8> {
        bincode::serialize(&crate::logic::PutRequest {
            key: key.into(),
            value: value.into(),
        })
        .unwrap()
    }

    fn notify_of(content: &EventContent) -> RaftNotify {
        match content {
            EventContent::Notify(command) => RaftNotify::from_command(command).unwrap(),
            other => panic!("expected notify, got {other:?}"),
        }
    }

    #[test]
    fn one_proposal_in_flight_until_it_commits() {
        let mut fx = fixture(Recorder::default(), Duration::from_secs(60), 8);
        let session = fx.session(1);
        fx.propose(&session, 10, serial::PUT, &put("a", "1"));
        fx.propose(&session, 11, serial::PUT, &put("b", "2"));
        assert_eq!(fx.raft.ids(), vec![10]);

        let first = fx.raft.proposed.lock()[0].clone();
        fx.commit(1, first);
        assert_eq!(fx.raft.ids(), vec![10, 11]);
        assert_eq!(fx.storage.query("a").as_deref(), Some("1"));

        let delivered = fx.delivered(&session);
        assert_eq!(delivered.len(), 1);
        let notify = notify_of(&delivered[0]);
        assert_eq!(notify.payload_serial, serial::PUT);
        assert!(!notify.notify_all);
        assert_eq!(notify.origin, 1);
    }

    #[test]
    fn stalled_proposal_is_rejected_and_next_starts() {
        let mut fx = fixture(Recorder::default(), Duration::ZERO, 8);
        let session = fx.session(1);
        fx.propose(&session, 10, serial::PUT, &put("a", "1"));
        fx.propose(&session, 11, serial::PUT, &put("b", "2"));
        fx.stage.on_idle();
        assert_eq!(fx.raft.ids(), vec![10, 11]);

        let delivered = fx.delivered(&session);
        assert!(matches!(
            delivered.as_slice(),
            [EventContent::Rejected {
                serial: serial::PUT,
                reason: RejectReason::Timeout
            }]
        ));
    }

    #[test]
    fn replayed_commit_is_applied_once() {
        let mut fx = fixture(Recorder::default(), Duration::from_secs(60), 8);
        let session = fx.session(1);
        let proposal = Proposal {
            id: 3,
            origin_node: NODE,
            origin_session: session.id(),
            serial: serial::PUT,
            payload: put("k", "v"),
        };
        fx.commit(4, proposal.clone());
        fx.commit(4, proposal.clone());
        fx.commit(2, proposal);
        assert_eq!(fx.delivered(&session).len(), 1);
    }

    #[test]
    fn announce_reaches_every_established_session() {
        let mut fx = fixture(Recorder::default(), Duration::from_secs(60), 8);
        let alice = fx.session(1);
        let bob = fx.session(2);
        fx.commit(
            1,
            Proposal {
                id: 1,
                origin_node: 7,
                origin_session: 99,
                serial: serial::ANNOUNCE,
                payload: b"hello".to_vec(),
            },
        );
        let delivered = fx.delivered_all();
        assert_eq!(delivered.len(), 2);
        for session in [&alice, &bob] {
            let (_, content) = delivered
                .iter()
                .find(|(id, _)| *id == session.id())
                .unwrap();
            let notify = notify_of(content);
            assert!(notify.notify_all);
            assert_eq!(notify.result.as_ref(), b"hello");
        }
    }

    #[test]
    fn remote_commit_only_updates_storage() {
        let mut fx = fixture(Recorder::default(), Duration::from_secs(60), 8);
        let session = fx.session(1);
        // Same session id, but it belongs to another node.
        fx.commit(
            1,
            Proposal {
                id: 1,
                origin_node: 2,
                origin_session: session.id(),
                serial: serial::PUT,
                payload: put("region", "north"),
            },
        );
        assert_eq!(fx.storage.query("region").as_deref(), Some("north"));
        assert!(fx.delivered(&session).is_empty());
    }

    #[test]
    fn full_queue_rejects_as_busy() {
        let mut fx = fixture(Recorder::default(), Duration::from_secs(60), 1);
        let session = fx.session(1);
        fx.propose(&session, 1, serial::PUT, &put("a", "1"));
        fx.propose(&session, 2, serial::PUT, &put("b", "2"));
        fx.propose(&session, 3, serial::PUT, &put("c", "3"));
        assert_eq!(fx.raft.ids(), vec![1]);

        let delivered = fx.delivered(&session);
        assert!(matches!(
            delivered.as_slice(),
            [EventContent::Rejected {
                reason: RejectReason::Busy,
                ..
            }]
        ));
    }

    #[test]
    fn refused_proposal_is_unavailable() {
        let raft = Recorder {
            refuse: true,
            ..Recorder::default()
        };
        let mut fx = fixture(raft, Duration::from_secs(60), 8);
        let session = fx.session(1);
        fx.propose(&session, 1, serial::ANNOUNCE, b"x");
        let delivered = fx.delivered(&session);
        assert!(matches!(
            delivered.as_slice(),
            [EventContent::Rejected {
                serial: serial::ANNOUNCE,
                reason: RejectReason::Unavailable
            }]
        ));
    }
}
