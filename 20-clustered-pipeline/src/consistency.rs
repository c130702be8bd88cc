//! Submission path from the pipeline into cluster consensus, and the commit
//! path back out.
//!
//! Local submitters (the dispatch stage) hand consensus commands to
//! [`ConsistencyService::submit`], which claims, fills and publishes a slot
//! of the cluster ring under one lock. The cluster stage consumes that ring,
//! proposes to raft, and receives commits through a [`CommitForwarder`] that
//! feeds them into the same ring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::Command;
use crate::error::RingError;
use crate::event::{Event, EventContent};
use crate::raft::{CommitSink, NodeId, RaftHandle, RaftState};
use crate::ring::Ring;
use crate::session::{Session, SessionId};

/// Pause between claim attempts while a commit waits for cluster ring space.
const COMMIT_RETRY: Duration = Duration::from_micros(50);

/// Outcome of a local submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Accepted,
    /// This node is not a voting member; nothing was written.
    NotInCongress,
    /// The cluster ring had no free slot.
    Busy,
}

/// Why a consensus command was answered with `REJECTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    NotInCongress = 1,
    Busy = 2,
    /// Raft refused the proposal (no leader known, worker stopped).
    Unavailable = 3,
    /// No commit arrived in time. The command may still commit later.
    Timeout = 4,
    /// The payload could not be decoded.
    Invalid = 5,
}

impl From<SubmitStatus> for RejectReason {
    fn from(status: SubmitStatus) -> Self {
        match status {
            SubmitStatus::NotInCongress => RejectReason::NotInCongress,
            SubmitStatus::Busy | SubmitStatus::Accepted => RejectReason::Busy,
        }
    }
}

/// A consensus command as it is stored in the raft log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Unique per origin node; lets the origin match a commit to its
    /// in-flight proposal.
    pub id: u64,
    pub origin_node: NodeId,
    pub origin_session: SessionId,
    pub serial: u16,
    pub payload: Vec<u8>,
}

impl Proposal {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn command(&self) -> Command {
        Command::new(self.serial, Bytes::copy_from_slice(&self.payload))
    }
}

/// The local view of cluster consensus the pipeline needs.
pub trait Consensus: Send + Sync {
    fn role(&self) -> RaftState;

    /// Hands `data` to raft. Success means appended or forwarded, not committed.
    fn propose(&self, data: Vec<u8>) -> Result<()>;
}

impl Consensus for RaftHandle {
    fn role(&self) -> RaftState {
        self.status().role
    }

    fn propose(&self, data: Vec<u8>) -> Result<()> {
        RaftHandle::propose(self, data).map(|_| ())
    }
}

pub struct ConsistencyService {
    node_id: NodeId,
    ring: Arc<Ring<Event>>,
    submit_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl ConsistencyService {
    pub fn new(node_id: NodeId, ring: Arc<Ring<Event>>) -> Self {
        Self {
            node_id,
            ring,
            submit_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Queues `command` from `session` for the cluster stage.
    ///
    /// The congress check happens before any ring access, so a node outside
    /// the voting membership never writes. `reject` runs when the ring is
    /// full; the caller owns what happens to the session then.
    pub fn submit(
        &self,
        session: &Arc<Session>,
        command: &Command,
        node: &dyn Consensus,
        reject: impl FnOnce(SubmitStatus),
    ) -> SubmitStatus {
        if !node.role().is_in_congress() {
            return SubmitStatus::NotInCongress;
        }

        let proposal = Proposal {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            origin_node: self.node_id,
            origin_session: session.id(),
            serial: command.serial(),
            payload: command.payload().to_vec(),
        };

        let claimed = {
            let _guard = self.submit_lock.lock();
            self.ring.claim().map(|sequence| {
                *self.ring.slot(sequence) =
                    Event::for_session(session, EventContent::Proposal(proposal));
                self.ring.publish(sequence);
            })
        };

        match claimed {
            Ok(()) => SubmitStatus::Accepted,
            Err(err) => {
                debug!(session = session.id(), error = %err, "cluster ring refused proposal");
                reject(SubmitStatus::Busy);
                SubmitStatus::Busy
            }
        }
    }

    /// Publishes a committed log entry for the cluster stage, waiting for
    /// space while the ring runs. The submission lock is only held for one
    /// claim attempt, so local submitters still see `Busy` on a full ring.
    pub fn committed(&self, index: u64, data: Vec<u8>) {
        let proposal = match Proposal::decode(&data) {
            Ok(proposal) => proposal,
            Err(err) => {
                warn!(index, error = %err, "committed entry is not a proposal");
                return;
            }
        };
        let mut event = Event::new(None, EventContent::Committed { index, proposal });
        let mut attempts = 0u32;
        loop {
            let claimed = {
                let _guard = self.submit_lock.lock();
                self.ring.claim().map(|sequence| {
                    *self.ring.slot(sequence) = std::mem::take(&mut event);
                    self.ring.publish(sequence);
                })
            };
            match claimed {
                Ok(()) => return,
                Err(RingError::Full) => {
                    attempts += 1;
                    if attempts < 64 {
                        thread::yield_now();
                    } else {
                        thread::sleep(COMMIT_RETRY);
                    }
                }
                Err(err) => {
                    debug!(index, error = %err, "dropping commit after halt");
                    return;
                }
            }
        }
    }

    /// Starts the relay thread that moves commits from raft into the cluster
    /// ring, returning the sink to hand to the raft runtime.
    ///
    /// The relay exits once the sink is dropped, which happens when the raft
    /// worker stops. The raft worker itself never waits on the ring.
    pub fn spawn_commit_relay(self: &Arc<Self>) -> Result<(CommitForwarder, JoinHandle<()>)> {
        let (tx, rx) = unbounded::<(u64, Vec<u8>)>();
        let service = Arc::clone(self);
        let relay = thread::Builder::new()
            .name(format!("commit-relay-{}", self.node_id))
            .spawn(move || {
                for (index, data) in rx {
                    service.committed(index, data);
                }
                debug!(node_id = service.node_id, "commit relay stopped");
            })
            .context("failed to spawn commit relay")?;
        Ok((CommitForwarder { tx }, relay))
    }
}

/// [`CommitSink`] handed to the raft runtime.
pub struct CommitForwarder {
    tx: Sender<(u64, Vec<u8>)>,
}

impl CommitSink for CommitForwarder {
    fn committed(&mut self, index: u64, data: Vec<u8>) {
        if self.tx.send((index, data)).is_err() {
            debug!(index, "commit relay gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::serial;
    use tokio::sync::mpsc::unbounded_channel;

    struct FixedRole(RaftState);

    impl Consensus for FixedRole {
        fn role(&self) -> RaftState {
            self.0
        }

        fn propose(&self, _data: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    fn session(id: SessionId) -> Arc<Session> {
        let (tx, _rx) = unbounded_channel();
        Arc::new(Session::new(id, None, tx))
    }

    fn put() -> Command {
        Command::new(serial::PUT, Bytes::from_static(b"kv"))
    }

    #[test]
    fn outside_congress_is_a_no_op() {
        let ring = Arc::new(Ring::new("cluster", 2));
        let service = ConsistencyService::new(1, Arc::clone(&ring));
        let mut rejected = false;
        for role in [RaftState::CLIENT, RaftState::CANDIDATE] {
            let status = service.submit(&session(1), &put(), &FixedRole(role), |_| rejected = true);
            assert_eq!(status, SubmitStatus::NotInCongress);
        }
        assert!(!rejected);
        assert_eq!(ring.claimed(), -1);
    }

    #[test]
    fn accepted_proposal_carries_origin() {
        let ring = Arc::new(Ring::new("cluster", 2));
        let service = ConsistencyService::new(3, Arc::clone(&ring));
        let origin = session(9);
        let status = service.submit(&origin, &put(), &FixedRole(RaftState::FOLLOWER), |_| {
            panic!("must not reject")
        });
        assert_eq!(status, SubmitStatus::Accepted);

        let event = ring.take(0);
        assert_eq!(event.session.as_ref().map(|s| s.id()), Some(9));
        match event.content {
            EventContent::Proposal(proposal) => {
                assert_eq!(proposal.origin_node, 3);
                assert_eq!(proposal.origin_session, 9);
                assert_eq!(proposal.command(), put());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn full_ring_calls_reject_handler() {
        let ring = Arc::new(Ring::new("cluster", 1));
        let service = ConsistencyService::new(1, Arc::clone(&ring));
        let leader = FixedRole(RaftState::LEADER);
        let origin = session(1);
        for _ in 0..2 {
            assert_eq!(
                service.submit(&origin, &put(), &leader, |_| {}),
                SubmitStatus::Accepted
            );
        }
        let mut seen = None;
        let status = service.submit(&origin, &put(), &leader, |status| seen = Some(status));
        assert_eq!(status, SubmitStatus::Busy);
        assert_eq!(seen, Some(SubmitStatus::Busy));
    }

    #[test]
    fn pending_commit_leaves_submit_fail_fast() {
        let ring = Arc::new(Ring::new("cluster", 1));
        let service = Arc::new(ConsistencyService::new(1, Arc::clone(&ring)));
        let leader = FixedRole(RaftState::LEADER);
        let origin = session(1);
        for _ in 0..2 {
            assert_eq!(
                service.submit(&origin, &put(), &leader, |_| {}),
                SubmitStatus::Accepted
            );
        }

        let commit = {
            let service = Arc::clone(&service);
            let proposal = Proposal {
                id: 7,
                origin_node: 2,
                origin_session: 3,
                serial: serial::PUT,
                payload: vec![1],
            };
            thread::spawn(move || service.committed(5, proposal.encode().unwrap()))
        };
        thread::sleep(Duration::from_millis(20));

        let started = std::time::Instant::now();
        let status = service.submit(&origin, &put(), &leader, |_| {});
        assert_eq!(status, SubmitStatus::Busy);
        assert!(started.elapsed() < Duration::from_millis(200));

        // Freeing a slot lets the waiting commit through.
        ring.take(0);
        ring.release(0);
        commit.join().unwrap();
        match ring.take(2).content {
            EventContent::Committed { index, proposal } => {
                assert_eq!(index, 5);
                assert_eq!(proposal.id, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn relay_publishes_commits_in_order() {
        let ring = Arc::new(Ring::new("cluster", 3));
        let service = Arc::new(ConsistencyService::new(1, Arc::clone(&ring)));
        let (mut sink, relay) = service.spawn_commit_relay().unwrap();

        for id in 1..=3u64 {
            let proposal = Proposal {
                id,
                origin_node: 1,
                origin_session: 4,
                serial: serial::PUT,
                payload: vec![id as u8],
            };
            sink.committed(id + 10, proposal.encode().unwrap());
        }
        sink.committed(99, b"not bincode".to_vec());
        drop(sink);
        relay.join().unwrap();

        assert_eq!(ring.wait_for(2, Duration::from_secs(1)), Ok(2));
        for sequence in 0..3 {
            match ring.take(sequence).content {
                EventContent::Committed { index, proposal } => {
                    assert_eq!(index, sequence as u64 + 11);
                    assert_eq!(proposal.id, sequence as u64 + 1);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(ring.claimed(), 2);
    }
}
