//! Deterministic raft state machine.
//!
//! `RaftCore` never touches the network, the clock or the disk. The runtime
//! feeds it ticks and peer messages, then drains a [`Ready`] holding the log
//! suffix and hard state to persist, the messages to send, and newly
//! committed entries. Tests drive whole clusters in memory the same way.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::log::{EntryKind, LogEntry, RaftLog};
use super::message::{RaftEnvelope, RaftMessage};
use super::role::{CoreRole, RaftState};
use super::topology::Membership;
use super::NodeId;
use crate::config::RaftSettings;
use crate::error::RaftError;

/// State that must survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub commit: u64,
    /// Last committed voting configuration.
    pub membership: Membership,
}

impl HardState {
    pub fn bootstrap(membership: Membership) -> Self {
        Self {
            membership,
            ..Self::default()
        }
    }
}

/// Log suffix to persist: storage drops every entry from index `from` on,
/// then appends `entries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogWrite {
    pub from: u64,
    pub entries: Vec<LogEntry>,
}

/// Output drained from the core after every interaction. The log write and
/// the hard state must be durable before the messages leave the node.
#[derive(Debug, Default)]
pub struct Ready {
    pub log: Option<LogWrite>,
    pub hard_state: Option<HardState>,
    pub messages: Vec<RaftEnvelope>,
    pub committed: Vec<LogEntry>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.log.is_none()
            && self.hard_state.is_none()
            && self.messages.is_empty()
            && self.committed.is_empty()
    }
}

/// Where a proposal went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposed {
    Appended { index: u64 },
    Forwarded { leader: NodeId },
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    next: u64,
    matched: u64,
}

pub struct RaftCore {
    id: NodeId,
    settings: RaftSettings,
    state: RaftState,
    gate: bool,
    hard: HardState,
    hard_dirty: bool,
    leader_id: Option<NodeId>,
    log: RaftLog,
    /// Entries up to here are persisted and still match the log.
    stable: u64,
    log_dirty: bool,
    /// Latest configuration in the log, falling back to the committed one.
    membership: Membership,
    election_elapsed: u32,
    election_timeout: u32,
    heartbeat_elapsed: u32,
    rng: StdRng,
    granted: BTreeSet<NodeId>,
    rejected: BTreeSet<NodeId>,
    progress: BTreeMap<NodeId, Progress>,
    applied: u64,
    outbox: Vec<RaftEnvelope>,
}

impl RaftCore {
    /// Restores a node from its persisted hard state and log.
    ///
    /// Committed entries are delivered again from index 1 on the first
    /// [`RaftCore::ready`], since the state machine they feed starts empty.
    pub fn new(
        id: NodeId,
        settings: RaftSettings,
        hard: HardState,
        log: RaftLog,
        gate: bool,
    ) -> Self {
        let membership = log
            .latest_config()
            .cloned()
            .unwrap_or_else(|| hard.membership.clone());
        let commit = hard.commit.min(log.last_index());
        let stable = log.last_index();
        let mut core = Self {
            id,
            settings,
            state: RaftState::CLIENT,
            gate,
            hard: HardState { commit, ..hard },
            hard_dirty: false,
            leader_id: None,
            log,
            stable,
            log_dirty: false,
            membership,
            election_elapsed: 0,
            election_timeout: 0,
            heartbeat_elapsed: 0,
            rng: StdRng::seed_from_u64(id),
            granted: BTreeSet::new(),
            rejected: BTreeSet::new(),
            progress: BTreeMap::new(),
            applied: 0,
            outbox: Vec::new(),
        };
        core.reset_election_timer();
        core.assume(CoreRole::Follower);
        core
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> RaftState {
        self.state
    }

    pub fn term(&self) -> u64 {
        self.hard.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.hard.voted_for
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> u64 {
        self.hard.commit
    }

    pub fn last_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) {
        if self.state.is_leader() {
            self.heartbeat_elapsed += 1;
            if self.heartbeat_elapsed >= self.settings.heartbeat_ticks {
                self.heartbeat_elapsed = 0;
                self.broadcast_append();
            }
            return;
        }
        if !self.state.is_in_congress() {
            return;
        }
        self.election_elapsed += 1;
        if self.election_elapsed >= self.election_timeout {
            debug!(
                node_id = self.id,
                term = self.hard.term,
                "election timeout"
            );
            self.campaign();
        }
    }

    /// Starts an election in a new term.
    pub fn campaign(&mut self) {
        if !self.membership.contains(self.id) {
            debug!(node_id = self.id, "not a voter, ignoring campaign");
            return;
        }
        self.hard.term += 1;
        self.hard.voted_for = Some(self.id);
        self.hard_dirty = true;
        self.leader_id = None;
        self.progress.clear();
        self.granted = BTreeSet::from([self.id]);
        self.rejected.clear();
        self.reset_election_timer();
        self.assume(CoreRole::Elector);
        info!(node_id = self.id, term = self.hard.term, "starting election");

        if self.membership.quorum_reached(&self.granted) {
            self.become_leader();
            return;
        }
        let term = self.hard.term;
        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        for peer in self.peers() {
            self.send(
                peer,
                RaftMessage::RequestVote {
                    term,
                    last_log_index,
                    last_log_term,
                },
            );
        }
    }

    /// Appends `data` when leading, otherwise hands it to the known leader.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<Proposed, RaftError> {
        if self.state.is_leader() {
            let index = self.append_local(EntryKind::Normal(data))?;
            self.broadcast_append();
            return Ok(Proposed::Appended { index });
        }
        match self.leader_id {
            Some(leader) => {
                let term = self.hard.term;
                self.send(leader, RaftMessage::Forward { term, data });
                Ok(Proposed::Forwarded { leader })
            }
            None => Err(RaftError::NoLeader {
                term: self.hard.term,
            }),
        }
    }

    /// Starts a joint-consensus change towards `next`. The final
    /// configuration is appended automatically once the joint one commits.
    pub fn propose_membership(&mut self, next: BTreeSet<NodeId>) -> Result<u64, RaftError> {
        if !self.state.is_leader() {
            return Err(RaftError::NotLeader {
                leader: self.leader_id,
            });
        }
        if self.membership.is_joint() || self.membership != self.hard.membership {
            return Err(RaftError::MembershipChangeInProgress);
        }
        let joint = self.membership.enter_joint(next);
        info!(
            node_id = self.id,
            current = ?joint.current,
            next = ?joint.joint,
            "entering joint configuration"
        );
        let index = self.append_local(EntryKind::Config(joint))?;
        self.broadcast_append();
        Ok(index)
    }

    pub fn step(&mut self, envelope: RaftEnvelope) {
        let RaftEnvelope { from, message, .. } = envelope;
        if message.term() > self.hard.term {
            let leader = matches!(message, RaftMessage::AppendEntries { .. }).then_some(from);
            info!(
                node_id = self.id,
                term = message.term(),
                from,
                kind = message.kind(),
                "observed higher term"
            );
            self.become_follower(message.term(), leader);
        }

        match message {
            RaftMessage::RequestVote {
                term,
                last_log_index,
                last_log_term,
            } => self.handle_request_vote(from, term, last_log_index, last_log_term),
            RaftMessage::Vote { term, granted } => self.handle_vote(from, term, granted),
            RaftMessage::AppendEntries {
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append(
                from,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RaftMessage::AppendResponse {
                term,
                success,
                hint,
            } => self.handle_append_response(from, term, success, hint),
            RaftMessage::Forward { data, .. } => self.handle_forward(from, data),
        }
    }

    pub fn has_ready(&self) -> bool {
        !self.outbox.is_empty()
            || self.hard_dirty
            || self.log_dirty
            || self.hard.commit > self.applied
    }

    pub fn ready(&mut self) -> Ready {
        let log = if std::mem::take(&mut self.log_dirty) {
            let from = self.stable + 1;
            let entries = self.log.entries_from(from, usize::MAX);
            self.stable = self.log.last_index();
            Some(LogWrite { from, entries })
        } else {
            None
        };
        let committed = (self.applied + 1..=self.hard.commit)
            .filter_map(|index| self.log.get(index).cloned())
            .collect();
        self.applied = self.applied.max(self.hard.commit);
        let hard_state = std::mem::take(&mut self.hard_dirty).then(|| self.hard.clone());
        Ready {
            log,
            hard_state,
            messages: std::mem::take(&mut self.outbox),
            committed,
        }
    }

    fn handle_request_vote(&mut self, from: NodeId, term: u64, last_index: u64, last_term: u64) {
        let granted = term == self.hard.term
            && self.hard.voted_for.map_or(true, |voted| voted == from)
            && self.membership.contains(from)
            && self.log.is_up_to_date(last_index, last_term);
        if granted {
            self.hard.voted_for = Some(from);
            self.hard_dirty = true;
            self.reset_election_timer();
        }
        debug!(node_id = self.id, term = self.hard.term, candidate = from, granted, "vote");
        let term = self.hard.term;
        self.send(from, RaftMessage::Vote { term, granted });
    }

    fn handle_vote(&mut self, from: NodeId, term: u64, granted: bool) {
        if self.state.core() != CoreRole::Elector || term != self.hard.term {
            return;
        }
        if granted {
            self.granted.insert(from);
        } else {
            self.rejected.insert(from);
        }
        if self.membership.quorum_reached(&self.granted) {
            self.become_leader();
        } else if self.membership.quorum_reached(&self.rejected) {
            info!(node_id = self.id, term = self.hard.term, "lost election");
            self.become_follower(self.hard.term, None);
        }
    }

    fn handle_append(
        &mut self,
        from: NodeId,
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) {
        if term < self.hard.term {
            let term = self.hard.term;
            self.send(
                from,
                RaftMessage::AppendResponse {
                    term,
                    success: false,
                    hint: 0,
                },
            );
            return;
        }
        if matches!(self.state.core(), CoreRole::Elector | CoreRole::Leader) {
            self.become_follower(term, Some(from));
        } else {
            self.leader_id = Some(from);
            self.reset_election_timer();
        }

        if !self.log.matches(prev_index, prev_term) {
            let hint = match self.log.term_at(prev_index) {
                Some(conflict) => self.log.first_index_of_term(conflict, prev_index),
                None => self.log.last_index() + 1,
            };
            self.send(
                from,
                RaftMessage::AppendResponse {
                    term,
                    success: false,
                    hint,
                },
            );
            return;
        }

        let last_new = prev_index + entries.len() as u64;
        let mut config_changed = false;
        for entry in entries {
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    debug!(node_id = self.id, index = entry.index, "truncating conflicting suffix");
                    self.log.truncate_from(entry.index);
                    self.stable = self.stable.min(entry.index - 1);
                    self.log_dirty = true;
                    config_changed = true;
                }
                None => {}
            }
            config_changed |= matches!(entry.kind, EntryKind::Config(_));
            if let Err(err) = self.log.append(entry) {
                warn!(node_id = self.id, error = %err, "dropping append");
                break;
            }
            self.log_dirty = true;
        }
        if config_changed {
            self.refresh_membership();
        }
        let commit = leader_commit.min(last_new);
        if commit > self.hard.commit {
            self.advance_commit(commit);
        }
        self.send(
            from,
            RaftMessage::AppendResponse {
                term,
                success: true,
                hint: last_new,
            },
        );
    }

    fn handle_append_response(&mut self, from: NodeId, term: u64, success: bool, hint: u64) {
        if !self.state.is_leader() || term != self.hard.term {
            return;
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return;
        };
        if success {
            progress.matched = progress.matched.max(hint);
            progress.next = progress.matched + 1;
            let behind = progress.next <= last_index;
            self.maybe_commit();
            if behind {
                self.send_append(from);
            }
        } else {
            progress.next = if hint >= 1 && hint < progress.next {
                hint
            } else {
                progress.next.saturating_sub(1).max(1)
            };
            self.send_append(from);
        }
    }

    fn handle_forward(&mut self, from: NodeId, data: Vec<u8>) {
        if self.state.is_leader() {
            if let Err(err) = self.propose(data) {
                warn!(node_id = self.id, from, error = %err, "forwarded proposal dropped");
            }
            return;
        }
        match self.leader_id {
            Some(leader) if leader != from => {
                let term = self.hard.term;
                self.send(leader, RaftMessage::Forward { term, data });
            }
            _ => debug!(node_id = self.id, from, "no leader for forwarded proposal"),
        }
    }

    fn become_follower(&mut self, term: u64, leader: Option<NodeId>) {
        if term > self.hard.term {
            self.hard.term = term;
            self.hard.voted_for = None;
            self.hard_dirty = true;
        }
        self.leader_id = leader;
        self.granted.clear();
        self.rejected.clear();
        self.progress.clear();
        self.reset_election_timer();
        self.assume(CoreRole::Follower);
    }

    fn become_leader(&mut self) {
        self.leader_id = Some(self.id);
        self.heartbeat_elapsed = 0;
        self.assume(CoreRole::Leader);
        let next = self.log.last_index() + 1;
        self.progress = self
            .peers()
            .into_iter()
            .map(|peer| (peer, Progress { next, matched: 0 }))
            .collect();
        info!(node_id = self.id, term = self.hard.term, "became leader");
        if let Err(err) = self.append_local(EntryKind::Noop) {
            warn!(node_id = self.id, error = %err, "failed to append leader no-op");
        }
        self.broadcast_append();
    }

    fn append_local(&mut self, kind: EntryKind) -> Result<u64, RaftError> {
        let index = self.log.last_index() + 1;
        let is_config = matches!(kind, EntryKind::Config(_));
        self.log.append(LogEntry {
            term: self.hard.term,
            index,
            kind,
        })?;
        self.log_dirty = true;
        if is_config {
            self.refresh_membership();
        }
        self.maybe_commit();
        Ok(index)
    }

    fn maybe_commit(&mut self) {
        if !self.state.is_leader() {
            return;
        }
        let mut matched: BTreeMap<NodeId, u64> = self
            .progress
            .iter()
            .map(|(id, progress)| (*id, progress.matched))
            .collect();
        matched.insert(self.id, self.log.last_index());
        let candidate = self.membership.committed_index(&matched);
        // Entries of earlier terms only commit underneath one of ours.
        if candidate > self.hard.commit && self.log.term_at(candidate) == Some(self.hard.term) {
            self.advance_commit(candidate);
        }
    }

    fn advance_commit(&mut self, index: u64) {
        let previous = self.hard.commit;
        self.hard.commit = index;
        self.hard_dirty = true;
        debug!(node_id = self.id, commit = index, "commit advanced");

        for at in previous + 1..=index {
            let Some(EntryKind::Config(config)) = self.log.get(at).map(|entry| entry.kind.clone())
            else {
                continue;
            };
            self.hard.membership = config.clone();
            if !self.state.is_leader() {
                continue;
            }
            if config.is_joint() {
                if self.log.latest_config() == Some(&config) {
                    let target = config.leave_joint();
                    info!(
                        node_id = self.id,
                        voters = ?target.current,
                        "leaving joint configuration"
                    );
                    if let Err(err) = self.append_local(EntryKind::Config(target)) {
                        warn!(
                            node_id = self.id,
                            error = %err,
                            "failed to append final configuration"
                        );
                    }
                    self.broadcast_append();
                }
            } else if !config.contains(self.id) {
                info!(node_id = self.id, "removed from congress, stepping down");
                self.become_follower(self.hard.term, None);
            }
        }
    }

    fn refresh_membership(&mut self) {
        let effective = self
            .log
            .latest_config()
            .cloned()
            .unwrap_or_else(|| self.hard.membership.clone());
        if effective == self.membership {
            return;
        }
        info!(
            node_id = self.id,
            voters = ?effective.current,
            joint = ?effective.joint,
            "membership changed"
        );
        self.membership = effective;
        if self.state.is_leader() {
            let voters = self.membership.voters();
            let next = self.log.last_index() + 1;
            self.progress.retain(|id, _| voters.contains(id));
            for peer in voters.into_iter().filter(|id| *id != self.id) {
                self.progress
                    .entry(peer)
                    .or_insert(Progress { next, matched: 0 });
            }
        }
        let core = match self.state.core() {
            CoreRole::Client | CoreRole::Candidate => CoreRole::Follower,
            core => core,
        };
        self.assume(core);
    }

    /// Applies a core role, adding the flags implied by gate and joint state.
    fn assume(&mut self, core: CoreRole) {
        let core = if self.membership.contains(self.id) || core == CoreRole::Leader {
            core
        } else {
            CoreRole::Client
        };
        let mut bits = core as u8;
        if self.gate {
            bits |= RaftState::GATE;
        }
        if self.membership.is_joint() && core != CoreRole::Client {
            bits |= RaftState::JOINT;
        }
        let next = match RaftState::decode(bits) {
            Ok(next) => next,
            Err(err) => {
                debug_assert!(false, "invalid role transition: {err}");
                error!(node_id = self.id, error = %err, "invalid role transition, dropping flags");
                RaftState::of(core)
            }
        };
        if next != self.state {
            info!(
                node_id = self.id,
                term = self.hard.term,
                from = %self.state,
                to = %next,
                "role changed"
            );
            self.state = next;
        }
    }

    fn broadcast_append(&mut self) {
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: NodeId) {
        let Some(progress) = self.progress.get(&peer).copied() else {
            return;
        };
        let prev_log_index = progress.next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self
            .log
            .entries_from(progress.next, self.settings.max_append_entries);
        let term = self.hard.term;
        let leader_commit = self.hard.commit;
        self.send(
            peer,
            RaftMessage::AppendEntries {
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            },
        );
    }

    fn peers(&self) -> Vec<NodeId> {
        self.membership
            .voters()
            .into_iter()
            .filter(|id| *id != self.id)
            .collect()
    }

    fn send(&mut self, to: NodeId, message: RaftMessage) {
        self.outbox.push(RaftEnvelope {
            from: self.id,
            to,
            message,
        });
    }

    fn reset_election_timer(&mut self) {
        let base = self.settings.election_ticks.max(1);
        self.election_elapsed = 0;
        self.election_timeout = self.rng.gen_range(base..base * 2);
    }
}
