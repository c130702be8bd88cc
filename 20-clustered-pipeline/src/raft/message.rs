//! Messages exchanged between raft peers.

use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    Vote {
        term: u64,
        granted: bool,
    },
    /// Heartbeat when `entries` is empty.
    AppendEntries {
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendResponse {
        term: u64,
        success: bool,
        /// Last index known to match the leader on success; the next index to
        /// try on failure.
        hint: u64,
    },
    /// Proposal handed from a follower to the leader it knows about.
    Forward {
        term: u64,
        data: Vec<u8>,
    },
}

impl RaftMessage {
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::Vote { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendResponse { term, .. }
            | RaftMessage::Forward { term, .. } => *term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "request_vote",
            RaftMessage::Vote { .. } => "vote",
            RaftMessage::AppendEntries { .. } => "append_entries",
            RaftMessage::AppendResponse { .. } => "append_response",
            RaftMessage::Forward { .. } => "forward",
        }
    }
}

/// Addressed message, the unit written to the peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftEnvelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}
