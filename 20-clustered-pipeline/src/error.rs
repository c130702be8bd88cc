//! Error types shared across the pipeline and the cluster layer.
//!
//! Stage-local failures never cross a ring boundary as a Rust error: they are
//! converted into error events (see [`crate::event::EventContent::Fault`]).
//! The enums here describe those failures and the few that are fatal at
//! startup (configuration, topology).

use std::io;

use thiserror::Error;

use crate::raft::NodeId;

/// Failures reported by a [`crate::ring::Ring`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Claiming another slot would overwrite one the consumer has not released.
    #[error("ring is full")]
    Full,
    /// The ring was halted; waiting consumers should exit cleanly.
    #[error("ring halted")]
    Halted,
}

/// Classification attached to every filter-chain failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterErrorKind {
    /// Bytes did not form a valid frame or command body.
    Malformed,
    /// The command serial has no registered decoder.
    UnknownSerial,
    /// The peer spoke a protocol this chain does not serve.
    Protocol,
    /// The cipher stage rejected the bytes.
    Cipher,
    /// A frame announced a length above the configured maximum.
    Oversized,
}

impl FilterErrorKind {
    /// Whether the session can survive this error by dropping the frame.
    pub fn is_recoverable(self) -> bool {
        matches!(self, FilterErrorKind::UnknownSerial)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind:?} in {stage}: {detail}")]
pub struct FilterError {
    pub kind: FilterErrorKind,
    pub stage: &'static str,
    pub detail: String,
}

impl FilterError {
    pub fn new(kind: FilterErrorKind, stage: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            detail: detail.into(),
        }
    }
}

/// Invalid raft role encodings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoleError {
    #[error("unknown role bits {0:#x}")]
    UnknownBits(u8),
    #[error("role {core} cannot carry flag {flag}")]
    InvalidCombination { core: &'static str, flag: &'static str },
}

/// Configuration problems. These are the only errors that stop a node at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: String, reason: String },
    #[error("node {0} appears more than once in the topology")]
    DuplicateNode(NodeId),
    #[error("nodes {first} and {second} are both bound to {addr}")]
    DuplicateBinding {
        first: NodeId,
        second: NodeId,
        addr: String,
    },
    #[error(transparent)]
    Role(#[from] RoleError),
}

/// Failures loading or rewriting the metadata record.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata io: {0}")]
    Io(#[from] io::Error),
    #[error("metadata record corrupt: {0}")]
    Corrupt(String),
    #[error("metadata encoding: {0}")]
    Encode(#[from] bincode::Error),
}

/// Errors surfaced by the raft state machine to its callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("not the leader (leader hint: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    #[error("no leader known for term {term}")]
    NoLeader { term: u64 },
    #[error("expected log index {expected}, got {got}")]
    LogGap { expected: u64, got: u64 },
    #[error("a membership change is already in progress")]
    MembershipChangeInProgress,
    #[error("node {0} is not a voting member")]
    NotInCongress(NodeId),
}
