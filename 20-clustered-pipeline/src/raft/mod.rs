//! Cluster consensus layer.
//!
//! - [`role`]: the role bit codec with its flag table
//! - [`node`] / [`topology`]: peer descriptors, voting membership, joint configurations
//! - [`engine`]: the tick-driven state machine (elections, replication, commit)
//! - [`runtime`]: the worker thread and TCP transport around a core

pub mod engine;
pub mod log;
pub mod message;
pub mod node;
pub mod role;
pub mod runtime;
pub mod topology;

pub type NodeId = u64;

pub use self::engine::{HardState, LogWrite, Proposed, RaftCore, Ready};
pub use self::log::{EntryKind, LogEntry, RaftLog};
pub use self::message::{RaftEnvelope, RaftMessage};
pub use self::node::RaftNode;
pub use self::role::{CoreRole, RaftState};
pub use self::runtime::{
    spawn_node, CommitSink, NodeConfig, NodeStatus, RaftHandle, RaftStorage,
};
pub use self::topology::{Membership, Topology};
