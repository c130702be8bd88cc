//! Multi-protocol server core with a staged event pipeline and raft-backed
//! consistency for commands that must be ordered cluster-wide.
//!
//! Bytes from a client connection flow through a fixed set of stage threads
//! connected by rings:
//!
//! - [`ring`] is the claim/publish/wait sequencer every stage reads from,
//!   and [`stage`] is the consumer loop that drains one or more rings.
//! - [`filter`] turns wire bytes into [`command::Routed`] commands and back
//!   (cipher, protocol sniffing, framing, MQTT, command codec).
//! - [`dispatch`] pins each session to one logic worker, or sends consensus
//!   commands to the cluster stage through [`consistency`].
//! - [`raft`] is the role state machine, replication engine and peer
//!   transport; [`metadata`] persists its hard state as one rewritten record.
//! - [`pipeline`] wires the stages together; [`server`] accepts clients and
//!   assembles a whole node from a [`config::ClusterConfig`].
//!
//! [`logic`] and [`store`] hold the key-value demo application that runs on
//! top.

pub mod cli;
pub mod command;
pub mod config;
pub mod consistency;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod filter;
pub mod logic;
pub mod metadata;
pub mod pipeline;
pub mod raft;
pub mod ring;
pub mod server;
pub mod session;
pub mod stage;
pub mod store;
