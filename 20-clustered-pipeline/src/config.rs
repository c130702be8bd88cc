//! Node configuration loaded from a JSON file.
//!
//! The whole value is validated once at startup and then passed by value
//! (or `Arc`) into every component constructor.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::raft::{CoreRole, RaftNode, RaftState, Topology};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Descriptor of this node.
    pub node: RaftNode,
    /// Every other node in the cluster.
    #[serde(default)]
    pub peers: Vec<RaftNode>,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub raft: RaftSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,
}

/// Ring sizes, one power of two per ring family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RingPowers {
    pub read: u32,
    pub logic: u32,
    pub cluster: u32,
    pub write: u32,
    pub error: u32,
}

impl Default for RingPowers {
    fn default() -> Self {
        Self {
            read: 10,
            logic: 10,
            cluster: 8,
            write: 10,
            error: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub worker_count: usize,
    pub ring_size_power: RingPowers,
    /// Batches smaller than this yield the thread instead of spinning.
    pub yield_threshold: usize,
    /// Sleep when a whole cycle found nothing.
    pub park_micros: u64,
    /// Slots kept free for network-control commands.
    pub reserved_slots: usize,
    pub max_frame: usize,
    /// Route consensus commands through raft. When off they are handled by
    /// the session's logic worker like any other command.
    pub cluster_mode: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            ring_size_power: RingPowers::default(),
            yield_threshold: 8,
            park_micros: 200,
            reserved_slots: 4,
            max_frame: 64 * 1024,
            cluster_mode: true,
        }
    }
}

impl PipelineSettings {
    pub fn park_interval(&self) -> Duration {
        Duration::from_micros(self.park_micros)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RaftSettings {
    pub tick_millis: u64,
    /// Base election timeout; the effective one is drawn from `[n, 2n)`.
    pub election_ticks: u32,
    pub heartbeat_ticks: u32,
    /// Ticks a proposal may stay in flight before it is rejected.
    pub proposal_timeout_ticks: u32,
    pub max_append_entries: usize,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            tick_millis: 50,
            election_ticks: 10,
            heartbeat_ticks: 3,
            proposal_timeout_ticks: 40,
            max_append_entries: 64,
        }
    }
}

impl RaftSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    pub fn proposal_timeout(&self) -> Duration {
        self.tick_interval() * self.proposal_timeout_ticks
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Client-facing listen address.
    pub listen: String,
    /// Key for the XOR stream cipher; plaintext when absent.
    pub cipher_key: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7400".to_string(),
            cipher_key: None,
        }
    }
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("raft-meta.bin")
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Single voting node listening on loopback.
    pub fn development() -> Self {
        Self {
            node: RaftNode::new(1, "127.0.0.1", 7500, RaftState::FOLLOWER),
            peers: Vec::new(),
            pipeline: PipelineSettings::default(),
            raft: RaftSettings::default(),
            server: ServerSettings::default(),
            metadata_path: default_metadata_path(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pipeline = &self.pipeline;
        if pipeline.worker_count == 0 {
            return Err(invalid("pipeline.worker_count", "at least one logic worker is required"));
        }
        let powers = pipeline.ring_size_power;
        for (field, power) in [
            ("pipeline.ring_size_power.read", powers.read),
            ("pipeline.ring_size_power.logic", powers.logic),
            ("pipeline.ring_size_power.cluster", powers.cluster),
            ("pipeline.ring_size_power.write", powers.write),
            ("pipeline.ring_size_power.error", powers.error),
        ] {
            if !(1..=20).contains(&power) {
                return Err(invalid(field, format!("power {power} outside 1..=20")));
            }
        }
        if pipeline.reserved_slots >= 1usize << powers.read.min(powers.logic) {
            return Err(invalid(
                "pipeline.reserved_slots",
                "must leave room for ordinary commands",
            ));
        }
        if pipeline.max_frame == 0 {
            return Err(invalid("pipeline.max_frame", "must be positive"));
        }

        let raft = &self.raft;
        if raft.tick_millis == 0 {
            return Err(invalid("raft.tick_millis", "must be positive"));
        }
        if raft.heartbeat_ticks == 0 || raft.heartbeat_ticks >= raft.election_ticks {
            return Err(invalid(
                "raft.heartbeat_ticks",
                "must be positive and below raft.election_ticks",
            ));
        }
        if raft.proposal_timeout_ticks == 0 || raft.max_append_entries == 0 {
            return Err(invalid(
                "raft.proposal_timeout_ticks",
                "proposal timeout and append batch must be positive",
            ));
        }

        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(invalid(
                "server.listen",
                format!("`{}` is not a socket address", self.server.listen),
            ));
        }
        if self.server.cipher_key.as_deref() == Some("") {
            return Err(invalid("server.cipher_key", "must not be empty"));
        }

        for node in std::iter::once(&self.node).chain(&self.peers) {
            if matches!(node.role.core(), CoreRole::Elector | CoreRole::Leader) {
                return Err(invalid(
                    "peers.role",
                    format!("node {} is configured with runtime-only role {}", node.id, node.role),
                ));
            }
        }
        self.topology().map(|_| ())
    }

    /// Validated topology of this node and its peers.
    pub fn topology(&self) -> Result<Topology, ConfigError> {
        let mut nodes = Vec::with_capacity(self.peers.len() + 1);
        nodes.push(self.node.clone());
        nodes.extend(self.peers.iter().cloned());
        Topology::new(nodes)
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}
