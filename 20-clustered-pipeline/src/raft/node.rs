use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::role::RaftState;
use super::NodeId;

/// Topology descriptor exchanged between peers.
///
/// Two descriptors are the same node when `(id, host)` match; the ports are
/// not part of identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftNode {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub gate_host: Option<String>,
    #[serde(default)]
    pub gate_port: Option<u16>,
    pub role: RaftState,
}

impl RaftNode {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16, role: RaftState) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            gate_host: None,
            gate_port: None,
            role,
        }
    }

    pub fn with_gate(mut self, host: impl Into<String>, port: u16) -> Self {
        self.gate_host = Some(host.into());
        self.gate_port = Some(port);
        self
    }

    /// Raft transport address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Client-facing address, when this peer acts as a gateway.
    pub fn gateway(&self) -> Option<String> {
        match (&self.gate_host, self.gate_port) {
            (Some(host), Some(port)) if self.role.is_gate() => Some(format!("{host}:{port}")),
            _ => None,
        }
    }
}

impl PartialEq for RaftNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.host == other.host
    }
}

impl Eq for RaftNode {}

impl PartialOrd for RaftNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RaftNode {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.id, &self.host).cmp(&(other.id, &other.host))
    }
}
