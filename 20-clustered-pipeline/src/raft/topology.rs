use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::node::RaftNode;
use super::NodeId;
use crate::error::ConfigError;

/// Every node known to this cluster, validated once at startup.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: BTreeMap<NodeId, RaftNode>,
}

impl Topology {
    /// Rejects a node id listed twice and two nodes bound to the same
    /// `host:port`.
    pub fn new(nodes: Vec<RaftNode>) -> Result<Self, ConfigError> {
        let mut by_id = BTreeMap::new();
        let mut bindings: HashMap<String, NodeId> = HashMap::new();
        for node in nodes {
            if by_id.contains_key(&node.id) {
                return Err(ConfigError::DuplicateNode(node.id));
            }
            let addr = node.address();
            if let Some(&first) = bindings.get(&addr) {
                return Err(ConfigError::DuplicateBinding {
                    first,
                    second: node.id,
                    addr,
                });
            }
            bindings.insert(addr, node.id);
            by_id.insert(node.id, node);
        }
        if by_id.is_empty() {
            return Err(ConfigError::Invalid {
                field: "peers".into(),
                reason: "topology requires at least one node".into(),
            });
        }
        Ok(Self { nodes: by_id })
    }

    pub fn get(&self, id: NodeId) -> Option<&RaftNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &RaftNode> {
        self.nodes.values()
    }

    pub fn addresses(&self) -> HashMap<NodeId, String> {
        self.nodes
            .values()
            .map(|node| (node.id, node.address()))
            .collect()
    }

    /// Nodes configured as voting members.
    pub fn congress(&self) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.role.is_in_congress())
            .map(|node| node.id)
            .collect()
    }

    /// Client-facing endpoints of GATE peers.
    pub fn gateways(&self) -> Vec<String> {
        self.nodes.values().filter_map(RaftNode::gateway).collect()
    }
}

/// Voting configuration, possibly spanning an old and a new membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Membership {
    pub current: BTreeSet<NodeId>,
    pub joint: Option<BTreeSet<NodeId>>,
}

impl Membership {
    pub fn new(voters: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            current: voters.into_iter().collect(),
            joint: None,
        }
    }

    pub fn is_joint(&self) -> bool {
        self.joint.is_some()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.current.contains(&id) || self.joint.as_ref().is_some_and(|next| next.contains(&id))
    }

    /// Every node that votes in at least one half of the configuration.
    pub fn voters(&self) -> BTreeSet<NodeId> {
        let mut all = self.current.clone();
        if let Some(next) = &self.joint {
            all.extend(next.iter().copied());
        }
        all
    }

    /// Transitional configuration towards `next`.
    pub fn enter_joint(&self, next: BTreeSet<NodeId>) -> Self {
        Self {
            current: self.current.clone(),
            joint: Some(next),
        }
    }

    /// Final configuration once the joint one is committed.
    pub fn leave_joint(&self) -> Self {
        Self {
            current: self.joint.clone().unwrap_or_else(|| self.current.clone()),
            joint: None,
        }
    }

    /// Strict majority of every half of the configuration.
    pub fn quorum_reached(&self, granted: &BTreeSet<NodeId>) -> bool {
        let majority_of = |set: &BTreeSet<NodeId>| {
            !set.is_empty() && set.intersection(granted).count() > set.len() / 2
        };
        majority_of(&self.current) && self.joint.as_ref().map_or(true, majority_of)
    }

    /// Highest index replicated on a majority of every half.
    pub fn committed_index(&self, matched: &BTreeMap<NodeId, u64>) -> u64 {
        let index_of = |set: &BTreeSet<NodeId>| {
            if set.is_empty() {
                return 0;
            }
            let mut indexes: Vec<u64> = set
                .iter()
                .map(|id| matched.get(id).copied().unwrap_or(0))
                .collect();
            indexes.sort_unstable_by(|a, b| b.cmp(a));
            indexes[set.len() / 2]
        };
        let current = index_of(&self.current);
        match &self.joint {
            Some(next) => current.min(index_of(next)),
            None => current,
        }
    }
}
