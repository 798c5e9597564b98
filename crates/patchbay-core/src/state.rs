//! The canonical node and connection maps.
//!
//! [`GraphState`] is exactly what a history snapshot captures. Both maps are
//! insertion-ordered [`IndexMap`]s so that restoring a snapshot reproduces the
//! original iteration order, and both serialize as `[[id, value], ...]` pairs.
//!
//! Removal always uses `shift_remove` to keep the remaining order stable.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::connection::Connection;
use crate::id::{ConnectionId, NodeId, PortId};
use crate::node::GraphNode;

/// Ancestor chains are short in practice.
pub type NodeChain = SmallVec<[NodeId; 8]>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphState {
    #[serde(with = "pairs", default)]
    pub nodes: IndexMap<NodeId, GraphNode>,
    #[serde(with = "pairs", default)]
    pub connections: IndexMap<ConnectionId, Connection>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut GraphNode> {
        self.nodes.get_mut(&id)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// True when `node` exists and owns `port`.
    pub fn endpoint_exists(&self, node: NodeId, port: &PortId) -> bool {
        self.node(node).is_some_and(|n| n.has_port(port))
    }

    /// Root nodes in map order.
    pub fn root_ids(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.parent_id.is_none())
            .map(|n| n.id)
            .collect()
    }

    /// Nodes whose parent is `parent` (`None` = root level), in child order
    /// for nested levels and map order at the root.
    pub fn level(&self, parent: Option<NodeId>) -> Vec<NodeId> {
        match parent {
            None => self.root_ids(),
            Some(id) => self
                .node(id)
                .map(|n| n.child_ids.clone())
                .unwrap_or_default(),
        }
    }

    /// `node` followed by all of its descendants, depth first.
    pub fn closure(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let Some(n) = self.node(id) {
                out.push(id);
                stack.extend(n.child_ids.iter().rev().copied());
            }
        }
        out
    }

    /// Parent chain from the immediate parent up to the root.
    pub fn ancestors(&self, node: NodeId) -> NodeChain {
        let mut chain = NodeChain::new();
        let mut cursor = self.node(node).and_then(|n| n.parent_id);
        while let Some(id) = cursor {
            // A corrupted chain must not loop forever.
            if chain.contains(&id) || chain.len() > self.nodes.len() {
                break;
            }
            chain.push(id);
            cursor = self.node(id).and_then(|n| n.parent_id);
        }
        chain
    }

    /// True when `connection` touches `(node, port)` directly or through the
    /// composite port the node's parent uses to reflect it.
    pub fn connection_touches_port(&self, connection: &Connection, node: NodeId, port: &PortId) -> bool {
        if connection.touches_port(node, port) {
            return true;
        }
        match self.node(node).and_then(|n| n.parent_id) {
            Some(parent) => connection.touches_port(parent, &PortId::composite(node, port)),
            None => false,
        }
    }

    /// The node and port an endpoint really addresses: a composite port on a
    /// container resolves to the child it reflects.
    pub fn resolve_endpoint(&self, node: NodeId, port: &PortId) -> (NodeId, PortId) {
        if let Some((child, inner)) = port.split_composite() {
            if self.node(child).is_some_and(|c| c.parent_id == Some(node)) {
                return (child, inner);
            }
        }
        (node, port.clone())
    }

    pub fn is_port_touched(&self, node: NodeId, port: &PortId) -> bool {
        self.connections
            .values()
            .any(|c| self.connection_touches_port(c, node, port))
    }

    /// True when `connection` touches `node` directly or addresses it through
    /// a composite port on its parent.
    pub fn connection_touches_node(&self, connection: &Connection, node: NodeId) -> bool {
        if connection.touches_node(node) {
            return true;
        }
        let Some(parent) = self.node(node).and_then(|n| n.parent_id) else {
            return false;
        };
        connection.endpoints().iter().any(|(endpoint, port)| {
            *endpoint == parent
                && port
                    .split_composite()
                    .is_some_and(|(child, _)| child == node)
        })
    }

    pub fn connections_touching(&self, node: NodeId) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| self.connection_touches_node(c, node))
            .map(|c| c.id)
            .collect()
    }

    pub fn has_connections(&self, node: NodeId) -> bool {
        self.connections
            .values()
            .any(|c| self.connection_touches_node(c, node))
    }

    /// Incoming connections of `(node, port)`.
    pub fn incoming(&self, node: NodeId, port: &PortId) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.target_node_id == node && &c.target_port_id == port)
            .map(|c| c.id)
            .collect()
    }

    /// Finds a connection joining the same four endpoints.
    pub fn find_identical(
        &self,
        source: NodeId,
        source_port: &PortId,
        target: NodeId,
        target_port: &PortId,
    ) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|c| {
                c.source_node_id == source
                    && &c.source_port_id == source_port
                    && c.target_node_id == target
                    && &c.target_port_id == target_port
            })
            .map(|c| c.id)
    }
}

/// Serializes an `IndexMap` as an ordered list of `[key, value]` pairs.
pub(crate) mod pairs {
    use std::hash::Hash;

    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, K, V>(map: &IndexMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize,
        V: Serialize,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<IndexMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Eq + Hash,
        V: Deserialize<'de>,
    {
        let pairs = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
