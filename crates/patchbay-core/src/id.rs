//! Stable ID newtypes for graph entities.
//!
//! Node and connection IDs are distinct newtype wrappers over `u32`, so a
//! `NodeId` cannot be used where a `ConnectionId` is expected. Port IDs are
//! strings scoped to their owning node; a container's reflected ports use the
//! composite `"{child}:{port}"` form built by [`PortId::composite`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable node identifier. Never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

/// Stable connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

/// Port identifier, unique within its node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub String);

/// Separator between the node and port halves of a composite port id.
const COMPOSITE_SEPARATOR: char = ':';

impl PortId {
    pub fn new(id: impl Into<String>) -> Self {
        PortId(id.into())
    }

    /// Builds the id a container uses to reflect `port` of child `node`.
    pub fn composite(node: NodeId, port: &PortId) -> Self {
        PortId(format!("{}{}{}", node.0, COMPOSITE_SEPARATOR, port.0))
    }

    /// Splits a composite id into the addressed child node and its port.
    ///
    /// Returns `None` for plain port ids.
    pub fn split_composite(&self) -> Option<(NodeId, PortId)> {
        let (node, port) = self.0.split_once(COMPOSITE_SEPARATOR)?;
        let node = node.parse::<u32>().ok()?;
        Some((NodeId(node), PortId(port.to_string())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PortId {
    fn from(id: &str) -> Self {
        PortId(id.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic allocator for node and connection ids.
///
/// Lives outside history snapshots so that undoing a creation never frees an
/// id for reuse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdAllocator {
    next_node: u32,
    next_connection: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_node(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    pub fn next_connection(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        id
    }

    /// Ensures future node ids are strictly greater than `seen`.
    pub fn observe_node(&mut self, seen: NodeId) {
        self.next_node = self.next_node.max(seen.0 + 1);
    }

    /// Ensures future connection ids are strictly greater than `seen`.
    pub fn observe_connection(&mut self, seen: ConnectionId) {
        self.next_connection = self.next_connection.max(seen.0 + 1);
    }
}
