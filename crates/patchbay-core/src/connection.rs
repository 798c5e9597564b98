//! Connections between node ports.

use serde::{Deserialize, Serialize};

use crate::id::{ConnectionId, NodeId, PortId};
use crate::port::SignalType;

/// A wire from an output port to an input port.
///
/// `conn_type` is the resolved signal type at creation time. A bundled
/// connection stands for N parallel channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub source_node_id: NodeId,
    pub source_port_id: PortId,
    pub target_node_id: NodeId,
    pub target_port_id: PortId,
    #[serde(rename = "type")]
    pub conn_type: SignalType,
    #[serde(default)]
    pub is_bundled: bool,
}

impl Connection {
    pub fn touches_node(&self, node: NodeId) -> bool {
        self.source_node_id == node || self.target_node_id == node
    }

    pub fn touches_port(&self, node: NodeId, port: &PortId) -> bool {
        (self.source_node_id == node && &self.source_port_id == port)
            || (self.target_node_id == node && &self.target_port_id == port)
    }

    /// True when both connections join the same four endpoints.
    pub fn same_endpoints(&self, other: &Connection) -> bool {
        self.source_node_id == other.source_node_id
            && self.source_port_id == other.source_port_id
            && self.target_node_id == other.target_node_id
            && self.target_port_id == other.target_port_id
    }

    /// Both endpoints as `(node, port)` pairs, source first.
    pub fn endpoints(&self) -> [(NodeId, &PortId); 2] {
        [
            (self.source_node_id, &self.source_port_id),
            (self.target_node_id, &self.target_port_id),
        ]
    }
}
