//! Graph nodes.
//!
//! Nodes live in a flat arena keyed by [`NodeId`]. Nesting is expressed only
//! through id references: `parent_id` points up, `child_ids` lists owned
//! children in order. Nodes never embed other nodes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::{NodeId, PortId};
use crate::port::PortDefinition;

/// Every node type known to the builtin registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Keyboard,
    Piano,
    Synth,
    Oscillator,
    Lfo,
    Filter,
    Mixer,
    Relay,
    Speaker,
    Group,
    AudioInputProxy,
    AudioOutputProxy,
    InputPanel,
    InstrumentVoice,
}

impl NodeType {
    pub const ALL: [NodeType; 14] = [
        NodeType::Keyboard,
        NodeType::Piano,
        NodeType::Synth,
        NodeType::Oscillator,
        NodeType::Lfo,
        NodeType::Filter,
        NodeType::Mixer,
        NodeType::Relay,
        NodeType::Speaker,
        NodeType::Group,
        NodeType::AudioInputProxy,
        NodeType::AudioOutputProxy,
        NodeType::InputPanel,
        NodeType::InstrumentVoice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Keyboard => "keyboard",
            NodeType::Piano => "piano",
            NodeType::Synth => "synth",
            NodeType::Oscillator => "oscillator",
            NodeType::Lfo => "lfo",
            NodeType::Filter => "filter",
            NodeType::Mixer => "mixer",
            NodeType::Relay => "relay",
            NodeType::Speaker => "speaker",
            NodeType::Group => "group",
            NodeType::AudioInputProxy => "audio-input-proxy",
            NodeType::AudioOutputProxy => "audio-output-proxy",
            NodeType::InputPanel => "input-panel",
            NodeType::InstrumentVoice => "instrument-voice",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCategory {
    Keyboard,
    Instrument,
    Source,
    Modulator,
    Effect,
    Utility,
    Output,
    Container,
    Boundary,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Position { x, y }
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Position::new(self.x + dx, self.y + dy)
    }
}

/// Saved pan/zoom of a node's internal canvas (or of the root canvas).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            x: 0.0,
            y: 0.0,
            zoom: 1.0,
        }
    }
}

/// A node in the patch graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub category: NodeCategory,
    pub position: Position,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub ports: Vec<PortDefinition>,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub child_ids: Vec<NodeId>,
    #[serde(default)]
    pub special_nodes: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_viewport: Option<Viewport>,
}

impl GraphNode {
    pub fn port(&self, id: &PortId) -> Option<&PortDefinition> {
        self.ports.iter().find(|p| &p.id == id)
    }

    pub fn port_mut(&mut self, id: &PortId) -> Option<&mut PortDefinition> {
        self.ports.iter_mut().find(|p| &p.id == id)
    }

    pub fn has_port(&self, id: &PortId) -> bool {
        self.port(id).is_some()
    }

    pub fn is_protected_child(&self, child: NodeId) -> bool {
        self.special_nodes.contains(&child)
    }

    /// Human-readable label: `data.label` when set, else the type name.
    pub fn label(&self) -> String {
        match self.data.get("label").and_then(Value::as_str) {
            Some(label) => label.to_string(),
            None => self.node_type.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_serde_matches_as_str() {
        for ty in NodeType::ALL {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn label_falls_back_to_type() {
        let mut node = GraphNode {
            id: NodeId(1),
            node_type: NodeType::Oscillator,
            category: NodeCategory::Source,
            position: Position::default(),
            data: Map::new(),
            ports: Vec::new(),
            parent_id: None,
            child_ids: Vec::new(),
            special_nodes: Vec::new(),
            internal_viewport: None,
        };
        assert_eq!(node.label(), "oscillator");
        node.data.insert("label".into(), Value::from("Osc A"));
        assert_eq!(node.label(), "Osc A");
    }
}
