//! Node definitions and the port-compatibility predicate.
//!
//! [`NodeRegistry`] maps every [`NodeType`] to a [`NodeDefinition`]: category,
//! default ports, default data, and for container types a
//! [`SubgraphTemplate`] describing the internal children materialized at
//! construction time. Boundary types carry a [`BoundaryRole`] telling the port
//! synchronizer how their ports are reflected onto the parent.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::error::CoreError;
use crate::node::{GraphNode, NodeCategory, NodeType, Position};
use crate::port::{Direction, PortDefinition, PortType};

/// Data keys copied from a container onto descendants whose definition
/// receives propagation.
pub const PROPAGATED_FIELDS: [&str; 2] = ["presetId", "deviceId"];

/// Upper bound on the channels one bundled wire expands into, whatever the
/// source's `keyCount`/`channelCount` claims.
pub const MAX_CHANNELS: usize = 128;

/// How a boundary child is reflected on its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundaryRole {
    /// Fixed input proxy: its ports become container inputs.
    Input,
    /// Fixed output proxy: its ports become container outputs.
    Output,
    /// Input panel with a dynamic port list and a trailing placeholder.
    Panel,
}

impl BoundaryRole {
    /// Direction of the reflected port on the container.
    pub fn reflected_direction(&self) -> Direction {
        match self {
            BoundaryRole::Input | BoundaryRole::Panel => Direction::Input,
            BoundaryRole::Output => Direction::Output,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateChild {
    pub node_type: NodeType,
    pub position: Position,
    /// Protected from end-user deletion.
    pub protected: bool,
}

/// A connection between two template children, by index.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateWire {
    pub from: usize,
    pub from_port: String,
    pub to: usize,
    pub to_port: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubgraphTemplate {
    pub children: Vec<TemplateChild>,
    pub wires: Vec<TemplateWire>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDefinition {
    pub node_type: NodeType,
    pub category: NodeCategory,
    pub default_ports: Vec<PortDefinition>,
    pub default_data: Map<String, Value>,
    pub template: Option<SubgraphTemplate>,
    pub boundary: Option<BoundaryRole>,
    pub receives_propagation: bool,
}

impl NodeDefinition {
    fn new(node_type: NodeType, category: NodeCategory) -> Self {
        NodeDefinition {
            node_type,
            category,
            default_ports: Vec::new(),
            default_data: Map::new(),
            template: None,
            boundary: None,
            receives_propagation: false,
        }
    }

    fn ports(mut self, ports: Vec<PortDefinition>) -> Self {
        self.default_ports = layout_anchors(ports);
        self
    }

    fn data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.default_data = map;
        }
        self
    }

    fn template(mut self, template: SubgraphTemplate) -> Self {
        self.template = Some(template);
        self
    }

    fn boundary(mut self, role: BoundaryRole) -> Self {
        self.boundary = Some(role);
        self
    }

    fn receives_propagation(mut self) -> Self {
        self.receives_propagation = true;
        self
    }

    pub fn is_container(&self) -> bool {
        self.template.is_some()
    }
}

/// Spreads input anchors down the left edge and outputs down the right.
pub(crate) fn layout_anchors(mut ports: Vec<PortDefinition>) -> Vec<PortDefinition> {
    for direction in [Direction::Input, Direction::Output] {
        let count = ports.iter().filter(|p| p.direction == direction).count();
        let x = if direction == Direction::Input { 0.0 } else { 1.0 };
        for (i, port) in ports
            .iter_mut()
            .filter(|p| p.direction == direction)
            .enumerate()
        {
            port.position.x = x;
            port.position.y = (i + 1) as f64 / (count + 1) as f64;
        }
    }
    ports
}

fn child(node_type: NodeType, x: f64, y: f64) -> TemplateChild {
    TemplateChild {
        node_type,
        position: Position::new(x, y),
        protected: true,
    }
}

fn wire(from: usize, from_port: &str, to: usize, to_port: &str) -> TemplateWire {
    TemplateWire {
        from,
        from_port: from_port.to_string(),
        to,
        to_port: to_port.to_string(),
    }
}

/// Internal structure shared by instrument-category containers.
fn instrument_template() -> SubgraphTemplate {
    SubgraphTemplate {
        children: vec![
            child(NodeType::InputPanel, 0.0, 0.0),
            child(NodeType::InstrumentVoice, 300.0, 0.0),
            child(NodeType::AudioOutputProxy, 600.0, 0.0),
        ],
        wires: vec![wire(1, "audio", 2, "audio")],
    }
}

/// Registry of node definitions.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    definitions: HashMap<NodeType, NodeDefinition>,
}

impl NodeRegistry {
    /// An empty registry. Every lookup fails until definitions are registered.
    pub fn empty() -> Self {
        NodeRegistry {
            definitions: HashMap::new(),
        }
    }

    /// The builtin patchbay node set.
    pub fn builtin() -> Self {
        use NodeCategory as C;
        use NodeType as T;

        let mut registry = Self::empty();
        registry.register(
            NodeDefinition::new(T::Keyboard, C::Keyboard)
                .ports(vec![PortDefinition::output("keys", "Keys", PortType::Control).bundled()])
                .data(json!({ "keyCount": 30, "label": "Keyboard" })),
        );
        registry.register(
            NodeDefinition::new(T::Piano, C::Instrument)
                .data(json!({ "rows": [], "presetId": "grand", "label": "Piano" }))
                .template(instrument_template()),
        );
        registry.register(
            NodeDefinition::new(T::Synth, C::Instrument)
                .data(json!({ "rows": [], "presetId": "saw-lead", "label": "Synth" }))
                .template(instrument_template()),
        );
        registry.register(
            NodeDefinition::new(T::Oscillator, C::Source)
                .ports(vec![PortDefinition::output("audio", "Audio", PortType::Audio)])
                .data(json!({ "frequency": 440.0, "waveform": "sine" })),
        );
        registry.register(
            NodeDefinition::new(T::Lfo, C::Modulator)
                .ports(vec![PortDefinition::output("control", "Control", PortType::Control)])
                .data(json!({ "rate": 1.0 })),
        );
        registry.register(
            NodeDefinition::new(T::Filter, C::Effect)
                .ports(vec![
                    PortDefinition::input("audio", "Audio", PortType::Audio),
                    PortDefinition::input("cutoff", "Cutoff", PortType::Control),
                    PortDefinition::output("audio-out", "Audio", PortType::Audio),
                ])
                .data(json!({ "cutoff": 1000.0 })),
        );
        registry.register(
            NodeDefinition::new(T::Mixer, C::Effect)
                .ports(vec![
                    PortDefinition::input("in-1", "In 1", PortType::Audio),
                    PortDefinition::input("in-2", "In 2", PortType::Audio),
                    PortDefinition::output("audio", "Mix", PortType::Audio),
                ])
                .data(json!({ "gains": [1.0, 1.0] })),
        );
        registry.register(NodeDefinition::new(T::Relay, C::Utility).ports(vec![
            PortDefinition::input("in", "In", PortType::UNIVERSAL),
            PortDefinition::output("out", "Out", PortType::UNIVERSAL),
        ]));
        registry.register(
            NodeDefinition::new(T::Speaker, C::Output)
                .ports(vec![PortDefinition::input("audio", "Audio", PortType::Audio)])
                .data(json!({ "deviceId": "default" })),
        );
        registry.register(
            NodeDefinition::new(T::Group, C::Container)
                .data(json!({ "label": "Group" }))
                .template(SubgraphTemplate {
                    children: vec![
                        child(NodeType::AudioInputProxy, 0.0, 0.0),
                        child(NodeType::AudioOutputProxy, 600.0, 0.0),
                    ],
                    wires: Vec::new(),
                }),
        );
        registry.register(
            NodeDefinition::new(T::AudioInputProxy, C::Boundary)
                .ports(vec![PortDefinition::output("audio", "Audio In", PortType::Audio)])
                .boundary(BoundaryRole::Input),
        );
        registry.register(
            NodeDefinition::new(T::AudioOutputProxy, C::Boundary)
                .ports(vec![PortDefinition::input("audio", "Audio Out", PortType::Audio)])
                .boundary(BoundaryRole::Output),
        );
        registry.register(
            NodeDefinition::new(T::InputPanel, C::Boundary)
                .ports(vec![PortDefinition::output("in-0", "Input", PortType::UNIVERSAL)])
                .boundary(BoundaryRole::Panel),
        );
        registry.register(
            NodeDefinition::new(T::InstrumentVoice, C::Internal)
                .ports(vec![PortDefinition::output("audio", "Audio", PortType::Audio)])
                .data(json!({ "presetId": null }))
                .receives_propagation(),
        );
        registry
    }

    /// Registers (or replaces) a definition.
    pub fn register(&mut self, definition: NodeDefinition) {
        self.definitions.insert(definition.node_type, definition);
    }

    /// Looks up the definition for `node_type`.
    ///
    /// A missing definition is a programming error in the registry setup.
    pub fn definition(&self, node_type: NodeType) -> Result<&NodeDefinition, CoreError> {
        self.definitions
            .get(&node_type)
            .ok_or(CoreError::UnknownNodeType { node_type })
    }

    pub fn boundary_role(&self, node_type: NodeType) -> Option<BoundaryRole> {
        self.definitions.get(&node_type).and_then(|d| d.boundary)
    }

    pub fn is_container(&self, node_type: NodeType) -> bool {
        self.definitions
            .get(&node_type)
            .is_some_and(NodeDefinition::is_container)
    }

    pub fn receives_propagation(&self, node_type: NodeType) -> bool {
        self.definitions
            .get(&node_type)
            .is_some_and(|d| d.receives_propagation)
    }

    /// Whether a wire may run from `source` to `target`.
    pub fn can_connect(&self, source: &PortDefinition, target: &PortDefinition) -> bool {
        source.direction == Direction::Output
            && target.direction == Direction::Input
            && source.port_type.compatible_with(&target.port_type)
    }

    /// Number of parallel channels a bundle-typed output of `node` carries.
    pub fn channel_count(&self, node: &GraphNode) -> usize {
        ["keyCount", "channelCount"]
            .iter()
            .find_map(|key| node.data.get(*key).and_then(Value::as_u64))
            .map(|n| n.min(MAX_CHANNELS as u64) as usize)
            .unwrap_or(0)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
