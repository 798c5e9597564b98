//! Port synchronizer: derives a container's visible ports from its boundary
//! children.
//!
//! Boundary children are scanned in `child_ids` order, grouped as input
//! proxies, panels, then output proxies. Each reflected port gets the
//! composite id `"{child}:{port}"`, the child's port type and bundle flag, and
//! the direction implied by the child's [`BoundaryRole`].
//!
//! With `only_connected`, panel ports are reflected only while a connection
//! touches them; the panel's trailing placeholder and the fixed proxies'
//! ports are always reflected.
//!
//! The synchronizer is pure: same input, same output.

use serde_json::Value;

use crate::id::{NodeId, PortId};
use crate::node::GraphNode;
use crate::panel;
use crate::port::PortDefinition;
use crate::registry::{layout_anchors, BoundaryRole, NodeRegistry};
use crate::state::GraphState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub only_connected: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            only_connected: true,
        }
    }
}

fn role_rank(role: BoundaryRole) -> u8 {
    match role {
        BoundaryRole::Input => 0,
        BoundaryRole::Panel => 1,
        BoundaryRole::Output => 2,
    }
}

/// `data.portLabels[port]` overrides the reflected port's name.
fn reflected_name(child: &GraphNode, port: &PortDefinition) -> String {
    child
        .data
        .get("portLabels")
        .and_then(|labels| labels.get(port.id.as_str()))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| port.name.clone())
}

/// Computes the port list `container` should expose.
///
/// Returns an empty list for unknown ids.
pub fn synchronize_ports(
    state: &GraphState,
    registry: &NodeRegistry,
    container: NodeId,
    options: SyncOptions,
) -> Vec<PortDefinition> {
    let Some(node) = state.node(container) else {
        return Vec::new();
    };

    let mut boundary: Vec<(BoundaryRole, &GraphNode)> = node
        .child_ids
        .iter()
        .filter_map(|id| state.node(*id))
        .filter_map(|child| registry.boundary_role(child.node_type).map(|role| (role, child)))
        .collect();
    boundary.sort_by_key(|(role, _)| role_rank(*role));

    let mut ports = Vec::new();
    for (role, child) in boundary {
        for port in &child.ports {
            let always = match role {
                BoundaryRole::Panel => panel::is_placeholder(child, &port.id),
                BoundaryRole::Input | BoundaryRole::Output => true,
            };
            if options.only_connected && !always && !state.is_port_touched(child.id, &port.id) {
                continue;
            }
            ports.push(PortDefinition {
                id: PortId::composite(child.id, &port.id),
                name: reflected_name(child, port),
                port_type: port.port_type,
                direction: role.reflected_direction(),
                is_bundled: port.is_bundled,
                position: Default::default(),
            });
        }
    }
    layout_anchors(ports)
}

/// Re-derives the ports of `container` in place. Non-containers are left
/// alone. Returns `true` when the port list changed.
pub(crate) fn resync(state: &mut GraphState, registry: &NodeRegistry, container: NodeId) -> bool {
    let Some(node) = state.node(container) else {
        return false;
    };
    if !registry.is_container(node.node_type) {
        return false;
    }
    let ports = synchronize_ports(state, registry, container, SyncOptions::default());
    match state.node_mut(container) {
        Some(node) if node.ports != ports => {
            node.ports = ports;
            true
        }
        _ => false,
    }
}

/// Re-syncs `start` and then every container above it, innermost first.
pub(crate) fn resync_chain(state: &mut GraphState, registry: &NodeRegistry, start: NodeId) {
    resync(state, registry, start);
    for ancestor in state.ancestors(start) {
        resync(state, registry, ancestor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use crate::node::{NodeType, Position};
    use crate::port::Direction;

    #[test]
    fn fresh_instrument_exposes_placeholder_and_output() {
        let mut store = GraphStore::new();
        let piano = store.add_node(NodeType::Piano, Position::default(), None, None).unwrap();
        let node = store.node(piano).unwrap();
        let panel = node.child_ids[0];
        let out = node.child_ids[2];

        let ids: Vec<String> = node.ports.iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec![format!("{panel}:in-0"), format!("{out}:audio")]);
        assert_eq!(node.ports[0].direction, Direction::Input);
        assert_eq!(node.ports[1].direction, Direction::Output);
    }

    #[test]
    fn synchronizer_is_idempotent() {
        let mut store = GraphStore::new();
        let keyboard = store.add_node(NodeType::Keyboard, Position::default(), None, None).unwrap();
        let piano = store.add_node(NodeType::Piano, Position::new(200.0, 0.0), None, None).unwrap();
        let target = store.node(piano).unwrap().ports[0].id.clone();
        store
            .add_connection(keyboard, &PortId::from("keys"), piano, &target)
            .unwrap();

        let first = synchronize_ports(store.state(), store.registry(), piano, SyncOptions::default());
        let second = synchronize_ports(store.state(), store.registry(), piano, SyncOptions::default());
        assert_eq!(first, second);
        assert_eq!(&first, &store.node(piano).unwrap().ports);
    }

    #[test]
    fn unfiltered_sync_lists_every_panel_port() {
        let mut store = GraphStore::new();
        let piano = store.add_node(NodeType::Piano, Position::default(), None, None).unwrap();
        let panel = store.node(piano).unwrap().child_ids[0];
        let mut ports = store.node(panel).unwrap().ports.clone();
        ports.insert(0, PortDefinition::output("spare", "Spare", crate::port::PortType::Control));
        assert!(store.update_node_ports(panel, ports));

        let filtered = synchronize_ports(store.state(), store.registry(), piano, SyncOptions::default());
        let all = synchronize_ports(
            store.state(),
            store.registry(),
            piano,
            SyncOptions { only_connected: false },
        );
        assert_eq!(filtered.len() + 1, all.len());
    }

    #[test]
    fn port_labels_rename_reflected_ports() {
        let mut store = GraphStore::new();
        let piano = store.add_node(NodeType::Piano, Position::default(), None, None).unwrap();
        let panel = store.node(piano).unwrap().child_ids[0];

        let mut patch = serde_json::Map::new();
        patch.insert("portLabels".into(), serde_json::json!({ "in-0": "Keys" }));
        assert!(store.update_node_data(panel, patch));
        assert_eq!(store.node(piano).unwrap().ports[0].name, "Keys");
    }
}
