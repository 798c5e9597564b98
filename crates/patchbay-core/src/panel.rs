//! Dynamic port management for input panels.
//!
//! A panel's port list always ends with one non-bundled placeholder port that
//! is reflected on the container even while unconnected, so there is always
//! somewhere to land a new wire. Connecting to the placeholder promotes it to
//! a regular port and appends a fresh one. Bundle expansion inserts channel
//! ports before the placeholder. Pruning drops ports nothing touches anymore.

use crate::id::{NodeId, PortId};
use crate::node::GraphNode;
use crate::port::{Direction, PortDefinition, PortType};
use crate::registry::layout_anchors;
use crate::state::GraphState;

/// The trailing placeholder port, if the panel currently has one.
pub fn placeholder(panel: &GraphNode) -> Option<&PortDefinition> {
    panel.ports.last().filter(|p| !p.is_bundled)
}

pub fn is_placeholder(panel: &GraphNode, port: &PortId) -> bool {
    placeholder(panel).is_some_and(|p| &p.id == port)
}

/// Channel ports of one bundle share the id prefix before the final `-{i}`.
pub fn bundle_group(port: &PortId) -> Option<&str> {
    port.as_str().rsplit_once('-').map(|(group, _)| group)
}

/// Lowest `in-{k}` id not already used on the panel.
fn next_placeholder_id(panel: &GraphNode) -> PortId {
    (0..)
        .map(|k| PortId(format!("in-{k}")))
        .find(|id| !panel.has_port(id))
        .unwrap_or_else(|| PortId::from("in"))
}

fn fresh_placeholder(panel: &GraphNode) -> PortDefinition {
    // Universal placeholders share the panel's current resolution.
    let port_type = panel
        .ports
        .iter()
        .find(|p| p.port_type.is_universal())
        .map(|p| p.port_type)
        .unwrap_or(PortType::UNIVERSAL);
    let id = next_placeholder_id(panel);
    PortDefinition {
        name: "Input".to_string(),
        id,
        port_type,
        direction: Direction::Output,
        is_bundled: false,
        position: Default::default(),
    }
}

/// Appends a new placeholder if the current one is now connected.
///
/// Returns `true` when the panel's ports changed.
pub(crate) fn promote_placeholder(state: &mut GraphState, panel_id: NodeId) -> bool {
    let Some(panel) = state.node(panel_id) else {
        return false;
    };
    let needs_new = match placeholder(panel) {
        Some(p) => state.is_port_touched(panel_id, &p.id),
        None => true,
    };
    if !needs_new {
        return false;
    }
    let fresh = fresh_placeholder(panel);
    if let Some(panel) = state.node_mut(panel_id) {
        panel.ports.push(fresh);
        panel.ports = layout_anchors(std::mem::take(&mut panel.ports));
    }
    true
}

/// Inserts channel ports before the trailing placeholder, skipping ids the
/// panel already has. Returns how many ports were inserted.
pub(crate) fn insert_channels(panel: &mut GraphNode, channels: Vec<PortDefinition>) -> usize {
    let insert_at = match placeholder(panel) {
        Some(_) => panel.ports.len() - 1,
        None => panel.ports.len(),
    };
    let fresh: Vec<PortDefinition> = channels
        .into_iter()
        .filter(|c| !panel.has_port(&c.id))
        .collect();
    let inserted = fresh.len();
    panel.ports.splice(insert_at..insert_at, fresh);
    if placeholder(panel).is_none() {
        let ph = fresh_placeholder(panel);
        panel.ports.push(ph);
    }
    panel.ports = layout_anchors(std::mem::take(&mut panel.ports));
    inserted
}

/// Drops ports that no connection touches, keeping the trailing placeholder.
///
/// Bundled channel ports are kept while any port of the same bundle is still
/// touched. Returns `true` when the panel's ports changed.
pub(crate) fn prune(state: &mut GraphState, panel_id: NodeId) -> bool {
    let Some(panel) = state.node(panel_id) else {
        return false;
    };
    let last = panel.ports.len().saturating_sub(1);
    let touched: Vec<bool> = panel
        .ports
        .iter()
        .map(|p| state.is_port_touched(panel_id, &p.id))
        .collect();

    let keep: Vec<bool> = panel
        .ports
        .iter()
        .enumerate()
        .map(|(i, port)| {
            if touched[i] || (i == last && !port.is_bundled) {
                return true;
            }
            if !port.is_bundled {
                return false;
            }
            let group = bundle_group(&port.id);
            panel
                .ports
                .iter()
                .enumerate()
                .any(|(j, other)| touched[j] && other.is_bundled && bundle_group(&other.id) == group)
        })
        .collect();

    if keep.iter().all(|k| *k) {
        return false;
    }
    if let Some(panel) = state.node_mut(panel_id) {
        let mut flags = keep.into_iter();
        panel.ports.retain(|_| flags.next().unwrap_or(true));
        if placeholder(panel).is_none() {
            let ph = fresh_placeholder(panel);
            panel.ports.push(ph);
        }
        panel.ports = layout_anchors(std::mem::take(&mut panel.ports));
    }
    true
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::node::{NodeCategory, NodeType, Position};

    fn panel(ports: Vec<PortDefinition>) -> GraphNode {
        GraphNode {
            id: NodeId(1),
            node_type: NodeType::InputPanel,
            category: NodeCategory::Boundary,
            position: Position::default(),
            data: Map::new(),
            ports,
            parent_id: None,
            child_ids: Vec::new(),
            special_nodes: Vec::new(),
            internal_viewport: None,
        }
    }

    fn channel(id: &str) -> PortDefinition {
        PortDefinition::output(id, id, PortType::Control).bundled()
    }

    #[test]
    fn channels_go_before_placeholder() {
        let mut p = panel(vec![PortDefinition::output("in-0", "Input", PortType::UNIVERSAL)]);
        let inserted = insert_channels(&mut p, vec![channel("b0-keys-0"), channel("b0-keys-1")]);
        assert_eq!(inserted, 2);
        let ids: Vec<&str> = p.ports.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b0-keys-0", "b0-keys-1", "in-0"]);

        let again = insert_channels(&mut p, vec![channel("b0-keys-0"), channel("b0-keys-1")]);
        assert_eq!(again, 0);
        assert_eq!(p.ports.len(), 3);
    }

    #[test]
    fn placeholder_ids_fill_gaps() {
        let p = panel(vec![
            PortDefinition::output("in-1", "Input", PortType::Control),
            PortDefinition::output("in-2", "Input", PortType::UNIVERSAL),
        ]);
        assert_eq!(next_placeholder_id(&p).as_str(), "in-0");
    }

    #[test]
    fn bundle_group_strips_channel_index() {
        assert_eq!(bundle_group(&PortId::from("b4-keys-12")), Some("b4-keys"));
        assert_eq!(bundle_group(&PortId::from("plain")), None);
    }
}
