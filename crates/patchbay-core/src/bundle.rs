//! Bundle resolver: fans one bundled wire out into per-channel ports.
//!
//! When a bundled output lands on a container, the container's input panel
//! grows one channel port per channel (`b{src}-{srcPort}-{i}`), and the wire
//! is re-addressed to the first of them. Instrument containers also get an
//! [`InstrumentRow`] plus one key input per channel on their voice
//! (`key-{src}-{srcPort}-{i}`), wired from the matching channel port.
//!
//! Without a panel, or when the source reports no channels, nothing expands
//! and the wire stays a single bundled connection.

use std::collections::HashMap;

use tracing::debug;

use crate::connection::Connection;
use crate::id::{IdAllocator, NodeId, PortId};
use crate::instrument::{self, InstrumentRow};
use crate::node::{NodeCategory, NodeType};
use crate::panel;
use crate::port::{PortDefinition, PortType, SignalType};
use crate::registry::{layout_anchors, BoundaryRole, NodeRegistry};
use crate::state::GraphState;

/// Where a bundled connection will land once expanded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BundlePlan {
    pub channels: usize,
    pub panel: NodeId,
    /// Channel port prefix on the panel, `b{src}-{srcPort}`.
    pub group: String,
    /// Composite port on the target addressing channel 0.
    pub target_port: PortId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BundleOutcome {
    pub ports_added: usize,
    pub row_created: bool,
    pub wires_added: usize,
}

/// Key port prefix on the voice matching a panel channel group.
pub(crate) fn key_group(group: &str) -> String {
    format!("key-{}", group.strip_prefix('b').unwrap_or(group))
}

/// Rewrites the source node embedded in a bundle-derived id (`b{src}-..`,
/// `key-{src}-..`, `row-{src}-..`) through `map`. `None` when `id` carries
/// no source or the source is not in `map`.
pub(crate) fn rename_source(id: &str, map: &HashMap<NodeId, NodeId>) -> Option<String> {
    let (prefix, rest) = ["key-", "row-", "b"]
        .iter()
        .find_map(|prefix| id.strip_prefix(prefix).map(|rest| (*prefix, rest)))?;
    let (digits, tail) = rest.split_once('-')?;
    let source = NodeId(digits.parse().ok()?);
    let renamed = map.get(&source)?;
    Some(format!("{prefix}{renamed}-{tail}"))
}

fn channel_port(group: &str, i: usize) -> PortId {
    PortId(format!("{group}-{i}"))
}

/// The panel a wire into `(target, target_port)` expands on: the panel the
/// composite port addresses, else the target's first panel child.
fn locate_panel(
    state: &GraphState,
    registry: &NodeRegistry,
    target: NodeId,
    target_port: &PortId,
) -> Option<NodeId> {
    let is_panel = |id: NodeId| {
        state
            .node(id)
            .is_some_and(|n| registry.boundary_role(n.node_type) == Some(BoundaryRole::Panel))
    };
    let (addressed, _) = state.resolve_endpoint(target, target_port);
    if addressed != target && is_panel(addressed) {
        return Some(addressed);
    }
    state
        .node(target)?
        .child_ids
        .iter()
        .copied()
        .find(|id| is_panel(*id))
}

/// Works out how a bundled wire from `(source, source_port)` to `target`
/// expands. `None` means the degraded single-wire mode.
pub(crate) fn plan(
    state: &GraphState,
    registry: &NodeRegistry,
    source: NodeId,
    source_port: &PortId,
    target: NodeId,
    target_port: &PortId,
) -> Option<BundlePlan> {
    let channels = registry.channel_count(state.node(source)?);
    if channels == 0 {
        return None;
    }
    let panel = locate_panel(state, registry, target, target_port)?;
    let group = format!("b{}-{}", source.0, source_port);
    let target_port = PortId::composite(panel, &channel_port(&group, 0));
    Some(BundlePlan {
        channels,
        panel,
        group,
        target_port,
    })
}

/// Expands the panel, and for instruments adds the row, key ports and
/// internal wires. The bundled connection itself is created by the caller.
pub(crate) fn apply(
    state: &mut GraphState,
    ids: &mut IdAllocator,
    plan: &BundlePlan,
    source: NodeId,
    source_port: &PortId,
    target: NodeId,
) -> BundleOutcome {
    let mut outcome = BundleOutcome::default();
    let source_label = state
        .node(source)
        .map(|n| n.label())
        .unwrap_or_else(|| "Bundle".to_string());

    let channels: Vec<PortDefinition> = (0..plan.channels)
        .map(|i| {
            let id = channel_port(&plan.group, i);
            PortDefinition::output(id.as_str(), &format!("{source_label} {}", i + 1), PortType::Control)
                .bundled()
        })
        .collect();
    if let Some(panel) = state.node_mut(plan.panel) {
        outcome.ports_added = panel::insert_channels(panel, channels);
    }

    let Some(target_node) = state.node(target) else {
        return outcome;
    };
    if target_node.category != NodeCategory::Instrument {
        return outcome;
    }
    let Some(voice) = target_node
        .child_ids
        .iter()
        .copied()
        .find(|id| state.node(*id).is_some_and(|n| n.node_type == NodeType::InstrumentVoice))
    else {
        debug!(%target, "instrument has no voice, skipping row");
        return outcome;
    };

    let mut rows = instrument::rows(target_node);
    if !rows
        .iter()
        .any(|r| r.source_node_id == source && &r.source_port_id == source_port)
    {
        rows.push(InstrumentRow::new(
            format!("row-{}-{}", source.0, source_port),
            source,
            source_port.clone(),
            plan.target_port.clone(),
            source_label,
            plan.channels,
        ));
        if let Some(target_node) = state.node_mut(target) {
            instrument::write_rows(target_node, &rows);
        }
        outcome.row_created = true;
    }

    let keys = key_group(&plan.group);
    if let Some(voice_node) = state.node_mut(voice) {
        for i in 0..plan.channels {
            let id = channel_port(&keys, i);
            if !voice_node.has_port(&id) {
                voice_node.ports.push(PortDefinition::input(
                    id.as_str(),
                    &format!("Key {}", i + 1),
                    PortType::Control,
                ));
            }
        }
        voice_node.ports = layout_anchors(std::mem::take(&mut voice_node.ports));
    }

    for i in 0..plan.channels {
        let from = channel_port(&plan.group, i);
        let to = channel_port(&keys, i);
        if state.find_identical(plan.panel, &from, voice, &to).is_some() {
            continue;
        }
        let id = ids.next_connection();
        state.connections.insert(
            id,
            Connection {
                id,
                source_node_id: plan.panel,
                source_port_id: from,
                target_node_id: voice,
                target_port_id: to,
                conn_type: SignalType::Control,
                is_bundled: false,
            },
        );
        outcome.wires_added += 1;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use crate::node::Position;

    #[test]
    fn key_group_mirrors_channel_group() {
        assert_eq!(key_group("b3-keys"), "key-3-keys");
    }

    #[test]
    fn rename_source_rewrites_every_bundle_id_shape() {
        let map: HashMap<NodeId, NodeId> = [(NodeId(3), NodeId(41))].into_iter().collect();
        assert_eq!(rename_source("b3-keys-7", &map).as_deref(), Some("b41-keys-7"));
        assert_eq!(rename_source("key-3-keys-0", &map).as_deref(), Some("key-41-keys-0"));
        assert_eq!(rename_source("row-3-keys", &map).as_deref(), Some("row-41-keys"));
        assert_eq!(rename_source("b5-keys-0", &map), None);
        assert_eq!(rename_source("bass-1", &map), None);
        assert_eq!(rename_source("in-0", &map), None);
    }

    #[test]
    fn plan_targets_first_channel_on_panel() {
        let mut store = GraphStore::new();
        let keyboard = store.add_node(NodeType::Keyboard, Position::default(), None, None).unwrap();
        let piano = store.add_node(NodeType::Piano, Position::default(), None, None).unwrap();
        let panel_id = store.node(piano).unwrap().child_ids[0];
        let placeholder = store.node(piano).unwrap().ports[0].id.clone();

        let plan = plan(
            store.state(),
            store.registry(),
            keyboard,
            &PortId::from("keys"),
            piano,
            &placeholder,
        )
        .unwrap();
        assert_eq!(plan.channels, 30);
        assert_eq!(plan.panel, panel_id);
        assert_eq!(plan.target_port.to_string(), format!("{panel_id}:b{keyboard}-keys-0"));
    }

    #[test]
    fn no_channels_means_no_plan() {
        let mut store = GraphStore::new();
        let mut data = serde_json::Map::new();
        data.insert("keyCount".into(), serde_json::json!(0));
        let keyboard = store
            .add_node(NodeType::Keyboard, Position::default(), None, Some(data))
            .unwrap();
        let piano = store.add_node(NodeType::Piano, Position::default(), None, None).unwrap();
        let placeholder = store.node(piano).unwrap().ports[0].id.clone();
        assert!(plan(
            store.state(),
            store.registry(),
            keyboard,
            &PortId::from("keys"),
            piano,
            &placeholder
        )
        .is_none());
    }
}
