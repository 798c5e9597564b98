//! Persisted-state document and load-time migrations.
//!
//! The document is stored under [`STORAGE_KEY`] as
//!
//! ```json
//! { "state": { "nodes": [[id, node], ...], "connections": [[id, conn], ...],
//!              "rootNodeIds": [...], "selectedNodeIds": [...],
//!              "selectedConnectionIds": [...], "history": [...],
//!              "historyIndex": 0 },
//!   "version": 1 }
//! ```
//!
//! Loading never fails. Unparseable JSON, a missing `state` object, or a
//! wrong shape all produce the empty document; individual malformed entries
//! are skipped. Legacy documents are migrated on the way in:
//!
//! - `rootNodeIds` is recomputed when absent;
//! - the legacy `"technical"` type tag becomes `"control"`;
//! - non-array collection fields become empty arrays, and a non-numeric
//!   `historyIndex` becomes 0.
//!
//! The live graph and every history entry are then repaired so they satisfy
//! the store's invariants; a graph that still fails validation loads empty.

use std::collections::HashSet;
use std::hash::Hash;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::error::CoreError;
use crate::graph::{GraphStore, StoreConfig};
use crate::history::History;
use crate::id::{ConnectionId, NodeId};
use crate::node::GraphNode;
use crate::port::{Direction, PortType, SignalType};
use crate::registry::NodeRegistry;
use crate::state::{pairs, GraphState};

/// Versioned key the document is stored under.
pub const STORAGE_KEY: &str = "patchbay-graph-v1";

pub const DOCUMENT_VERSION: u32 = 1;

const LEGACY_CONTROL_TAG: &str = "technical";

const ARRAY_FIELDS: [&str; 6] = [
    "nodes",
    "connections",
    "rootNodeIds",
    "selectedNodeIds",
    "selectedConnectionIds",
    "history",
];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(with = "pairs")]
    pub nodes: IndexMap<NodeId, GraphNode>,
    #[serde(with = "pairs")]
    pub connections: IndexMap<ConnectionId, Connection>,
    pub root_node_ids: Vec<NodeId>,
    pub selected_node_ids: Vec<NodeId>,
    pub selected_connection_ids: Vec<ConnectionId>,
    pub history: Vec<GraphState>,
    pub history_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub state: PersistedState,
    pub version: u32,
}

impl Default for PersistedDocument {
    fn default() -> Self {
        PersistedDocument {
            state: PersistedState::default(),
            version: DOCUMENT_VERSION,
        }
    }
}

impl PersistedDocument {
    /// Captures the store's graph, selection and history.
    pub fn from_store(store: &GraphStore) -> Self {
        PersistedDocument {
            state: PersistedState {
                nodes: store.state.nodes.clone(),
                connections: store.state.connections.clone(),
                root_node_ids: store.root_node_ids(),
                selected_node_ids: store.selected_node_ids(),
                selected_connection_ids: store.selected_connection_ids(),
                history: store.history.entries().to_vec(),
                history_index: store.history.index(),
            },
            version: DOCUMENT_VERSION,
        }
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Drops undo history, keeping the live graph.
    pub fn clear_history(&mut self) {
        self.state.history.clear();
        self.state.history_index = 0;
    }

    /// Parses a stored document, migrating legacy shapes. Never fails.
    pub fn from_json(json: &str) -> Self {
        let mut value: Value = match serde_json::from_str(json) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "stored graph is not valid JSON, starting empty");
                return Self::default();
            }
        };
        let Some(state) = value.get_mut("state").filter(|s| s.is_object()) else {
            warn!("stored graph has no state object, starting empty");
            return Self::default();
        };

        let renamed = rename_legacy_tags(state);
        if renamed > 0 {
            info!(renamed, "migrated legacy type tags");
        }
        coerce_shape(state);

        let mut live = GraphState {
            nodes: parse_pairs(state.get("nodes")),
            connections: parse_pairs(state.get("connections")),
        };
        let repaired = repair(&mut live);
        if repaired > 0 {
            info!(repaired, "repaired inconsistent graph");
        }

        let root_node_ids = match state.get("rootNodeIds") {
            Some(ids) => parse_list(Some(ids)),
            None => {
                info!("recomputing root node ids");
                live.root_ids()
            }
        };
        let mut history_repairs = 0;
        let history: Vec<GraphState> = state
            .get("history")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| {
                        let mut snapshot = parse_state(entry);
                        history_repairs += repair(&mut snapshot);
                        snapshot
                    })
                    .collect()
            })
            .unwrap_or_default();
        if history_repairs > 0 {
            info!(repaired = history_repairs, "repaired inconsistent history entries");
        }
        let history_index = state
            .get("historyIndex")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(0)
            .min(history.len());

        PersistedDocument {
            state: PersistedState {
                selected_node_ids: parse_list(state.get("selectedNodeIds")),
                selected_connection_ids: parse_list(state.get("selectedConnectionIds")),
                nodes: live.nodes,
                connections: live.connections,
                root_node_ids,
                history,
                history_index,
            },
            version: DOCUMENT_VERSION,
        }
    }

    /// Builds a store from the document. The id allocator is seeded past
    /// every id in the live graph and in history.
    pub fn into_store(self, registry: NodeRegistry, config: StoreConfig) -> GraphStore {
        let capacity = config.history_capacity;
        let mut store = GraphStore::with_config(registry, config);
        let PersistedState {
            nodes,
            connections,
            selected_node_ids,
            selected_connection_ids,
            history,
            history_index,
            ..
        } = self.state;

        for state in history.iter().chain(std::iter::once(&GraphState {
            nodes: nodes.clone(),
            connections: connections.clone(),
        })) {
            for id in state.nodes.keys() {
                store.ids.observe_node(*id);
            }
            for id in state.connections.keys() {
                store.ids.observe_connection(*id);
            }
        }

        store.state = GraphState { nodes, connections };
        store.history = History::from_parts(history, history_index, capacity);
        let violations = store.validate();
        if !violations.is_empty() {
            warn!(?violations, "loaded graph is inconsistent, starting empty");
            store.state = GraphState::new();
            store.history = History::from_parts(Vec::new(), 0, capacity);
            return store;
        }
        store
            .selected_nodes
            .extend(selected_node_ids.into_iter().filter(|id| store.state.node(*id).is_some()));
        store.selected_connections.extend(
            selected_connection_ids
                .into_iter()
                .filter(|id| store.state.connection(*id).is_some()),
        );
        store
    }
}

/// Brings a loaded graph back in line with the store's invariants so later
/// edits start from a consistent state. Returns the number of fixes.
///
/// Nodes with a missing, self or cyclic parent become roots, child lists are
/// rebuilt from the parent links, duplicate ports are dropped, connections
/// that are dangling, self-looped or cross-level are dropped, an audio input
/// keeps only its first wire, and universal ports of unconnected nodes are
/// unresolved.
fn repair(state: &mut GraphState) -> usize {
    let mut fixes = 0;
    for (key, node) in state.nodes.iter_mut() {
        if node.id != *key {
            node.id = *key;
            fixes += 1;
        }
    }
    for (key, conn) in state.connections.iter_mut() {
        if conn.id != *key {
            conn.id = *key;
            fixes += 1;
        }
    }

    let ids: Vec<NodeId> = state.nodes.keys().copied().collect();
    for id in &ids {
        let orphaned = state
            .node(*id)
            .and_then(|n| n.parent_id)
            .is_some_and(|parent| state.node(parent).is_none() || state.ancestors(*id).contains(id));
        if orphaned {
            if let Some(node) = state.node_mut(*id) {
                node.parent_id = None;
                fixes += 1;
            }
        }
    }

    let mut children: IndexMap<NodeId, Vec<NodeId>> = IndexMap::new();
    for node in state.nodes.values() {
        if let Some(parent) = node.parent_id {
            children.entry(parent).or_default().push(node.id);
        }
    }
    for node in state.nodes.values_mut() {
        let actual = children.shift_remove(&node.id).unwrap_or_default();
        let mut rebuilt: Vec<NodeId> = Vec::with_capacity(actual.len());
        for child in node.child_ids.iter().chain(actual.iter()) {
            if actual.contains(child) && !rebuilt.contains(child) {
                rebuilt.push(*child);
            }
        }
        if rebuilt != node.child_ids {
            node.child_ids = rebuilt;
            fixes += 1;
        }
        let specials = node.special_nodes.len();
        let listed = &node.child_ids;
        node.special_nodes.retain(|s| listed.contains(s));
        fixes += specials - node.special_nodes.len();

        let ports = node.ports.len();
        let mut seen = HashSet::new();
        node.ports.retain(|p| seen.insert(p.id.clone()));
        fixes += ports - node.ports.len();
    }

    let mut audio_inputs = HashSet::new();
    let doomed: Vec<ConnectionId> = state
        .connections
        .values()
        .filter(|conn| {
            let parent_of = |id: NodeId| state.node(id).map(|n| n.parent_id);
            let broken = conn.source_node_id == conn.target_node_id
                || !conn
                    .endpoints()
                    .into_iter()
                    .all(|(node, port)| state.endpoint_exists(node, port))
                || parent_of(conn.source_node_id) != parent_of(conn.target_node_id);
            if broken {
                return true;
            }
            let is_audio_input = state
                .node(conn.target_node_id)
                .and_then(|n| n.port(&conn.target_port_id))
                .is_some_and(|p| {
                    p.direction == Direction::Input
                        && !p.is_bundled
                        && p.effective_type() == Some(SignalType::Audio)
                });
            is_audio_input && !audio_inputs.insert((conn.target_node_id, conn.target_port_id.clone()))
        })
        .map(|conn| conn.id)
        .collect();
    for id in doomed {
        state.connections.shift_remove(&id);
        fixes += 1;
    }

    let stale: Vec<NodeId> = state
        .nodes
        .values()
        .filter(|n| {
            n.ports.iter().any(|p| {
                p.id.split_composite().is_none() && p.port_type.is_universal() && p.effective_type().is_some()
            })
        })
        .map(|n| n.id)
        .filter(|id| !state.has_connections(*id))
        .collect();
    for id in stale {
        if let Some(node) = state.node_mut(id) {
            for port in node
                .ports
                .iter_mut()
                .filter(|p| p.id.split_composite().is_none() && p.port_type.is_universal())
            {
                port.port_type = PortType::UNIVERSAL;
            }
            fixes += 1;
        }
    }
    fixes
}

/// Rewrites `"type": "technical"` to `"type": "control"` anywhere in
/// `value`. Returns the number of rewrites.
fn rename_legacy_tags(value: &mut Value) -> usize {
    match value {
        Value::Object(map) => {
            let mut count = 0;
            if let Some(tag) = map.get_mut("type") {
                if tag.as_str() == Some(LEGACY_CONTROL_TAG) {
                    *tag = Value::from("control");
                    count += 1;
                }
            }
            count + map.values_mut().map(rename_legacy_tags).sum::<usize>()
        }
        Value::Array(items) => items.iter_mut().map(rename_legacy_tags).sum(),
        _ => 0,
    }
}

fn coerce_shape(state: &mut Value) {
    let Some(map) = state.as_object_mut() else {
        return;
    };
    for field in ARRAY_FIELDS {
        if let Some(value) = map.get_mut(field) {
            if !value.is_array() {
                info!(field, "coercing non-array field to empty");
                *value = Value::Array(Vec::new());
            }
        }
    }
    if let Some(index) = map.get_mut("historyIndex") {
        if !index.is_number() {
            *index = Value::from(0);
        }
    }
}

/// `[[key, value], ...]` pairs, skipping malformed entries.
fn parse_pairs<K, V>(value: Option<&Value>) -> IndexMap<K, V>
where
    K: DeserializeOwned + Eq + Hash,
    V: DeserializeOwned,
{
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<(K, V)>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_list<T: DeserializeOwned>(value: Option<&Value>) -> Vec<T> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_state(value: &Value) -> GraphState {
    let field = |name: &str| value.get(name).filter(|v| v.is_array());
    GraphState {
        nodes: parse_pairs(field("nodes")),
        connections: parse_pairs(field("connections")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::id::PortId;
    use crate::node::{NodeType, Position};
    use crate::port::{PortType, SignalType};

    fn sample_store() -> GraphStore {
        let mut store = GraphStore::new();
        let lfo = store.add_node(NodeType::Lfo, Position::default(), None, None).unwrap();
        let filter = store.add_node(NodeType::Filter, Position::default(), None, None).unwrap();
        store
            .add_connection(lfo, &PortId::from("control"), filter, &PortId::from("cutoff"))
            .unwrap();
        store.select_node(filter, false);
        store
    }

    #[test]
    fn garbage_loads_as_empty() {
        assert_eq!(PersistedDocument::from_json("not json"), PersistedDocument::default());
        assert_eq!(PersistedDocument::from_json("{}"), PersistedDocument::default());
        assert_eq!(
            PersistedDocument::from_json(r#"{"state": 3}"#),
            PersistedDocument::default()
        );
    }

    #[test]
    fn store_round_trips_through_json() {
        let store = sample_store();
        let json = PersistedDocument::from_store(&store).to_json().unwrap();
        let loaded = PersistedDocument::from_json(&json).into_store(NodeRegistry::builtin(), StoreConfig::default());

        assert_eq!(loaded.snapshot(), store.snapshot());
        assert_eq!(loaded.selected_node_ids(), store.selected_node_ids());
        assert_eq!(loaded.history().entries(), store.history().entries());
        assert_eq!(loaded.history().index(), store.history().index());
    }

    #[test]
    fn loaded_store_never_reuses_ids() {
        let store = sample_store();
        let json = PersistedDocument::from_store(&store).to_json().unwrap();
        let mut loaded =
            PersistedDocument::from_json(&json).into_store(NodeRegistry::builtin(), StoreConfig::default());
        let id = loaded
            .add_node(NodeType::Oscillator, Position::default(), None, None)
            .unwrap();
        assert!(store.node(id).is_none());
    }

    #[test]
    fn legacy_technical_tag_becomes_control() {
        let doc = json!({
            "state": {
                "nodes": [[0, {
                    "id": 0, "type": "lfo", "category": "modulator",
                    "position": { "x": 0.0, "y": 0.0 },
                    "ports": [{ "id": "control", "name": "Control", "type": "technical",
                                "direction": "output", "isBundled": false,
                                "position": { "x": 1.0, "y": 0.5 } }]
                }]],
                "connections": "oops",
                "historyIndex": "three"
            }
        });
        let loaded = PersistedDocument::from_json(&doc.to_string());
        let node = &loaded.state.nodes[&NodeId(0)];
        assert_eq!(node.ports[0].port_type, PortType::Control);
        assert!(loaded.state.connections.is_empty());
        assert_eq!(loaded.state.history_index, 0);
        assert_eq!(loaded.state.root_node_ids, vec![NodeId(0)]);
    }

    #[test]
    fn dangling_connections_are_dropped() {
        let doc = json!({
            "state": {
                "nodes": [],
                "connections": [[4, {
                    "id": 4, "sourceNodeId": 1, "sourcePortId": "audio",
                    "targetNodeId": 2, "targetPortId": "audio", "type": "technical"
                }]]
            }
        });
        let loaded = PersistedDocument::from_json(&doc.to_string());
        assert!(loaded.state.connections.is_empty());
    }

    /// Serializes `store`, lets `edit` damage the stored state, and loads it
    /// back.
    fn reload_damaged(store: &GraphStore, edit: impl FnOnce(&mut Value)) -> GraphStore {
        let mut doc = serde_json::to_value(PersistedDocument::from_store(store)).unwrap();
        edit(&mut doc["state"]);
        PersistedDocument::from_json(&doc.to_string()).into_store(NodeRegistry::builtin(), StoreConfig::default())
    }

    fn node_entry(state: &mut Value, id: NodeId) -> &mut Value {
        state["nodes"]
            .as_array_mut()
            .unwrap()
            .iter_mut()
            .find(|pair| pair[0] == json!(id.0))
            .map(|pair| &mut pair[1])
            .unwrap()
    }

    #[test]
    fn node_with_missing_parent_becomes_editable_root() {
        let mut store = GraphStore::new();
        let group = store.add_node(NodeType::Group, Position::default(), None, None).unwrap();
        let osc = store
            .add_node(NodeType::Oscillator, Position::default(), Some(group), None)
            .unwrap();

        let mut loaded = reload_damaged(&store, |state| {
            state["nodes"]
                .as_array_mut()
                .unwrap()
                .retain(|pair| pair[0] != json!(group.0));
        });
        assert!(loaded.validate().is_empty());
        assert_eq!(loaded.node(osc).unwrap().parent_id, None);
        assert!(loaded.root_node_ids().contains(&osc));

        let speaker = loaded
            .add_node(NodeType::Speaker, Position::default(), None, None)
            .unwrap();
        assert!(loaded
            .add_connection(osc, &PortId::from("audio"), speaker, &PortId::from("audio"))
            .is_some());
        assert!(matches!(loaded.remove_node(osc), crate::graph::RemoveOutcome::Removed { .. }));
    }

    #[test]
    fn parent_cycle_is_broken_on_load() {
        let mut store = GraphStore::new();
        let a = store.add_node(NodeType::Group, Position::default(), None, None).unwrap();
        let b = store.add_node(NodeType::Group, Position::default(), None, None).unwrap();

        let mut loaded = reload_damaged(&store, |state| {
            node_entry(state, a)["parentId"] = json!(b.0);
            node_entry(state, b)["parentId"] = json!(a.0);
            node_entry(state, a)["childIds"] = json!([b.0]);
            node_entry(state, b)["childIds"] = json!([a.0]);
        });
        assert!(loaded.validate().is_empty());
        assert!(!loaded.root_node_ids().is_empty());
        assert!(loaded
            .add_node(NodeType::Oscillator, Position::default(), Some(a), None)
            .is_some());
    }

    #[test]
    fn stray_children_and_duplicate_ports_are_dropped() {
        let mut store = GraphStore::new();
        let group = store.add_node(NodeType::Group, Position::default(), None, None).unwrap();
        let osc = store
            .add_node(NodeType::Oscillator, Position::default(), Some(group), None)
            .unwrap();
        let children = store.node(group).unwrap().child_ids.clone();
        let ports = store.node(osc).unwrap().ports.len();

        let mut loaded = reload_damaged(&store, |state| {
            let mut listed: Vec<Value> = children.iter().map(|c| json!(c.0)).collect();
            listed.push(json!(9999));
            listed.push(json!(osc.0));
            node_entry(state, group)["childIds"] = Value::Array(listed);
            let node = node_entry(state, osc);
            let first = node["ports"][0].clone();
            node["ports"].as_array_mut().unwrap().push(first);
        });
        assert!(loaded.validate().is_empty());
        assert_eq!(loaded.node(group).unwrap().child_ids, children);
        assert_eq!(loaded.node(osc).unwrap().ports.len(), ports);
        assert!(loaded.update_node_position(osc, Position::new(10.0, 10.0)));
    }

    #[test]
    fn shared_audio_input_and_stale_resolution_are_repaired() {
        let mut store = GraphStore::new();
        let first = store.add_node(NodeType::Oscillator, Position::default(), None, None).unwrap();
        let second = store.add_node(NodeType::Oscillator, Position::default(), None, None).unwrap();
        let speaker = store.add_node(NodeType::Speaker, Position::default(), None, None).unwrap();
        let relay = store.add_node(NodeType::Relay, Position::default(), None, None).unwrap();
        let kept = store
            .add_connection(first, &PortId::from("audio"), speaker, &PortId::from("audio"))
            .unwrap();

        let mut loaded = reload_damaged(&store, |state| {
            let connections = state["connections"].as_array_mut().unwrap();
            let mut extra = connections[0].clone();
            extra[0] = json!(900);
            extra[1]["id"] = json!(900);
            extra[1]["sourceNodeId"] = json!(second.0);
            connections.push(extra);
            node_entry(state, relay)["ports"][0]["type"] = json!({ "universal": { "resolved": "audio" } });
        });
        assert!(loaded.validate().is_empty());
        assert_eq!(loaded.connections().keys().copied().collect::<Vec<_>>(), vec![kept]);
        assert!(loaded
            .node(relay)
            .unwrap()
            .ports
            .iter()
            .all(|p| p.port_type == PortType::UNIVERSAL));

        let lfo = loaded.add_node(NodeType::Lfo, Position::default(), None, None).unwrap();
        assert!(loaded
            .add_connection(lfo, &PortId::from("control"), relay, &PortId::from("in"))
            .is_some());
    }

    #[test]
    fn clear_history_keeps_graph() {
        let store = sample_store();
        let mut doc = PersistedDocument::from_store(&store);
        doc.clear_history();
        assert!(doc.state.history.is_empty());
        assert_eq!(doc.state.nodes.len(), 2);
        assert_eq!(
            doc.state.connections.values().next().map(|c| c.conn_type),
            Some(SignalType::Control)
        );
    }
}
