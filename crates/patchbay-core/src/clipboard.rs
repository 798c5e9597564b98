//! Clipboard capture and id remapping for copy/paste.

use std::collections::HashMap;

use crate::bundle;
use crate::connection::Connection;
use crate::id::{IdAllocator, NodeId, PortId};
use crate::instrument;
use crate::node::{GraphNode, Position};
use crate::state::GraphState;

/// A detached copy of some nodes, their descendants, and the connections
/// running strictly between them.
#[derive(Debug, Clone, PartialEq)]
pub struct Clipboard {
    pub nodes: Vec<GraphNode>,
    pub connections: Vec<Connection>,
    /// Copied nodes whose parent was not copied, in selection order.
    pub roots: Vec<NodeId>,
    /// Top-left corner of the roots' positions.
    pub origin: Position,
    /// Parent the roots were copied from.
    pub parent: Option<NodeId>,
}

/// Freshly numbered copies ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Pasted {
    pub nodes: Vec<GraphNode>,
    pub connections: Vec<Connection>,
    pub roots: Vec<NodeId>,
}

impl Clipboard {
    /// Captures `selected` plus descendants. `None` when nothing selected
    /// exists anymore.
    pub fn capture(state: &GraphState, selected: &[NodeId]) -> Option<Clipboard> {
        let selected: Vec<NodeId> = selected
            .iter()
            .copied()
            .filter(|id| state.node(*id).is_some())
            .collect();
        // A selected node under another selected node travels with it.
        let roots: Vec<NodeId> = selected
            .iter()
            .copied()
            .filter(|id| !state.ancestors(*id).iter().any(|a| selected.contains(a)))
            .collect();
        if roots.is_empty() {
            return None;
        }

        let mut ids = Vec::new();
        for root in &roots {
            for id in state.closure(*root) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        let nodes: Vec<GraphNode> = ids.iter().filter_map(|id| state.node(*id).cloned()).collect();
        let connections = state
            .connections
            .values()
            .filter(|c| ids.contains(&c.source_node_id) && ids.contains(&c.target_node_id))
            .cloned()
            .collect();

        let origin = roots
            .iter()
            .filter_map(|id| state.node(*id))
            .map(|n| n.position)
            .fold(None, |acc: Option<Position>, p| {
                Some(match acc {
                    None => p,
                    Some(a) => Position::new(a.x.min(p.x), a.y.min(p.y)),
                })
            })
            .unwrap_or_default();
        let parent = state.node(roots[0]).and_then(|n| n.parent_id);

        Some(Clipboard {
            nodes,
            connections,
            roots,
            origin,
            parent,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Renumbers every copied node and connection. Roots are re-parented
    /// under `parent` and moved by `delta`.
    pub(crate) fn instantiate(
        &self,
        ids: &mut IdAllocator,
        parent: Option<NodeId>,
        delta: (f64, f64),
    ) -> Pasted {
        let map: HashMap<NodeId, NodeId> = self
            .nodes
            .iter()
            .map(|n| (n.id, ids.next_node()))
            .collect();
        let remap = |id: NodeId| map.get(&id).copied();

        let nodes = self
            .nodes
            .iter()
            .filter_map(|original| {
                let mut node = original.clone();
                node.id = remap(original.id)?;
                match original.parent_id.and_then(remap) {
                    Some(p) => node.parent_id = Some(p),
                    None => {
                        node.parent_id = parent;
                        node.position = original.position.offset(delta.0, delta.1);
                    }
                }
                node.child_ids = original.child_ids.iter().filter_map(|c| remap(*c)).collect();
                node.special_nodes = original.special_nodes.iter().filter_map(|c| remap(*c)).collect();
                for port in &mut node.ports {
                    port.id = remap_port(&port.id, &map);
                }
                if node.data.contains_key("rows") {
                    let rows: Vec<_> = instrument::rows(&node)
                        .into_iter()
                        .map(|mut row| {
                            row.source_node_id = remap(row.source_node_id).unwrap_or(row.source_node_id);
                            row.target_port_id = remap_port(&row.target_port_id, &map);
                            if let Some(row_id) = bundle::rename_source(&row.row_id, &map) {
                                row.row_id = row_id;
                            }
                            row
                        })
                        .collect();
                    instrument::write_rows(&mut node, &rows);
                }
                Some(node)
            })
            .collect();

        let connections = self
            .connections
            .iter()
            .filter_map(|original| {
                let mut conn = original.clone();
                conn.source_node_id = remap(original.source_node_id)?;
                conn.target_node_id = remap(original.target_node_id)?;
                conn.source_port_id = remap_port(&original.source_port_id, &map);
                conn.target_port_id = remap_port(&original.target_port_id, &map);
                conn.id = ids.next_connection();
                Some(conn)
            })
            .collect();

        let roots = self.roots.iter().filter_map(|r| remap(*r)).collect();
        Pasted {
            nodes,
            connections,
            roots,
        }
    }
}

/// Rewrites the node ids a port id carries through `map`: the child half of
/// a composite id, and the source of a bundle channel or key port.
fn remap_port(port: &PortId, map: &HashMap<NodeId, NodeId>) -> PortId {
    match port.split_composite() {
        Some((child, inner)) => match map.get(&child) {
            Some(new_child) => PortId::composite(*new_child, &remap_bundle_port(&inner, map)),
            None => port.clone(),
        },
        None => remap_bundle_port(port, map),
    }
}

fn remap_bundle_port(port: &PortId, map: &HashMap<NodeId, NodeId>) -> PortId {
    bundle::rename_source(port.as_str(), map)
        .map(PortId)
        .unwrap_or_else(|| port.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_port_rewrites_composite_child() {
        let map: HashMap<NodeId, NodeId> = [(NodeId(3), NodeId(40))].into_iter().collect();
        assert_eq!(remap_port(&PortId::from("3:in-0"), &map), PortId::from("40:in-0"));
        assert_eq!(remap_port(&PortId::from("5:in-0"), &map), PortId::from("5:in-0"));
        assert_eq!(remap_port(&PortId::from("audio"), &map), PortId::from("audio"));
    }

    #[test]
    fn remap_port_follows_copied_bundle_source() {
        let map: HashMap<NodeId, NodeId> = [(NodeId(3), NodeId(40)), (NodeId(8), NodeId(44))]
            .into_iter()
            .collect();
        assert_eq!(remap_port(&PortId::from("8:b3-keys-0"), &map), PortId::from("44:b40-keys-0"));
        assert_eq!(remap_port(&PortId::from("key-3-keys-2"), &map), PortId::from("key-40-keys-2"));
        assert_eq!(remap_port(&PortId::from("b9-keys-2"), &map), PortId::from("b9-keys-2"));
    }
}
