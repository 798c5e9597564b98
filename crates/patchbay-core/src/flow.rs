//! Signal-flow view of one graph level for downstream audio builders.
//!
//! A level is the set of nodes directly under one parent (or the roots). Its
//! connections become a petgraph [`DiGraph`], which gives builders a
//! processing order and tells them when the patch contains a feedback loop.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::CoreError;
use crate::id::{ConnectionId, NodeId};
use crate::state::GraphState;

/// Directed graph of one level: node weights are node ids, edge weights are
/// the connections between them.
pub struct LevelGraph {
    pub graph: DiGraph<NodeId, ConnectionId>,
    pub indices: HashMap<NodeId, NodeIndex>,
}

impl LevelGraph {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Nodes feeding directly into `node`.
    pub fn upstream(&self, node: NodeId) -> Vec<NodeId> {
        let Some(index) = self.indices.get(&node) else {
            return Vec::new();
        };
        let mut ids: Vec<NodeId> = self
            .graph
            .neighbors_directed(*index, petgraph::Direction::Incoming)
            .map(|i| self.graph[i])
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Builds the flow graph of the level under `parent` (`None` = root).
pub fn level_graph(state: &GraphState, parent: Option<NodeId>) -> LevelGraph {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::new();
    for id in state.level(parent) {
        indices.insert(id, graph.add_node(id));
    }
    for conn in state.connections.values() {
        let (Some(from), Some(to)) = (
            indices.get(&conn.source_node_id),
            indices.get(&conn.target_node_id),
        ) else {
            continue;
        };
        graph.add_edge(*from, *to, conn.id);
    }
    LevelGraph { graph, indices }
}

/// Topological order of the level under `parent`: every node comes after
/// all nodes feeding it.
pub fn processing_order(state: &GraphState, parent: Option<NodeId>) -> Result<Vec<NodeId>, CoreError> {
    let level = level_graph(state, parent);
    let sorted = toposort(&level.graph, None).map_err(|cycle| CoreError::FeedbackLoop {
        node: level.graph[cycle.node_id()],
    })?;
    Ok(sorted.into_iter().map(|i| level.graph[i]).collect())
}
