//! Core error types for patchbay-core.
//!
//! Caller-supplied bad ids never produce errors: store operations answer them
//! with `None`/`false`. `CoreError` is reserved for structural rejections
//! (cycles), registry programming errors, and serialization failures.

use crate::id::NodeId;
use crate::node::NodeType;
use thiserror::Error;

/// Core errors produced by the patchbay-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The registry has no definition for a node type.
    #[error("no registry definition for node type '{node_type}'")]
    UnknownNodeType { node_type: NodeType },

    /// A node id was not found in the graph.
    #[error("node not found: NodeId({id})", id = id.0)]
    NodeNotFound { id: NodeId },

    /// Moving `node` under `parent` would make it its own ancestor.
    #[error("moving NodeId({node}) under NodeId({parent}) would create a cycle", node = node.0, parent = parent.0)]
    CycleDetected { node: NodeId, parent: NodeId },

    /// A level's connections form a feedback loop through `node`.
    #[error("feedback loop through NodeId({node})", node = node.0)]
    FeedbackLoop { node: NodeId },

    /// A registry template nests deeper than the materialization limit.
    #[error("template for '{node_type}' nests deeper than {limit} levels")]
    TemplateTooDeep { node_type: NodeType, limit: usize },

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
