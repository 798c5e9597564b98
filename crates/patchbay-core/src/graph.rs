//! GraphStore: the single owner of the patch graph.
//!
//! [`GraphStore`] holds the canonical [`GraphState`] plus everything that is
//! deliberately *not* part of an undo snapshot: the selection, the clipboard,
//! the id allocator, the version counter and the flash signal.
//!
//! Every mutation follows the same shape: validate (rejections return
//! `None`/`false` and touch nothing), clone the live state, mutate, drain the
//! [`Effects`] queue once, push the clone onto history, bump `version`. In
//! debug builds the invariant checker runs after each commit.

use std::ops::RangeInclusive;

use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::bundle;
use crate::clipboard::Clipboard;
use crate::connection::Connection;
use crate::effects::{self, Effect, Effects};
use crate::error::CoreError;
use crate::history::{History, DEFAULT_CAPACITY};
use crate::id::{ConnectionId, IdAllocator, NodeId, PortId};
use crate::instrument::{self, RowPatch};
use crate::node::{GraphNode, NodeCategory, NodeType, Position, Viewport};
use crate::panel;
use crate::port::{Direction, PortDefinition, Resolution, SignalType};
use crate::registry::{layout_anchors, BoundaryRole, NodeRegistry, PROPAGATED_FIELDS};
use crate::state::GraphState;
use crate::sync;

/// Templates deeper than this are a registry bug.
const MAX_TEMPLATE_DEPTH: usize = 8;

/// Tunables for a [`GraphStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Maximum number of undo snapshots kept.
    pub history_capacity: usize,
    /// Offset applied to pasted nodes when no cursor position is given.
    pub paste_offset: Position,
    /// Keys handed out to keyboard-category nodes.
    pub keyboard_keys: RangeInclusive<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            history_capacity: DEFAULT_CAPACITY,
            paste_offset: Position::new(50.0, 50.0),
            keyboard_keys: 2..=9,
        }
    }
}

/// Result of a node deletion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    NotFound,
    /// The node is a protected part of its container's structure.
    Protected,
    Removed { nodes: usize, connections: usize },
}

/// A broken structural invariant, reported by [`GraphStore::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("node {node} references missing parent {parent}")]
    MissingParent { node: NodeId, parent: NodeId },

    #[error("node {child} is not listed in the children of its parent {parent}")]
    UnlistedChild { parent: NodeId, child: NodeId },

    #[error("node {parent} lists {child} as a child, but it is missing or parented elsewhere")]
    StrayChild { parent: NodeId, child: NodeId },

    #[error("parent chain of node {node} contains a cycle")]
    ParentCycle { node: NodeId },

    #[error("connection {connection} references missing endpoint {node}:{port}")]
    DanglingEndpoint {
        connection: ConnectionId,
        node: NodeId,
        port: PortId,
    },

    #[error("connection {connection} joins nodes at different levels")]
    CrossLevel { connection: ConnectionId },

    #[error("connection {connection} connects node {node} to itself")]
    SelfLoop { connection: ConnectionId, node: NodeId },

    #[error("node {node} has duplicate port id {port}")]
    DuplicatePort { node: NodeId, port: PortId },

    #[error("audio input {node}:{port} has {count} incoming connections")]
    SharedAudioInput { node: NodeId, port: PortId, count: usize },

    #[error("node {node} has no connections but its universal port {port} is resolved")]
    StaleResolution { node: NodeId, port: PortId },
}

/// The hierarchical patch graph with undo, selection and clipboard.
#[derive(Debug, Clone)]
pub struct GraphStore {
    pub(crate) registry: NodeRegistry,
    pub(crate) config: StoreConfig,
    pub(crate) state: GraphState,
    pub(crate) history: History,
    pub(crate) ids: IdAllocator,
    pub(crate) selected_nodes: IndexSet<NodeId>,
    pub(crate) selected_connections: IndexSet<ConnectionId>,
    pub(crate) clipboard: Option<Clipboard>,
    pub(crate) version: u64,
    pub(crate) flash: Option<NodeId>,
}

impl GraphStore {
    /// An empty store over the builtin registry.
    pub fn new() -> Self {
        Self::with_config(NodeRegistry::builtin(), StoreConfig::default())
    }

    pub fn with_registry(registry: NodeRegistry) -> Self {
        Self::with_config(registry, StoreConfig::default())
    }

    pub fn with_config(registry: NodeRegistry, config: StoreConfig) -> Self {
        GraphStore {
            history: History::new(config.history_capacity),
            registry,
            config,
            state: GraphState::new(),
            ids: IdAllocator::new(),
            selected_nodes: IndexSet::new(),
            selected_connections: IndexSet::new(),
            clipboard: None,
            version: 0,
            flash: None,
        }
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn state(&self) -> &GraphState {
        &self.state
    }

    pub fn nodes(&self) -> &IndexMap<NodeId, GraphNode> {
        &self.state.nodes
    }

    pub fn connections(&self) -> &IndexMap<ConnectionId, Connection> {
        &self.state.connections
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.state.node(id)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.state.connection(id)
    }

    pub fn root_node_ids(&self) -> Vec<NodeId> {
        self.state.root_ids()
    }

    pub fn nodes_at_level(&self, parent: Option<NodeId>) -> Vec<&GraphNode> {
        self.state
            .level(parent)
            .into_iter()
            .filter_map(|id| self.state.node(id))
            .collect()
    }

    /// Connections whose endpoints both sit directly under `parent`.
    pub fn connections_at_level(&self, parent: Option<NodeId>) -> Vec<&Connection> {
        let at_level = |id: NodeId| self.state.node(id).is_some_and(|n| n.parent_id == parent);
        self.state
            .connections
            .values()
            .filter(|c| at_level(c.source_node_id) && at_level(c.target_node_id))
            .collect()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Owned copy of the current nodes and connections.
    pub fn snapshot(&self) -> GraphState {
        self.state.clone()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn selected_node_ids(&self) -> Vec<NodeId> {
        self.selected_nodes.iter().copied().collect()
    }

    pub fn selected_connection_ids(&self) -> Vec<ConnectionId> {
        self.selected_connections.iter().copied().collect()
    }

    pub fn clipboard(&self) -> Option<&Clipboard> {
        self.clipboard.as_ref()
    }

    /// Returns and clears the node whose deletion was last refused.
    pub fn take_flash(&mut self) -> Option<NodeId> {
        self.flash.take()
    }

    // -----------------------------------------------------------------------
    // Node mutations
    // -----------------------------------------------------------------------

    /// Creates a node of `node_type`, materializing its internal template.
    ///
    /// Returns `None` when `parent` does not exist.
    pub fn add_node(
        &mut self,
        node_type: NodeType,
        position: Position,
        parent: Option<NodeId>,
        initial_data: Option<Map<String, Value>>,
    ) -> Option<NodeId> {
        if let Some(parent) = parent {
            if self.state.node(parent).is_none() {
                debug!(%parent, "add_node: parent not found");
                return None;
            }
        }
        let before = self.state.clone();
        match self.instantiate(node_type, position, parent, initial_data, 0) {
            Ok(id) => {
                let mut effects = Effects::new();
                if let Some(parent) = parent {
                    effects.push(Effect::Resync(parent));
                }
                self.commit(before, effects);
                debug!(%id, %node_type, "added node");
                Some(id)
            }
            Err(err) => {
                self.state = before;
                error!(%err, %node_type, "failed to instantiate node");
                None
            }
        }
    }

    fn instantiate(
        &mut self,
        node_type: NodeType,
        position: Position,
        parent: Option<NodeId>,
        initial_data: Option<Map<String, Value>>,
        depth: usize,
    ) -> Result<NodeId, CoreError> {
        if depth > MAX_TEMPLATE_DEPTH {
            return Err(CoreError::TemplateTooDeep {
                node_type,
                limit: MAX_TEMPLATE_DEPTH,
            });
        }
        let definition = self.registry.definition(node_type)?.clone();
        let id = self.ids.next_node();

        let mut data = definition.default_data.clone();
        let explicit_key = initial_data
            .as_ref()
            .is_some_and(|d| d.contains_key("assignedKey"));
        if let Some(initial) = initial_data {
            data.extend(initial);
        }
        self.state.nodes.insert(
            id,
            GraphNode {
                id,
                node_type,
                category: definition.category,
                position,
                data,
                ports: definition.default_ports.clone(),
                parent_id: parent,
                child_ids: Vec::new(),
                special_nodes: Vec::new(),
                internal_viewport: None,
            },
        );
        if let Some(parent) = parent.and_then(|p| self.state.node_mut(p)) {
            parent.child_ids.push(id);
        }
        if definition.category == NodeCategory::Keyboard && !explicit_key {
            self.assign_keyboard_key(id);
        }

        if let Some(template) = &definition.template {
            let mut children = Vec::with_capacity(template.children.len());
            for child in &template.children {
                let child_id = self.instantiate(child.node_type, child.position, Some(id), None, depth + 1)?;
                if child.protected {
                    if let Some(node) = self.state.node_mut(id) {
                        node.special_nodes.push(child_id);
                    }
                }
                children.push(child_id);
            }
            for wire in &template.wires {
                let (Some(from), Some(to)) = (children.get(wire.from), children.get(wire.to)) else {
                    continue;
                };
                let from_port = PortId::from(wire.from_port.as_str());
                let to_port = PortId::from(wire.to_port.as_str());
                let conn_type = self
                    .state
                    .node(*from)
                    .and_then(|n| n.port(&from_port))
                    .and_then(|p| p.effective_type())
                    .unwrap_or(SignalType::Audio);
                self.insert_connection(*from, from_port, *to, to_port, conn_type, false);
            }
            let seed = self.state.node(id).map(|n| n.data.clone()).unwrap_or_default();
            self.propagate(id, &seed);
            sync::resync(&mut self.state, &self.registry, id);
        }
        Ok(id)
    }

    /// Gives a keyboard the lowest free key among same-type siblings,
    /// wrapping to the first key when all are taken.
    fn assign_keyboard_key(&mut self, id: NodeId) {
        let Some(node) = self.state.node(id) else {
            return;
        };
        let taken: Vec<u64> = self
            .state
            .level(node.parent_id)
            .into_iter()
            .filter(|sibling| *sibling != id)
            .filter_map(|sibling| self.state.node(sibling))
            .filter(|sibling| sibling.node_type == node.node_type)
            .filter_map(|sibling| sibling.data.get("assignedKey").and_then(Value::as_u64))
            .collect();
        let keys = self.config.keyboard_keys.clone();
        let first = *keys.start();
        let key = keys.into_iter().find(|k| !taken.contains(k)).unwrap_or(first);
        if let Some(node) = self.state.node_mut(id) {
            node.data.insert("assignedKey".to_string(), Value::from(key));
        }
    }

    /// Copies propagated fields present in `patch` onto every descendant
    /// whose definition receives them.
    fn propagate(&mut self, container: NodeId, patch: &Map<String, Value>) {
        let fields: Vec<(&str, Value)> = PROPAGATED_FIELDS
            .iter()
            .filter_map(|f| patch.get(*f).map(|v| (*f, v.clone())))
            .collect();
        if fields.is_empty() {
            return;
        }
        for id in self.state.closure(container).into_iter().skip(1) {
            let Some(node) = self.state.node_mut(id) else {
                continue;
            };
            if !self.registry.receives_propagation(node.node_type) {
                continue;
            }
            for (field, value) in &fields {
                node.data.insert((*field).to_string(), value.clone());
            }
        }
    }

    /// Deletes `id` with all descendants and every connection touching them.
    pub fn remove_node(&mut self, id: NodeId) -> RemoveOutcome {
        if self.state.node(id).is_none() {
            return RemoveOutcome::NotFound;
        }
        if self.is_protected(id) {
            warn!(%id, "refusing to delete protected node");
            self.flash = Some(id);
            return RemoveOutcome::Protected;
        }
        let before = self.state.clone();
        let mut effects = Effects::new();
        let (nodes, connections) = self.remove_subtree(id, &mut effects);
        self.commit(before, effects);
        debug!(%id, nodes, connections, "removed node");
        RemoveOutcome::Removed { nodes, connections }
    }

    /// Deletes the selected connections and nodes as one undo step.
    pub fn remove_selected(&mut self) -> RemoveOutcome {
        if self.selected_nodes.is_empty() && self.selected_connections.is_empty() {
            return RemoveOutcome::NotFound;
        }
        let before = self.state.clone();
        let mut effects = Effects::new();
        let mut nodes = 0;
        let mut connections = 0;
        let mut refused = false;

        for id in self.selected_connection_ids() {
            if self.detach_connection(id, &mut effects) {
                connections += 1;
            }
        }
        for id in self.selected_node_ids() {
            if self.state.node(id).is_none() {
                continue;
            }
            if self.is_protected(id) {
                self.flash = Some(id);
                refused = true;
                continue;
            }
            let (n, c) = self.remove_subtree(id, &mut effects);
            nodes += n;
            connections += c;
        }

        if nodes == 0 && connections == 0 {
            return if refused {
                RemoveOutcome::Protected
            } else {
                RemoveOutcome::NotFound
            };
        }
        self.selected_nodes.clear();
        self.selected_connections.clear();
        self.commit(before, effects);
        RemoveOutcome::Removed { nodes, connections }
    }

    fn is_protected(&self, id: NodeId) -> bool {
        self.state
            .node(id)
            .and_then(|n| n.parent_id)
            .and_then(|p| self.state.node(p))
            .is_some_and(|p| p.is_protected_child(id))
    }

    /// Removes the closure of `id` and its connections without committing.
    fn remove_subtree(&mut self, id: NodeId, effects: &mut Effects) -> (usize, usize) {
        let closure = self.state.closure(id);
        let parent = self.state.node(id).and_then(|n| n.parent_id);

        let doomed: Vec<ConnectionId> = self
            .state
            .connections
            .values()
            .filter(|c| closure.iter().any(|n| self.state.connection_touches_node(c, *n)))
            .map(|c| c.id)
            .collect();
        let mut connections = 0;
        for cid in doomed {
            if self.detach_connection(cid, effects) {
                connections += 1;
            }
        }

        for node in &closure {
            self.state.nodes.shift_remove(node);
            self.selected_nodes.shift_remove(node);
        }
        if let Some(parent_id) = parent {
            if let Some(parent) = self.state.node_mut(parent_id) {
                parent.child_ids.retain(|c| *c != id);
                parent.special_nodes.retain(|c| *c != id);
            }
            effects.push(Effect::Resync(parent_id));
        }
        (closure.len(), connections)
    }

    pub fn update_node_position(&mut self, id: NodeId, position: Position) -> bool {
        if self.state.node(id).is_none() {
            return false;
        }
        let before = self.state.clone();
        if let Some(node) = self.state.node_mut(id) {
            node.position = position;
        }
        self.commit(before, Effects::new());
        true
    }

    /// Shallow-merges `patch` into the node's data.
    pub fn update_node_data(&mut self, id: NodeId, patch: Map<String, Value>) -> bool {
        if patch.is_empty() {
            return false;
        }
        let Some(node) = self.state.node(id) else {
            return false;
        };
        let resync_parent = match node.parent_id {
            Some(parent) if self.registry.boundary_role(node.node_type).is_some() => Some(parent),
            _ => None,
        };
        let before = self.state.clone();
        if let Some(node) = self.state.node_mut(id) {
            node.data.extend(patch.clone());
        }
        self.propagate(id, &patch);

        let mut effects = Effects::new();
        if let Some(parent) = resync_parent {
            effects.push(Effect::Resync(parent));
        }
        self.commit(before, effects);
        true
    }

    /// Replaces the node's ports, dropping connections to ports that
    /// vanished.
    pub fn update_node_ports(&mut self, id: NodeId, ports: Vec<PortDefinition>) -> bool {
        let Some(node) = self.state.node(id) else {
            return false;
        };
        let parent = node.parent_id;
        let is_boundary = self.registry.boundary_role(node.node_type).is_some();
        let before = self.state.clone();

        let kept = |port: &PortId| ports.iter().any(|p| &p.id == port);
        let doomed: Vec<ConnectionId> = self
            .state
            .connections
            .values()
            .filter(|c| {
                c.endpoints().iter().any(|(node, port)| {
                    if *node == id {
                        return !kept(*port);
                    }
                    Some(*node) == parent
                        && port
                            .split_composite()
                            .is_some_and(|(child, inner)| child == id && !kept(&inner))
                })
            })
            .map(|c| c.id)
            .collect();

        let mut effects = Effects::new();
        if let Some(node) = self.state.node_mut(id) {
            node.ports = ports;
        }
        for cid in doomed {
            self.detach_connection(cid, &mut effects);
        }
        effects.push(Effect::ResetUniversal(id));
        if let (true, Some(parent)) = (is_boundary, parent) {
            effects.push(Effect::Resync(parent));
        }
        self.commit(before, effects);
        true
    }

    /// Stores the node's internal canvas view. Not an undoable edit.
    pub fn set_internal_viewport(&mut self, id: NodeId, viewport: Viewport) -> bool {
        match self.state.node_mut(id) {
            Some(node) => {
                node.internal_viewport = Some(viewport);
                true
            }
            None => false,
        }
    }

    /// Moves `id` under `new_parent` (`None` = root level).
    ///
    /// The node's connections to its former siblings are dropped. Returns
    /// `Ok(false)` when nothing moved.
    pub fn reparent_node(&mut self, id: NodeId, new_parent: Option<NodeId>) -> Result<bool, CoreError> {
        let node = self.state.node(id).ok_or(CoreError::NodeNotFound { id })?;
        let old_parent = node.parent_id;
        if let Some(parent) = new_parent {
            if self.state.node(parent).is_none() {
                return Err(CoreError::NodeNotFound { id: parent });
            }
            if parent == id || self.state.ancestors(parent).contains(&id) {
                return Err(CoreError::CycleDetected { node: id, parent });
            }
        }
        if old_parent == new_parent {
            return Ok(false);
        }
        if self.is_protected(id) {
            self.flash = Some(id);
            return Ok(false);
        }

        let before = self.state.clone();
        let mut effects = Effects::new();
        for cid in self.state.connections_touching(id) {
            self.detach_connection(cid, &mut effects);
        }
        if let Some(old) = old_parent {
            if let Some(parent) = self.state.node_mut(old) {
                parent.child_ids.retain(|c| *c != id);
            }
            effects.push(Effect::Resync(old));
        }
        if let Some(new) = new_parent {
            if let Some(parent) = self.state.node_mut(new) {
                parent.child_ids.push(id);
            }
            effects.push(Effect::Resync(new));
        }
        if let Some(node) = self.state.node_mut(id) {
            node.parent_id = new_parent;
        }
        self.commit(before, effects);
        debug!(%id, ?old_parent, ?new_parent, "reparented node");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Connection mutations
    // -----------------------------------------------------------------------

    /// Connects an output port to an input port on a sibling node.
    ///
    /// Returns `None` without touching anything when an endpoint is missing,
    /// the nodes are not siblings, or the port types are incompatible. An
    /// identical existing connection is returned as is.
    pub fn add_connection(
        &mut self,
        source: NodeId,
        source_port: &PortId,
        target: NodeId,
        target_port: &PortId,
    ) -> Option<ConnectionId> {
        let src_node = self.state.node(source)?;
        let tgt_node = self.state.node(target)?;
        if source == target || src_node.parent_id != tgt_node.parent_id {
            debug!(%source, %target, "add_connection: endpoints are not siblings");
            return None;
        }
        let src_port = src_node.port(source_port)?;
        let tgt_port = tgt_node.port(target_port)?;
        if !self.registry.can_connect(src_port, tgt_port) {
            debug!(%source, %source_port, %target, %target_port, "add_connection: incompatible ports");
            return None;
        }
        if let Some(existing) = self.state.find_identical(source, source_port, target, target_port) {
            return Some(existing);
        }

        let conn_type = src_port
            .effective_type()
            .or(tgt_port.effective_type())
            .unwrap_or(SignalType::Audio);
        let is_bundled = src_port.is_bundled;
        let single_input = tgt_port.effective_type() == Some(SignalType::Audio) && !tgt_port.is_bundled;

        let plan = if is_bundled {
            bundle::plan(&self.state, &self.registry, source, source_port, target, target_port)
        } else {
            None
        };
        if let Some(plan) = &plan {
            if let Some(existing) = self.state.find_identical(source, source_port, target, &plan.target_port) {
                return Some(existing);
            }
        }

        let before = self.state.clone();
        let mut effects = Effects::new();
        if single_input {
            for evicted in self.state.incoming(target, target_port) {
                debug!(%evicted, %target, %target_port, "replacing audio input");
                self.detach_connection(evicted, &mut effects);
            }
        }

        let landing = plan
            .as_ref()
            .map(|p| p.target_port.clone())
            .unwrap_or_else(|| target_port.clone());
        let id = self.insert_connection(source, source_port.clone(), target, landing.clone(), conn_type, is_bundled);

        for (node, port) in [(source, source_port), (target, &landing)] {
            let (addressed, _) = self.state.resolve_endpoint(node, port);
            effects::set_universal(&mut self.state, addressed, Resolution::Resolved(conn_type));
        }

        match &plan {
            Some(plan) => {
                let outcome = bundle::apply(&mut self.state, &mut self.ids, plan, source, source_port, target);
                debug!(
                    %id,
                    channels = plan.channels,
                    ports = outcome.ports_added,
                    row = outcome.row_created,
                    wires = outcome.wires_added,
                    "expanded bundle"
                );
            }
            None => {
                for (node, port) in [(source, source_port), (target, &landing)] {
                    let (addressed, _) = self.state.resolve_endpoint(node, port);
                    let is_panel = self.state.node(addressed).is_some_and(|n| {
                        self.registry.boundary_role(n.node_type) == Some(BoundaryRole::Panel)
                    });
                    if is_panel {
                        panel::promote_placeholder(&mut self.state, addressed);
                    }
                }
            }
        }

        effects.push(Effect::Resync(source));
        effects.push(Effect::Resync(target));
        self.commit(before, effects);
        debug!(%id, %source, %target, "added connection");
        Some(id)
    }

    fn insert_connection(
        &mut self,
        source: NodeId,
        source_port: PortId,
        target: NodeId,
        target_port: PortId,
        conn_type: SignalType,
        is_bundled: bool,
    ) -> ConnectionId {
        let id = self.ids.next_connection();
        self.state.connections.insert(
            id,
            Connection {
                id,
                source_node_id: source,
                source_port_id: source_port,
                target_node_id: target,
                target_port_id: target_port,
                conn_type,
                is_bundled,
            },
        );
        id
    }

    pub fn remove_connection(&mut self, id: ConnectionId) -> bool {
        if self.state.connection(id).is_none() {
            return false;
        }
        let before = self.state.clone();
        let mut effects = Effects::new();
        self.detach_connection(id, &mut effects);
        self.commit(before, effects);
        debug!(%id, "removed connection");
        true
    }

    /// Removes one connection and queues its follow-up effects.
    fn detach_connection(&mut self, id: ConnectionId, effects: &mut Effects) -> bool {
        match self.state.connections.shift_remove(&id) {
            Some(removed) => {
                effects.connection_removed(&self.state, &self.registry, &removed);
                self.selected_connections.shift_remove(&id);
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Instrument rows
    // -----------------------------------------------------------------------

    pub fn update_instrument_row(&mut self, node: NodeId, row_id: &str, patch: &RowPatch) -> bool {
        let Some(container) = self.state.node(node) else {
            return false;
        };
        let mut rows = instrument::rows(container);
        let Some(row) = rows.iter_mut().find(|r| r.row_id == row_id) else {
            return false;
        };
        row.apply(patch);
        let before = self.state.clone();
        if let Some(container) = self.state.node_mut(node) {
            instrument::write_rows(container, &rows);
        }
        self.commit(before, Effects::new());
        true
    }

    /// Removes a row together with its key ports, internal wires, panel
    /// channel ports and the bundled wire feeding them.
    pub fn remove_instrument_row(&mut self, node: NodeId, row_id: &str) -> bool {
        let Some(container) = self.state.node(node) else {
            return false;
        };
        let mut rows = instrument::rows(container);
        let Some(index) = rows.iter().position(|r| r.row_id == row_id) else {
            return false;
        };
        let row = rows.remove(index);
        let voice = container
            .child_ids
            .iter()
            .copied()
            .find(|id| self.state.node(*id).is_some_and(|n| n.node_type == NodeType::InstrumentVoice));
        let channels = row
            .target_port_id
            .split_composite()
            .and_then(|(panel, first)| panel::bundle_group(&first).map(|g| (panel, g.to_string())));

        let before = self.state.clone();
        let mut effects = Effects::new();
        if let Some(container) = self.state.node_mut(node) {
            instrument::write_rows(container, &rows);
        }

        if let Some((panel_id, group)) = channels {
            let keys = bundle::key_group(&group);
            let doomed: Vec<ConnectionId> = self
                .state
                .connections
                .values()
                .filter(|c| {
                    c.endpoints().iter().any(|(n, p)| {
                        let (addressed, port) = self.state.resolve_endpoint(*n, p);
                        let in_group = |g: &str| panel::bundle_group(&port) == Some(g);
                        (addressed == panel_id && in_group(group.as_str()))
                            || (Some(addressed) == voice && in_group(keys.as_str()))
                    })
                })
                .map(|c| c.id)
                .collect();
            for cid in doomed {
                self.detach_connection(cid, &mut effects);
            }
            if let Some(voice_node) = voice.and_then(|v| self.state.node_mut(v)) {
                voice_node
                    .ports
                    .retain(|p| panel::bundle_group(&p.id) != Some(keys.as_str()));
                voice_node.ports = layout_anchors(std::mem::take(&mut voice_node.ports));
            }
            effects.push(Effect::PrunePanel(panel_id));
        }
        effects.push(Effect::Resync(node));
        self.commit(before, effects);
        debug!(%node, row_id, "removed instrument row");
        true
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Selects a node. Without `additive` the previous selection is
    /// replaced.
    pub fn select_node(&mut self, id: NodeId, additive: bool) -> bool {
        if self.state.node(id).is_none() {
            return false;
        }
        if !additive {
            self.clear_selection();
        }
        self.selected_nodes.insert(id);
        true
    }

    pub fn select_connection(&mut self, id: ConnectionId, additive: bool) -> bool {
        if self.state.connection(id).is_none() {
            return false;
        }
        if !additive {
            self.clear_selection();
        }
        self.selected_connections.insert(id);
        true
    }

    pub fn clear_selection(&mut self) {
        self.selected_nodes.clear();
        self.selected_connections.clear();
    }

    /// Replaces the selection with every node directly under `parent`.
    pub fn select_all_at_level(&mut self, parent: Option<NodeId>) -> usize {
        self.clear_selection();
        self.selected_nodes.extend(self.state.level(parent));
        self.selected_nodes.len()
    }

    // -----------------------------------------------------------------------
    // Clipboard
    // -----------------------------------------------------------------------

    /// Copies the selected nodes (with descendants). Returns how many nodes
    /// were captured; the clipboard is left alone when that is zero.
    pub fn copy_selected(&mut self) -> usize {
        let selected = self.selected_node_ids();
        match Clipboard::capture(&self.state, &selected) {
            Some(clip) => {
                let count = clip.len();
                self.clipboard = Some(clip);
                count
            }
            None => 0,
        }
    }

    /// Pastes into the level the clipboard was copied from, or the root
    /// level if that parent is gone. Returns the pasted top-level ids.
    pub fn paste_clipboard(&mut self, position: Option<Position>) -> Vec<NodeId> {
        let parent = self
            .clipboard
            .as_ref()
            .and_then(|c| c.parent)
            .filter(|p| self.state.node(*p).is_some());
        self.paste(parent, position)
    }

    /// Pastes under `parent` (`None` = root level).
    pub fn paste_clipboard_into(&mut self, parent: Option<NodeId>, position: Option<Position>) -> Vec<NodeId> {
        if let Some(p) = parent {
            if self.state.node(p).is_none() {
                return Vec::new();
            }
        }
        self.paste(parent, position)
    }

    fn paste(&mut self, parent: Option<NodeId>, position: Option<Position>) -> Vec<NodeId> {
        let Some(clip) = self.clipboard.clone().filter(|c| !c.is_empty()) else {
            return Vec::new();
        };
        let delta = match position {
            Some(p) => (p.x - clip.origin.x, p.y - clip.origin.y),
            None => (self.config.paste_offset.x, self.config.paste_offset.y),
        };

        let before = self.state.clone();
        let pasted = clip.instantiate(&mut self.ids, parent, delta);
        let mut effects = Effects::new();
        // Copies only keep the wires running between them; whatever the
        // originals were connected to outside the selection is gone.
        for node in &pasted.nodes {
            if self.registry.boundary_role(node.node_type) == Some(BoundaryRole::Panel) {
                effects.push(Effect::PrunePanel(node.id));
            }
            effects.push(Effect::ResetUniversal(node.id));
            effects.push(Effect::Resync(node.id));
        }
        for node in pasted.nodes {
            self.state.nodes.insert(node.id, node);
        }
        for conn in pasted.connections {
            self.state.connections.insert(conn.id, conn);
        }
        if let Some(parent) = parent.and_then(|p| self.state.node_mut(p)) {
            parent.child_ids.extend(pasted.roots.iter().copied());
        }

        let keyboards: Vec<NodeId> = pasted
            .roots
            .iter()
            .copied()
            .filter(|id| {
                self.state
                    .node(*id)
                    .is_some_and(|n| n.category == NodeCategory::Keyboard)
            })
            .collect();
        for id in &keyboards {
            if let Some(node) = self.state.node_mut(*id) {
                node.data.remove("assignedKey");
            }
        }
        for id in keyboards {
            self.assign_keyboard_key(id);
        }

        self.clear_selection();
        self.selected_nodes.extend(pasted.roots.iter().copied());

        if let Some(parent) = parent {
            effects.push(Effect::Resync(parent));
        }
        self.commit(before, effects);
        debug!(count = pasted.roots.len(), ?parent, "pasted clipboard");
        pasted.roots
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    pub fn undo(&mut self) -> bool {
        match self.history.undo(&self.state) {
            Some(state) => {
                self.restore(state);
                true
            }
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        match self.history.redo() {
            Some(state) => {
                self.restore(state);
                true
            }
            None => false,
        }
    }

    fn restore(&mut self, state: GraphState) {
        self.state = state;
        self.clear_selection();
        self.version += 1;
    }

    /// Removes everything, as one undoable step.
    pub fn clear(&mut self) -> bool {
        if self.state.nodes.is_empty() && self.state.connections.is_empty() {
            return false;
        }
        let before = std::mem::take(&mut self.state);
        self.clear_selection();
        self.commit(before, Effects::new());
        true
    }

    /// Ends a mutation: drains effects, records `before`, bumps the version.
    fn commit(&mut self, before: GraphState, effects: Effects) {
        effects.drain(&mut self.state, &self.registry);
        self.history.push(before);
        self.version += 1;

        #[cfg(debug_assertions)]
        self.assert_consistency();
    }

    // -----------------------------------------------------------------------
    // Invariant checking
    // -----------------------------------------------------------------------

    /// Checks the structural invariants. An empty list means consistent.
    pub fn validate(&self) -> Vec<Violation> {
        let state = &self.state;
        let mut violations = Vec::new();

        for node in state.nodes.values() {
            if let Some(parent) = node.parent_id {
                match state.node(parent) {
                    None => violations.push(Violation::MissingParent {
                        node: node.id,
                        parent,
                    }),
                    Some(p) if !p.child_ids.contains(&node.id) => violations.push(Violation::UnlistedChild {
                        parent,
                        child: node.id,
                    }),
                    Some(_) => {}
                }
                if state.ancestors(node.id).contains(&node.id) {
                    violations.push(Violation::ParentCycle { node: node.id });
                }
            }
            for child in &node.child_ids {
                if state.node(*child).and_then(|c| c.parent_id) != Some(node.id) {
                    violations.push(Violation::StrayChild {
                        parent: node.id,
                        child: *child,
                    });
                }
            }
            let mut seen = IndexSet::new();
            for port in &node.ports {
                if !seen.insert(&port.id) {
                    violations.push(Violation::DuplicatePort {
                        node: node.id,
                        port: port.id.clone(),
                    });
                }
            }
            // Reflected composite ports mirror a child and are checked there.
            let stale = node.ports.iter().find(|p| {
                p.id.split_composite().is_none()
                    && p.port_type.is_universal()
                    && p.effective_type().is_some()
            });
            if let Some(port) = stale {
                if !state.has_connections(node.id) {
                    violations.push(Violation::StaleResolution {
                        node: node.id,
                        port: port.id.clone(),
                    });
                }
            }
        }

        let mut audio_inputs: IndexMap<(NodeId, &PortId), usize> = IndexMap::new();
        for conn in state.connections.values() {
            for (node, port) in conn.endpoints() {
                if !state.endpoint_exists(node, port) {
                    violations.push(Violation::DanglingEndpoint {
                        connection: conn.id,
                        node,
                        port: port.clone(),
                    });
                }
            }
            if conn.source_node_id == conn.target_node_id {
                violations.push(Violation::SelfLoop {
                    connection: conn.id,
                    node: conn.source_node_id,
                });
            }
            let parent_of = |id: NodeId| state.node(id).map(|n| n.parent_id);
            if parent_of(conn.source_node_id) != parent_of(conn.target_node_id) {
                violations.push(Violation::CrossLevel { connection: conn.id });
            }
            let is_audio_input = state
                .node(conn.target_node_id)
                .and_then(|n| n.port(&conn.target_port_id))
                .is_some_and(|p| {
                    p.direction == Direction::Input
                        && !p.is_bundled
                        && p.effective_type() == Some(SignalType::Audio)
                });
            if is_audio_input {
                *audio_inputs
                    .entry((conn.target_node_id, &conn.target_port_id))
                    .or_default() += 1;
            }
        }
        for ((node, port), count) in audio_inputs {
            if count > 1 {
                violations.push(Violation::SharedAudioInput {
                    node,
                    port: port.clone(),
                    count,
                });
            }
        }
        violations
    }

    /// Panics if any invariant is broken.
    ///
    /// Only called in debug builds (via `cfg(debug_assertions)`).
    #[cfg(debug_assertions)]
    fn assert_consistency(&self) {
        let violations = self.validate();
        assert!(
            violations.is_empty(),
            "graph invariants violated: {:?}",
            violations
        );
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::port::PortType;

    fn store_with(types: &[NodeType]) -> (GraphStore, Vec<NodeId>) {
        let mut store = GraphStore::new();
        let ids = types
            .iter()
            .enumerate()
            .map(|(i, t)| {
                store
                    .add_node(*t, Position::new(i as f64 * 100.0, 0.0), None, None)
                    .unwrap()
            })
            .collect();
        (store, ids)
    }

    fn port(id: &str) -> PortId {
        PortId::from(id)
    }

    #[test]
    fn add_node_materializes_template() {
        let (store, ids) = store_with(&[NodeType::Piano]);
        let piano = store.node(ids[0]).unwrap();
        assert_eq!(piano.child_ids.len(), 3);
        assert_eq!(piano.special_nodes, piano.child_ids);
        assert_eq!(store.connections().len(), 1);
        assert_eq!(store.root_node_ids(), vec![ids[0]]);
        assert_eq!(store.version(), 1);

        let voice = store.node(piano.child_ids[1]).unwrap();
        assert_eq!(voice.data["presetId"], json!("grand"));
    }

    #[test]
    fn add_node_under_missing_parent_is_rejected() {
        let mut store = GraphStore::new();
        assert!(store
            .add_node(NodeType::Oscillator, Position::default(), Some(NodeId(42)), None)
            .is_none());
        assert_eq!(store.version(), 0);
        assert!(!store.can_undo());
    }

    #[test]
    fn keyboards_get_lowest_free_key_and_wrap() {
        let mut store = GraphStore::new();
        let keys: Vec<u64> = (0..9)
            .map(|_| {
                let id = store
                    .add_node(NodeType::Keyboard, Position::default(), None, None)
                    .unwrap();
                store.node(id).unwrap().data["assignedKey"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(keys, vec![2, 3, 4, 5, 6, 7, 8, 9, 2]);
    }

    #[test]
    fn protected_children_cannot_be_deleted() {
        let (mut store, ids) = store_with(&[NodeType::Piano]);
        let panel = store.node(ids[0]).unwrap().child_ids[0];
        let version = store.version();

        assert_eq!(store.remove_node(panel), RemoveOutcome::Protected);
        assert_eq!(store.take_flash(), Some(panel));
        assert_eq!(store.take_flash(), None);
        assert_eq!(store.version(), version);
        assert!(store.node(panel).is_some());
    }

    #[test]
    fn remove_missing_node_is_noop() {
        let mut store = GraphStore::new();
        assert_eq!(store.remove_node(NodeId(7)), RemoveOutcome::NotFound);
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn incompatible_ports_are_rejected_without_history() {
        let (mut store, ids) = store_with(&[NodeType::Lfo, NodeType::Speaker]);
        let version = store.version();
        let history = store.history().len();
        assert!(store
            .add_connection(ids[0], &port("control"), ids[1], &port("audio"))
            .is_none());
        assert_eq!(store.version(), version);
        assert_eq!(store.history().len(), history);
    }

    #[test]
    fn identical_connection_is_idempotent() {
        let (mut store, ids) = store_with(&[NodeType::Oscillator, NodeType::Speaker]);
        let first = store
            .add_connection(ids[0], &port("audio"), ids[1], &port("audio"))
            .unwrap();
        let version = store.version();
        let again = store
            .add_connection(ids[0], &port("audio"), ids[1], &port("audio"))
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(store.version(), version);
    }

    #[test]
    fn self_and_cross_level_connections_are_rejected() {
        let (mut store, ids) = store_with(&[NodeType::Relay, NodeType::Group]);
        assert!(store.add_connection(ids[0], &port("out"), ids[0], &port("in")).is_none());

        let inner = store
            .add_node(NodeType::Speaker, Position::default(), Some(ids[1]), None)
            .unwrap();
        assert!(store.add_connection(ids[0], &port("out"), inner, &port("audio")).is_none());
    }

    #[test]
    fn universal_ports_resolve_and_reset() {
        let (mut store, ids) = store_with(&[NodeType::Oscillator, NodeType::Relay]);
        let conn = store
            .add_connection(ids[0], &port("audio"), ids[1], &port("in"))
            .unwrap();
        let relay = store.node(ids[1]).unwrap();
        assert!(relay
            .ports
            .iter()
            .all(|p| p.port_type == PortType::Universal(Resolution::Resolved(SignalType::Audio))));
        assert_eq!(store.connection(conn).unwrap().conn_type, SignalType::Audio);

        assert!(store.remove_connection(conn));
        let relay = store.node(ids[1]).unwrap();
        assert!(relay.ports.iter().all(|p| p.port_type == PortType::UNIVERSAL));
    }

    #[test]
    fn resolved_port_without_connections_is_a_violation() {
        let (mut store, ids) = store_with(&[NodeType::Relay]);
        assert!(store.validate().is_empty());
        effects::set_universal(&mut store.state, ids[0], Resolution::Resolved(SignalType::Audio));
        assert_eq!(
            store.validate(),
            vec![Violation::StaleResolution {
                node: ids[0],
                port: port("in"),
            }]
        );
    }

    #[test]
    fn shrinking_ports_forgets_resolution_with_the_last_wire() {
        let (mut store, ids) = store_with(&[NodeType::Oscillator, NodeType::Relay]);
        store.add_connection(ids[0], &port("audio"), ids[1], &port("in")).unwrap();
        let ports: Vec<_> = store
            .node(ids[1])
            .unwrap()
            .ports
            .iter()
            .filter(|p| p.id.as_str() != "in")
            .cloned()
            .collect();
        assert!(store.update_node_ports(ids[1], ports));
        assert!(store.connections().is_empty());
        assert!(store.node(ids[1]).unwrap().ports.iter().all(|p| p.port_type == PortType::UNIVERSAL));
        assert!(store.validate().is_empty());
    }

    #[test]
    fn connecting_to_placeholder_grows_panel() {
        let (mut store, ids) = store_with(&[NodeType::Lfo, NodeType::Synth]);
        let synth = ids[1];
        let panel = store.node(synth).unwrap().child_ids[0];
        let placeholder = store.node(synth).unwrap().ports[0].id.clone();

        let conn = store
            .add_connection(ids[0], &port("control"), synth, &placeholder)
            .unwrap();
        let panel_ports: Vec<&str> = store
            .node(panel)
            .unwrap()
            .ports
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(panel_ports, vec!["in-0", "in-1"]);
        assert_eq!(
            store.node(panel).unwrap().ports[1].port_type,
            PortType::Universal(Resolution::Resolved(SignalType::Control))
        );
        assert_eq!(store.node(synth).unwrap().ports.len(), 3);

        assert!(store.remove_connection(conn));
        let panel_node = store.node(panel).unwrap();
        assert_eq!(panel_node.ports.len(), 1);
        assert_eq!(panel_node.ports[0].id.as_str(), "in-1");
        assert_eq!(panel_node.ports[0].port_type, PortType::UNIVERSAL);
        assert_eq!(store.node(synth).unwrap().ports.len(), 2);
    }

    #[test]
    fn update_node_ports_drops_vanished_connections() {
        let (mut store, ids) = store_with(&[NodeType::Oscillator, NodeType::Filter]);
        store
            .add_connection(ids[0], &port("audio"), ids[1], &port("audio"))
            .unwrap();
        let ports: Vec<_> = store
            .node(ids[1])
            .unwrap()
            .ports
            .iter()
            .filter(|p| p.id.as_str() != "audio")
            .cloned()
            .collect();
        assert!(store.update_node_ports(ids[1], ports));
        assert!(store.connections().is_empty());
        assert!(!store.update_node_ports(NodeId(99), Vec::new()));
    }

    #[test]
    fn preset_changes_propagate_to_voice() {
        let (mut store, ids) = store_with(&[NodeType::Piano]);
        let voice = store.node(ids[0]).unwrap().child_ids[1];
        let mut patch = Map::new();
        patch.insert("presetId".into(), json!("rhodes"));
        assert!(store.update_node_data(ids[0], patch));
        assert_eq!(store.node(voice).unwrap().data["presetId"], json!("rhodes"));
        assert_eq!(store.node(ids[0]).unwrap().data["presetId"], json!("rhodes"));
    }

    #[test]
    fn empty_data_patch_is_not_an_edit() {
        let (mut store, ids) = store_with(&[NodeType::Oscillator]);
        let version = store.version();
        let history = store.history().len();
        assert!(!store.update_node_data(ids[0], Map::new()));
        assert_eq!(store.version(), version);
        assert_eq!(store.history().len(), history);
    }

    #[test]
    fn selection_does_not_bump_version() {
        let (mut store, ids) = store_with(&[NodeType::Oscillator, NodeType::Lfo]);
        let version = store.version();
        assert!(store.select_node(ids[0], false));
        assert!(store.select_node(ids[1], true));
        assert_eq!(store.selected_node_ids(), ids);
        assert!(!store.select_node(NodeId(50), false));
        store.clear_selection();
        assert_eq!(store.select_all_at_level(None), 2);
        assert_eq!(store.version(), version);
    }

    #[test]
    fn viewport_saves_are_not_history() {
        let (mut store, ids) = store_with(&[NodeType::Group]);
        let version = store.version();
        let history = store.history().len();
        assert!(store.set_internal_viewport(ids[0], Viewport { x: 1.0, y: 2.0, zoom: 0.5 }));
        assert_eq!(store.version(), version);
        assert_eq!(store.history().len(), history);
    }

    #[test]
    fn reparent_rejects_cycles() {
        let (mut store, ids) = store_with(&[NodeType::Group, NodeType::Group]);
        assert!(store.reparent_node(ids[1], Some(ids[0])).unwrap());
        let err = store.reparent_node(ids[0], Some(ids[1])).unwrap_err();
        assert!(matches!(err, CoreError::CycleDetected { .. }));
        let err = store.reparent_node(ids[0], Some(ids[0])).unwrap_err();
        assert!(matches!(err, CoreError::CycleDetected { .. }));
        assert!(!store.reparent_node(ids[1], Some(ids[0])).unwrap());
        assert!(store.validate().is_empty());
    }

    #[test]
    fn reparent_drops_sibling_connections() {
        let (mut store, ids) = store_with(&[NodeType::Oscillator, NodeType::Speaker, NodeType::Group]);
        store
            .add_connection(ids[0], &port("audio"), ids[1], &port("audio"))
            .unwrap();
        assert!(store.reparent_node(ids[1], Some(ids[2])).unwrap());
        assert!(store.connections_at_level(None).is_empty());
        assert_eq!(store.node(ids[1]).unwrap().parent_id, Some(ids[2]));
        assert_eq!(store.nodes_at_level(Some(ids[2])).len(), 3);
    }

    #[test]
    fn clear_is_undoable() {
        let (mut store, _) = store_with(&[NodeType::Oscillator, NodeType::Piano]);
        let snapshot = store.snapshot();
        assert!(store.clear());
        assert!(store.nodes().is_empty());
        assert!(store.undo());
        assert_eq!(store.snapshot(), snapshot);
    }

    #[test]
    fn remove_selected_skips_protected_children() {
        let (mut store, ids) = store_with(&[NodeType::Oscillator, NodeType::Piano]);
        let panel = store.node(ids[1]).unwrap().child_ids[0];
        store.select_node(ids[0], false);
        store.select_node(panel, true);
        assert_eq!(
            store.remove_selected(),
            RemoveOutcome::Removed {
                nodes: 1,
                connections: 0
            }
        );
        assert_eq!(store.take_flash(), Some(panel));
        assert!(store.selected_node_ids().is_empty());
    }

    #[test]
    fn violations_describe_themselves() {
        let v = Violation::SharedAudioInput {
            node: NodeId(3),
            port: PortId::from("audio"),
            count: 2,
        };
        assert_eq!(v.to_string(), "audio input 3:audio has 2 incoming connections");
    }
}
