//! Derived work queued by a mutation and drained once at its end.
//!
//! Mutations never call back into the public API to keep ports in sync.
//! They enqueue [`Effect`]s instead, and the store drains the queue exactly
//! once per top-level call: panel pruning first, then universal resets, then
//! ancestor re-syncs. Duplicates collapse.

use indexmap::IndexSet;

use crate::connection::Connection;
use crate::id::NodeId;
use crate::port::{PortType, Resolution};
use crate::registry::{BoundaryRole, NodeRegistry};
use crate::state::GraphState;
use crate::{panel, sync};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Effect {
    /// Drop untouched non-placeholder ports from a panel.
    PrunePanel(NodeId),
    /// Revert universal ports to unresolved if the node lost its last
    /// connection.
    ResetUniversal(NodeId),
    /// Re-sync the node (if a container) and every container above it.
    Resync(NodeId),
}

impl Effect {
    fn stage(&self) -> u8 {
        match self {
            Effect::PrunePanel(_) => 0,
            Effect::ResetUniversal(_) => 1,
            Effect::Resync(_) => 2,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Effects {
    queue: IndexSet<Effect>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, effect: Effect) {
        self.queue.insert(effect);
    }

    /// Queues the follow-up work for a connection that was just removed.
    pub fn connection_removed(&mut self, state: &GraphState, registry: &NodeRegistry, removed: &Connection) {
        for (node, port) in removed.endpoints() {
            let (addressed, _) = state.resolve_endpoint(node, port);
            if let Some(n) = state.node(addressed) {
                if registry.boundary_role(n.node_type) == Some(BoundaryRole::Panel) {
                    self.push(Effect::PrunePanel(addressed));
                }
            }
            self.push(Effect::ResetUniversal(addressed));
            self.push(Effect::Resync(node));
        }
    }

    /// Applies every queued effect. Effects on nodes that no longer exist are
    /// skipped.
    pub fn drain(self, state: &mut GraphState, registry: &NodeRegistry) {
        let mut effects: Vec<Effect> = self.queue.into_iter().collect();
        effects.sort_by_key(Effect::stage);
        for effect in effects {
            match effect {
                Effect::PrunePanel(panel) => {
                    panel::prune(state, panel);
                }
                Effect::ResetUniversal(node) => reset_universal(state, node),
                Effect::Resync(node) => sync::resync_chain(state, registry, node),
            }
        }
    }
}

/// Sets every universal port of `node` to `resolution`.
pub(crate) fn set_universal(state: &mut GraphState, node: NodeId, resolution: Resolution) {
    if let Some(n) = state.node_mut(node) {
        for port in n.ports.iter_mut().filter(|p| p.port_type.is_universal()) {
            port.port_type = PortType::Universal(resolution);
        }
    }
}

fn reset_universal(state: &mut GraphState, node: NodeId) {
    if state.node(node).is_none() || state.has_connections(node) {
        return;
    }
    set_universal(state, node, Resolution::Unresolved);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_collapse() {
        let mut effects = Effects::new();
        effects.push(Effect::Resync(NodeId(1)));
        effects.push(Effect::Resync(NodeId(1)));
        effects.push(Effect::PrunePanel(NodeId(1)));
        assert_eq!(effects.queue.len(), 2);
    }

    #[test]
    fn stages_run_prune_first() {
        let mut stages: Vec<u8> = [
            Effect::Resync(NodeId(0)),
            Effect::ResetUniversal(NodeId(0)),
            Effect::PrunePanel(NodeId(0)),
        ]
        .iter()
        .map(Effect::stage)
        .collect();
        stages.sort();
        assert_eq!(stages, vec![0, 1, 2]);
        assert_eq!(Effect::PrunePanel(NodeId(9)).stage(), 0);
    }
}
