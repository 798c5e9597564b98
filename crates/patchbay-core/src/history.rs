//! Linear snapshot history.
//!
//! `entries[..index]` are states behind the live one, `entries[index..]` are
//! states undo stepped back from. When `index == entries.len()` the live
//! state is the tip and is not stored; undo captures it first so redo can
//! return to it.

use crate::state::GraphState;

pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct History {
    entries: Vec<GraphState>,
    index: usize,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        History {
            entries: Vec::new(),
            index: 0,
            capacity: capacity.max(1),
        }
    }

    /// Rebuilds a history from persisted parts, clamping `index`.
    pub fn from_parts(entries: Vec<GraphState>, index: usize, capacity: usize) -> Self {
        let index = index.min(entries.len());
        History {
            entries,
            index,
            capacity: capacity.max(1),
        }
    }

    pub fn entries(&self) -> &[GraphState] {
        &self.entries
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn can_undo(&self) -> bool {
        self.index > 0
    }

    pub fn can_redo(&self) -> bool {
        self.index + 1 < self.entries.len()
    }

    /// Records the state before a mutation, discarding any redo states.
    pub fn push(&mut self, before: GraphState) {
        self.entries.truncate(self.index);
        self.entries.push(before);
        if self.entries.len() > self.capacity {
            self.entries.remove(0);
        }
        self.index = self.entries.len();
    }

    /// Steps back one state. `None` below the oldest entry.
    pub fn undo(&mut self, live: &GraphState) -> Option<GraphState> {
        if self.index == 0 {
            return None;
        }
        if self.index == self.entries.len() {
            self.entries.push(live.clone());
        }
        self.index -= 1;
        self.entries.get(self.index).cloned()
    }

    /// Steps forward one state. `None` at the tip.
    pub fn redo(&mut self) -> Option<GraphState> {
        if !self.can_redo() {
            return None;
        }
        self.index += 1;
        self.entries.get(self.index).cloned()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index = 0;
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use crate::node::{GraphNode, NodeCategory, NodeType, Position};

    fn state(ids: &[u32]) -> GraphState {
        let mut s = GraphState::new();
        for id in ids {
            s.nodes.insert(
                NodeId(*id),
                GraphNode {
                    id: NodeId(*id),
                    node_type: NodeType::Oscillator,
                    category: NodeCategory::Source,
                    position: Position::default(),
                    data: Default::default(),
                    ports: Vec::new(),
                    parent_id: None,
                    child_ids: Vec::new(),
                    special_nodes: Vec::new(),
                    internal_viewport: None,
                },
            );
        }
        s
    }

    #[test]
    fn undo_at_tip_captures_live_state() {
        let mut h = History::new(10);
        h.push(state(&[]));
        h.push(state(&[0]));
        let live = state(&[0, 1]);

        assert_eq!(h.undo(&live), Some(state(&[0])));
        assert_eq!(h.undo(&live), Some(state(&[])));
        assert_eq!(h.undo(&live), None);
        assert_eq!(h.redo(), Some(state(&[0])));
        assert_eq!(h.redo(), Some(live));
        assert_eq!(h.redo(), None);
    }

    #[test]
    fn push_discards_redo_states() {
        let mut h = History::new(10);
        h.push(state(&[]));
        let live = state(&[0]);
        h.undo(&live);
        assert!(h.can_redo());

        h.push(state(&[]));
        assert!(!h.can_redo());
        assert_eq!(h.len(), 1);
        assert_eq!(h.index(), 1);
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut h = History::new(3);
        for i in 0..5 {
            h.push(state(&[i]));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.entries()[0], state(&[2]));
        assert_eq!(h.index(), 3);
    }

    #[test]
    fn from_parts_clamps_index() {
        let h = History::from_parts(vec![state(&[])], 7, 50);
        assert_eq!(h.index(), 1);
    }
}
