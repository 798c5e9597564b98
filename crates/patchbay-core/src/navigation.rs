//! Navigation cursor: which level of the hierarchy the editor is showing.
//!
//! Leaving a context stores the active viewport on it (the root viewport, or
//! the node's `internal_viewport`); entering one restores what was stored
//! there, or frames its children when nothing was.

use tracing::warn;

use crate::graph::GraphStore;
use crate::id::NodeId;
use crate::node::{Position, Viewport};

/// Canvas geometry used for auto-fit framing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportConfig {
    pub canvas_width: f64,
    pub canvas_height: f64,
    pub padding: f64,
    /// Assumed on-canvas size of one node.
    pub node_width: f64,
    pub node_height: f64,
    pub min_zoom: f64,
    pub max_zoom: f64,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        ViewportConfig {
            canvas_width: 1200.0,
            canvas_height: 800.0,
            padding: 80.0,
            node_width: 200.0,
            node_height: 100.0,
            min_zoom: 0.2,
            max_zoom: 1.5,
        }
    }
}

impl ViewportConfig {
    /// Viewport framing every position in `positions`.
    ///
    /// An empty set yields the centered default.
    pub fn fit(&self, positions: &[Position]) -> Viewport {
        let Some(first) = positions.first() else {
            return Viewport {
                x: self.canvas_width / 2.0,
                y: self.canvas_height / 2.0,
                zoom: 1.0,
            };
        };
        let (mut min_x, mut min_y) = (first.x, first.y);
        let (mut max_x, mut max_y) = (first.x, first.y);
        for p in positions {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        let width = max_x - min_x + self.node_width;
        let height = max_y - min_y + self.node_height;
        let zoom = ((self.canvas_width - 2.0 * self.padding) / width)
            .min((self.canvas_height - 2.0 * self.padding) / height)
            .clamp(self.min_zoom, self.max_zoom);

        let center_x = min_x + width / 2.0;
        let center_y = min_y + height / 2.0;
        Viewport {
            x: self.canvas_width / 2.0 - center_x * zoom,
            y: self.canvas_height / 2.0 - center_y * zoom,
            zoom,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavigationCursor {
    current_view: Option<NodeId>,
    root_viewport: Viewport,
    active_viewport: Viewport,
    config: ViewportConfig,
}

impl NavigationCursor {
    pub fn new(config: ViewportConfig) -> Self {
        NavigationCursor {
            current_view: None,
            root_viewport: Viewport::default(),
            active_viewport: Viewport::default(),
            config,
        }
    }

    /// The node whose interior is shown; `None` at the root.
    pub fn current_view(&self) -> Option<NodeId> {
        self.current_view
    }

    pub fn active_viewport(&self) -> Viewport {
        self.active_viewport
    }

    pub fn root_viewport(&self) -> Viewport {
        self.root_viewport
    }

    /// Records pan/zoom changes made by the user in the current context.
    pub fn set_active_viewport(&mut self, viewport: Viewport) {
        self.active_viewport = viewport;
    }

    /// Shows the interior of `id`. Unknown ids are logged and ignored.
    pub fn enter_node(&mut self, store: &mut GraphStore, id: NodeId) -> bool {
        if store.node(id).is_none() {
            warn!(%id, "cannot enter unknown node");
            return false;
        }
        self.save_active(store);
        self.current_view = Some(id);
        self.active_viewport = self.restore_or_fit(store, id);
        true
    }

    /// Steps out one level. Returns `false` at the root.
    pub fn exit_to_parent(&mut self, store: &mut GraphStore) -> bool {
        let Some(current) = self.current_view else {
            return false;
        };
        self.save_active(store);
        let parent = store.node(current).and_then(|n| n.parent_id);
        self.current_view = parent;
        self.active_viewport = match parent {
            Some(parent) => self.restore_or_fit(store, parent),
            None => self.root_viewport,
        };
        true
    }

    /// Jumps straight to the root. Returns `false` when already there.
    pub fn exit_to_root(&mut self, store: &mut GraphStore) -> bool {
        if self.current_view.is_none() {
            return false;
        }
        self.save_active(store);
        self.current_view = None;
        self.active_viewport = self.root_viewport;
        true
    }

    /// Node ids from the outermost ancestor down to the current view.
    pub fn current_path(&self, store: &GraphStore) -> Vec<NodeId> {
        let Some(current) = self.current_view.filter(|id| store.node(*id).is_some()) else {
            return Vec::new();
        };
        let mut path: Vec<NodeId> = store.state().ancestors(current).into_iter().collect();
        path.reverse();
        path.push(current);
        path
    }

    pub fn current_depth(&self, store: &GraphStore) -> usize {
        self.current_path(store).len()
    }

    /// Labels along [`current_path`](Self::current_path), prefixed by
    /// `"Root"`.
    pub fn breadcrumbs(&self, store: &GraphStore) -> Vec<String> {
        std::iter::once("Root".to_string())
            .chain(
                self.current_path(store)
                    .into_iter()
                    .filter_map(|id| store.node(id).map(|n| n.label())),
            )
            .collect()
    }

    /// Falls back to the root when the viewed node no longer exists (after
    /// an undo, say). Returns `true` if the cursor moved.
    pub fn revalidate(&mut self, store: &GraphStore) -> bool {
        match self.current_view {
            Some(id) if store.node(id).is_none() => {
                self.current_view = None;
                self.active_viewport = self.root_viewport;
                true
            }
            _ => false,
        }
    }

    fn save_active(&mut self, store: &mut GraphStore) {
        match self.current_view {
            None => self.root_viewport = self.active_viewport,
            Some(id) => {
                store.set_internal_viewport(id, self.active_viewport);
            }
        }
    }

    fn restore_or_fit(&self, store: &GraphStore, id: NodeId) -> Viewport {
        let Some(node) = store.node(id) else {
            return self.root_viewport;
        };
        if let Some(saved) = node.internal_viewport {
            return saved;
        }
        let positions: Vec<Position> = node
            .child_ids
            .iter()
            .filter_map(|c| store.node(*c))
            .map(|c| c.position)
            .collect();
        self.config.fit(&positions)
    }
}

impl Default for NavigationCursor {
    fn default() -> Self {
        Self::new(ViewportConfig::default())
    }
}
