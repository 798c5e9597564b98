pub mod id;
pub mod error;
pub mod port;
pub mod node;
pub mod connection;
pub mod state;
pub mod registry;
pub mod panel;
pub mod sync;
pub mod instrument;
mod bundle;
mod effects;
pub mod history;
pub mod graph;
pub mod clipboard;
pub mod navigation;
pub mod persist;
pub mod flow;
pub mod shortcuts;

// Re-export commonly used types
pub use id::{NodeId, ConnectionId, PortId, IdAllocator};
pub use error::CoreError;
pub use port::{SignalType, Resolution, PortType, Direction, PortDefinition};
pub use node::{NodeType, NodeCategory, GraphNode, Position, Viewport};
pub use connection::Connection;
pub use state::GraphState;
pub use registry::{NodeRegistry, NodeDefinition, BoundaryRole};
pub use instrument::{InstrumentRow, RowPatch};
pub use graph::{GraphStore, StoreConfig, RemoveOutcome, Violation};
pub use navigation::{NavigationCursor, ViewportConfig};
pub use persist::{PersistedDocument, PersistedState, STORAGE_KEY};
pub use shortcuts::{Action, KeyBinding, ShortcutMap};
