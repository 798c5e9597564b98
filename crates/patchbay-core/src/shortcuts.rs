//! Keyboard shortcut bindings for editor actions.
//!
//! Each key chord drives at most one action. Binding a chord that another
//! action already uses leaves that action explicitly [`KeyBinding::Unbound`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Undo,
    Redo,
    Copy,
    Paste,
    Delete,
    SelectAll,
    EnterNode,
    ExitToParent,
    ExitToRoot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyBinding {
    Bound(String),
    Unbound,
}

impl KeyBinding {
    pub fn chord(&self) -> Option<&str> {
        match self {
            KeyBinding::Bound(chord) => Some(chord),
            KeyBinding::Unbound => None,
        }
    }
}

/// Lowercases and trims a chord so `"Ctrl+Z "` and `"ctrl+z"` match.
fn normalize(chord: &str) -> String {
    chord.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortcutMap {
    bindings: IndexMap<Action, KeyBinding>,
}

impl ShortcutMap {
    pub fn binding(&self, action: Action) -> &KeyBinding {
        static UNBOUND: KeyBinding = KeyBinding::Unbound;
        self.bindings.get(&action).unwrap_or(&UNBOUND)
    }

    /// The action bound to `chord`, if any.
    pub fn lookup(&self, chord: &str) -> Option<Action> {
        let chord = normalize(chord);
        self.bindings
            .iter()
            .find(|(_, binding)| binding.chord() == Some(chord.as_str()))
            .map(|(action, _)| *action)
    }

    /// Binds `chord` to `action`. Returns the action that lost the chord.
    pub fn bind(&mut self, action: Action, chord: &str) -> Option<Action> {
        let chord = normalize(chord);
        let displaced = self.lookup(&chord).filter(|other| *other != action);
        if let Some(other) = displaced {
            self.bindings.insert(other, KeyBinding::Unbound);
        }
        self.bindings.insert(action, KeyBinding::Bound(chord));
        displaced
    }

    pub fn unbind(&mut self, action: Action) {
        self.bindings.insert(action, KeyBinding::Unbound);
    }
}

impl Default for ShortcutMap {
    fn default() -> Self {
        let bindings = [
            (Action::Undo, "ctrl+z"),
            (Action::Redo, "ctrl+shift+z"),
            (Action::Copy, "ctrl+c"),
            (Action::Paste, "ctrl+v"),
            (Action::Delete, "delete"),
            (Action::SelectAll, "ctrl+a"),
            (Action::EnterNode, "enter"),
            (Action::ExitToParent, "escape"),
            (Action::ExitToRoot, "shift+escape"),
        ]
        .into_iter()
        .map(|(action, chord)| (action, KeyBinding::Bound(chord.to_string())))
        .collect();
        ShortcutMap { bindings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebinding_unbinds_the_previous_owner() {
        let mut map = ShortcutMap::default();
        assert_eq!(map.bind(Action::Redo, "Ctrl+Z"), Some(Action::Undo));
        assert_eq!(map.binding(Action::Undo), &KeyBinding::Unbound);
        assert_eq!(map.lookup("ctrl+z"), Some(Action::Redo));
        assert_eq!(map.lookup("ctrl+shift+z"), None);
    }

    #[test]
    fn rebinding_the_same_action_displaces_nothing() {
        let mut map = ShortcutMap::default();
        assert_eq!(map.bind(Action::Copy, "ctrl+c"), None);
        assert_eq!(map.binding(Action::Copy).chord(), Some("ctrl+c"));
    }

    #[test]
    fn unbound_serializes_as_explicit_marker() {
        let mut map = ShortcutMap::default();
        map.unbind(Action::Delete);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["bindings"]["delete"], serde_json::json!("unbound"));
        assert_eq!(json["bindings"]["undo"], serde_json::json!({ "bound": "ctrl+z" }));
    }
}
