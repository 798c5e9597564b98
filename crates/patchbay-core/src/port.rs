//! Port definitions and signal typing.
//!
//! A port's declared [`PortType`] is either concrete (`Audio`, `Control`) or
//! `Universal`. Universal ports carry a small state machine,
//! [`Resolution`], that moves to `Resolved` when the owning node gains its first
//! connection and back to `Unresolved` when its last connection goes away.

use serde::{Deserialize, Serialize};

use crate::id::PortId;

/// The concrete kind of signal a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Audio,
    Control,
}

/// Resolution state of a universal port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Unresolved,
    Resolved(SignalType),
}

/// Declared type of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Audio,
    Control,
    Universal(Resolution),
}

impl PortType {
    /// A universal port that has not been connected yet.
    pub const UNIVERSAL: PortType = PortType::Universal(Resolution::Unresolved);

    /// The type this port currently behaves as. `None` while unresolved.
    pub fn effective(&self) -> Option<SignalType> {
        match self {
            PortType::Audio => Some(SignalType::Audio),
            PortType::Control => Some(SignalType::Control),
            PortType::Universal(Resolution::Resolved(signal)) => Some(*signal),
            PortType::Universal(Resolution::Unresolved) => None,
        }
    }

    pub fn is_universal(&self) -> bool {
        matches!(self, PortType::Universal(_))
    }

    /// Two types may be joined when their effective types agree or either is
    /// still unresolved.
    pub fn compatible_with(&self, other: &PortType) -> bool {
        match (self.effective(), other.effective()) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl From<SignalType> for PortType {
    fn from(signal: SignalType) -> Self {
        match signal {
            SignalType::Audio => PortType::Audio,
            SignalType::Control => PortType::Control,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// Normalized rendering anchor. Not interpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Anchor {
    pub x: f64,
    pub y: f64,
}

impl Anchor {
    pub fn new(x: f64, y: f64) -> Self {
        Anchor { x, y }
    }
}

/// A port on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDefinition {
    pub id: PortId,
    pub name: String,
    #[serde(rename = "type")]
    pub port_type: PortType,
    pub direction: Direction,
    #[serde(default)]
    pub is_bundled: bool,
    #[serde(default)]
    pub position: Anchor,
}

impl PortDefinition {
    pub fn new(id: &str, name: &str, port_type: PortType, direction: Direction) -> Self {
        PortDefinition {
            id: PortId::from(id),
            name: name.to_string(),
            port_type,
            direction,
            is_bundled: false,
            position: Anchor::default(),
        }
    }

    pub fn input(id: &str, name: &str, port_type: PortType) -> Self {
        Self::new(id, name, port_type, Direction::Input)
    }

    pub fn output(id: &str, name: &str, port_type: PortType) -> Self {
        Self::new(id, name, port_type, Direction::Output)
    }

    pub fn bundled(mut self) -> Self {
        self.is_bundled = true;
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Anchor::new(x, y);
        self
    }

    pub fn effective_type(&self) -> Option<SignalType> {
        self.port_type.effective()
    }
}
