//! Instrument rows: per-bundle pitch mapping records.
//!
//! Rows live in an instrument node's `data.rows` array so they travel with
//! snapshots, clipboard copies, and the persisted document like any other
//! data. [`rows`] and [`write_rows`] convert between that JSON and
//! [`InstrumentRow`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{NodeId, PortId};
use crate::node::GraphNode;

pub const DEFAULT_SPREAD: i32 = 1;
pub const DEFAULT_BASE_NOTE: i32 = 0;
pub const DEFAULT_BASE_OCTAVE: i32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentRow {
    pub row_id: String,
    pub source_node_id: NodeId,
    pub source_port_id: PortId,
    pub target_port_id: PortId,
    pub label: String,
    pub spread: i32,
    pub base_note: i32,
    pub base_octave: i32,
    pub base_offset: i32,
    pub port_count: usize,
    pub key_gains: Vec<f64>,
}

impl InstrumentRow {
    pub fn new(
        row_id: String,
        source_node_id: NodeId,
        source_port_id: PortId,
        target_port_id: PortId,
        label: String,
        port_count: usize,
    ) -> Self {
        InstrumentRow {
            row_id,
            source_node_id,
            source_port_id,
            target_port_id,
            label,
            spread: DEFAULT_SPREAD,
            base_note: DEFAULT_BASE_NOTE,
            base_octave: DEFAULT_BASE_OCTAVE,
            base_offset: 0,
            port_count,
            key_gains: vec![1.0; port_count],
        }
    }

    /// MIDI note played by `channel`, clamped to 0..=127.
    pub fn note_for_channel(&self, channel: usize) -> u8 {
        let channel = i64::try_from(channel).unwrap_or(i64::MAX);
        let note = (i64::from(self.base_octave) + 1)
            .saturating_mul(12)
            .saturating_add(i64::from(self.base_note))
            .saturating_add(i64::from(self.base_offset))
            .saturating_add(channel.saturating_mul(i64::from(self.spread)));
        note.clamp(0, 127) as u8
    }

    pub fn gain_for_channel(&self, channel: usize) -> f64 {
        self.key_gains.get(channel).copied().unwrap_or(0.0)
    }

    pub fn apply(&mut self, patch: &RowPatch) {
        if let Some(label) = &patch.label {
            self.label = label.clone();
        }
        if let Some(spread) = patch.spread {
            self.spread = spread;
        }
        if let Some(base_note) = patch.base_note {
            self.base_note = base_note.clamp(0, 11);
        }
        if let Some(base_octave) = patch.base_octave {
            self.base_octave = base_octave;
        }
        if let Some(base_offset) = patch.base_offset {
            self.base_offset = base_offset;
        }
        if let Some(gains) = &patch.key_gains {
            // Gain arrays always cover every channel.
            self.key_gains = (0..self.port_count)
                .map(|i| gains.get(i).copied().unwrap_or(1.0).max(0.0))
                .collect();
        }
    }
}

/// Partial update of an [`InstrumentRow`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPatch {
    pub label: Option<String>,
    pub spread: Option<i32>,
    pub base_note: Option<i32>,
    pub base_octave: Option<i32>,
    pub base_offset: Option<i32>,
    pub key_gains: Option<Vec<f64>>,
}

/// Rows stored on `node`. Malformed entries are skipped.
pub fn rows(node: &GraphNode) -> Vec<InstrumentRow> {
    match node.data.get("rows") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn write_rows(node: &mut GraphNode, rows: &[InstrumentRow]) {
    let items = rows
        .iter()
        .filter_map(|row| serde_json::to_value(row).ok())
        .collect();
    node.data.insert("rows".to_string(), Value::Array(items));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(count: usize) -> InstrumentRow {
        InstrumentRow::new(
            "row-1".into(),
            NodeId(0),
            PortId::from("keys"),
            PortId::from("2:b0-keys-0"),
            "Keyboard".into(),
            count,
        )
    }

    #[test]
    fn defaults_map_channel_zero_to_c4() {
        let r = row(30);
        assert_eq!(r.note_for_channel(0), 60);
        assert_eq!(r.note_for_channel(12), 72);
        assert_eq!(r.key_gains.len(), 30);
        assert!(r.key_gains.iter().all(|g| *g == 1.0));
    }

    #[test]
    fn notes_clamp_to_midi_range() {
        let mut r = row(4);
        r.apply(&RowPatch {
            spread: Some(50),
            base_octave: Some(9),
            ..RowPatch::default()
        });
        assert_eq!(r.note_for_channel(3), 127);
        r.apply(&RowPatch {
            base_octave: Some(-5),
            spread: Some(1),
            ..RowPatch::default()
        });
        assert_eq!(r.note_for_channel(0), 0);
    }

    #[test]
    fn extreme_row_settings_saturate_instead_of_wrapping() {
        let mut r = row(4);
        r.apply(&RowPatch {
            base_octave: Some(i32::MAX),
            base_offset: Some(i32::MAX),
            ..RowPatch::default()
        });
        assert_eq!(r.note_for_channel(0), 127);

        r.apply(&RowPatch {
            base_octave: Some(i32::MIN),
            base_offset: Some(i32::MIN),
            ..RowPatch::default()
        });
        assert_eq!(r.note_for_channel(0), 0);

        r.apply(&RowPatch {
            base_octave: Some(4),
            base_offset: Some(0),
            spread: Some(i32::MAX),
            ..RowPatch::default()
        });
        assert_eq!(r.note_for_channel(usize::MAX), 127);
        r.spread = i32::MIN;
        assert_eq!(r.note_for_channel(usize::MAX), 0);
    }

    #[test]
    fn gain_patch_is_resized_to_port_count() {
        let mut r = row(3);
        r.apply(&RowPatch {
            key_gains: Some(vec![0.5, -1.0]),
            ..RowPatch::default()
        });
        assert_eq!(r.key_gains, vec![0.5, 0.0, 1.0]);
        assert_eq!(r.gain_for_channel(7), 0.0);
    }
}
