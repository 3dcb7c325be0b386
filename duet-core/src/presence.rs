//! Presence records: who is here, what color they draw in, where their
//! cursor and selection are.

use serde::{Deserialize, Serialize};

use crate::position::{LogicalPosition, LogicalRange};

/// Per-session replica identifier.
pub type ClientId = u64;

/// One client's ephemeral presence state.
///
/// Cursor and selection are logical positions in the shared code buffer so
/// they survive concurrent edits by other peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub client_id: ClientId,
    pub display_name: String,
    /// `#rrggbb`
    pub color: String,
    pub cursor: Option<LogicalPosition>,
    pub selection: Option<LogicalRange>,
}

impl PresenceRecord {
    /// A record with a stable color and no cursor yet.
    pub fn new(client_id: ClientId, display_name: impl Into<String>) -> Self {
        Self {
            client_id,
            display_name: display_name.into(),
            color: color_for_client(client_id),
            cursor: None,
            selection: None,
        }
    }
}

/// Partial update of the local presence record. `None` fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceFields {
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub cursor: Option<Option<LogicalPosition>>,
    pub selection: Option<Option<LogicalRange>>,
}

impl PresenceFields {
    pub fn cursor(position: LogicalPosition) -> Self {
        Self {
            cursor: Some(Some(position)),
            ..Self::default()
        }
    }

    pub fn selection(range: Option<LogicalRange>) -> Self {
        Self {
            selection: Some(range),
            ..Self::default()
        }
    }

    pub fn display_name(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Merge into `record`. Returns `true` if anything changed.
    pub fn apply_to(self, record: &mut PresenceRecord) -> bool {
        let before = record.clone();
        if let Some(name) = self.display_name {
            record.display_name = name;
        }
        if let Some(color) = self.color {
            record.color = color;
        }
        if let Some(cursor) = self.cursor {
            record.cursor = cursor;
        }
        if let Some(selection) = self.selection {
            record.selection = selection;
        }
        *record != before
    }
}

/// Stable, visually distinct color derived from a client id.
///
/// Hue comes from a mixed hash of the id; saturation and lightness are
/// fixed for legible cursors on light and dark themes.
pub fn color_for_client(client_id: ClientId) -> String {
    // splitmix64 finalizer spreads sequential ids across the hue circle.
    let mut z = client_id.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;

    let hue = ((z % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_stable_hex() {
        let c1 = color_for_client(42);
        let c2 = color_for_client(42);
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 7);
        assert!(c1.starts_with('#'));
        assert!(c1[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sequential_ids_get_different_colors() {
        let colors: std::collections::HashSet<String> = (1..=8).map(color_for_client).collect();
        assert!(colors.len() >= 6);
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_fields_merge_keeps_unset() {
        let mut record = PresenceRecord::new(7, "Ada");
        let color = record.color.clone();

        let changed = PresenceFields::cursor(LogicalPosition::from_bytes(vec![1, 2])).apply_to(&mut record);
        assert!(changed);
        assert_eq!(record.display_name, "Ada");
        assert_eq!(record.color, color);
        assert!(record.cursor.is_some());

        let unchanged = PresenceFields::display_name("Ada").apply_to(&mut record);
        assert!(!unchanged);
    }

    #[test]
    fn test_fields_can_clear_cursor() {
        let mut record = PresenceRecord::new(7, "Ada");
        record.cursor = Some(LogicalPosition::from_bytes(vec![1]));
        let fields = PresenceFields {
            cursor: Some(None),
            ..PresenceFields::default()
        };
        assert!(fields.apply_to(&mut record));
        assert!(record.cursor.is_none());
    }
}
