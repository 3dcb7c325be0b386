//! Whiteboard elements as stored in the shared graphics map.

use serde::{Deserialize, Serialize};

pub type ElementId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Rectangle,
    Ellipse,
    Diamond,
    Line,
    Arrow,
    FreeDraw,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounds in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }
}

/// One drawable element.
///
/// `version` increases on every edit made by the owning widget and
/// `version_nonce` is a random tie-breaker for equal versions. Deleting an
/// element in the widget sets `is_deleted` and bumps the version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub id: ElementId,
    pub version: u64,
    pub version_nonce: u32,
    pub is_deleted: bool,
    pub kind: ElementKind,
    pub bounds: Bounds,
    pub angle: f32,
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(default)]
    pub text: Option<String>,
    pub stroke_color: String,
    pub background_color: String,
}

impl ElementRecord {
    pub fn new(id: impl Into<ElementId>, kind: ElementKind, bounds: Bounds) -> Self {
        Self {
            id: id.into(),
            version: 1,
            version_nonce: 0,
            is_deleted: false,
            kind,
            bounds,
            angle: 0.0,
            points: Vec::new(),
            text: None,
            stroke_color: "#1e1e1e".to_string(),
            background_color: "transparent".to_string(),
        }
    }

    /// Record an edit: bump the version and take a fresh nonce.
    pub fn bump(&mut self, nonce: u32) {
        self.version = self.version.saturating_add(1);
        self.version_nonce = nonce;
    }

    /// Mark deleted as the widget would.
    pub fn mark_deleted(&mut self, nonce: u32) {
        self.is_deleted = true;
        self.bump(nonce);
    }

    pub fn revision(&self) -> Revision {
        Revision {
            version: self.version,
            is_deleted: self.is_deleted,
        }
    }
}

/// The part of a record the reconciler diffs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Revision {
    pub version: u64,
    pub is_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_and_delete() {
        let mut rect = ElementRecord::new("r1", ElementKind::Rectangle, Bounds::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(rect.revision(), Revision { version: 1, is_deleted: false });

        rect.bump(99);
        assert_eq!(rect.version, 2);
        assert_eq!(rect.version_nonce, 99);

        rect.mark_deleted(7);
        assert_eq!(rect.revision(), Revision { version: 3, is_deleted: true });
    }

    #[test]
    fn test_json_defaults_for_optional_fields() {
        let json = r##"{
            "id": "t1", "version": 4, "version_nonce": 11, "is_deleted": false,
            "kind": "Text", "bounds": { "x": 1.0, "y": 2.0, "width": 30.0, "height": 12.0 },
            "angle": 0.0, "stroke_color": "#000000", "background_color": "transparent"
        }"##;
        let record: ElementRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, ElementKind::Text);
        assert!(record.points.is_empty());
        assert!(record.text.is_none());
    }
}
