//! Room identifiers.
//!
//! A collaborative session owns two rooms, one per document type, that share
//! a single connection. Room ids are derived from the session id plus a
//! fixed suffix so they never collide.

use serde::{Deserialize, Serialize};

/// Which replicated store a room carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomKind {
    /// Collaborative code buffer.
    Text,
    /// Collaborative whiteboard.
    Graphics,
}

impl RoomKind {
    pub fn suffix(self) -> &'static str {
        match self {
            RoomKind::Text => "::code",
            RoomKind::Graphics => "::whiteboard",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    /// Room for `kind` within the session `session_id`.
    pub fn derive(session_id: &str, kind: RoomKind) -> Self {
        Self(format!("{session_id}{}", kind.suffix()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        assert_eq!(RoomId::derive("interview-42", RoomKind::Text), RoomId::derive("interview-42", RoomKind::Text));
        assert_eq!(RoomId::derive("interview-42", RoomKind::Text).as_str(), "interview-42::code");
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let text = RoomId::derive("s1", RoomKind::Text);
        let graphics = RoomId::derive("s1", RoomKind::Graphics);
        assert_ne!(text, graphics);
        assert_eq!(graphics.to_string(), "s1::whiteboard");
    }
}
