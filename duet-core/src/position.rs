//! Content-relative positions.
//!
//! A [`LogicalPosition`] is an encoded Yrs sticky index: it names the
//! character a cursor sits in front of rather than a numeric offset, so it
//! stays meaningful while peers insert and delete around it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalPosition(Vec<u8>);

impl LogicalPosition {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A selection expressed as two logical positions.
///
/// `anchor` is where the selection started, `head` is where the caret is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalRange {
    pub anchor: LogicalPosition,
    pub head: LogicalPosition,
}

impl LogicalRange {
    pub fn new(anchor: LogicalPosition, head: LogicalPosition) -> Self {
        Self { anchor, head }
    }
}
