//! Error types shared by the CRDT stores and the widget bindings.

use thiserror::Error;

use crate::binding::WidgetError;

/// Errors raised by collaborative stores and bindings.
///
/// None of these ever leave a store in a partially applied state: a
/// payload that fails to decode is rejected before any transaction opens.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Invalid edit range {start}..{end} for text of length {len}")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Widget call failed: {0}")]
    Widget(#[from] WidgetError),
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::MalformedUpdate(e.to_string())
    }
}

pub type CollabResult<T> = Result<T, CollabError>;
