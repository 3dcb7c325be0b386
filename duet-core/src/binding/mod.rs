//! Bridges between the shared stores and host widgets.
//!
//! - [`editor`]: code editor, applied incrementally.
//! - [`scene`]: whiteboard, reconciled through a guarded state machine.

pub mod editor;
pub mod scene;

use thiserror::Error;

/// A host widget rejected a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct WidgetError(pub String);

impl WidgetError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub use editor::{EditorBinding, EditorStats, TextWidget, WidgetInstanceId};
pub use scene::{
    FlushOutcome, ReconcilerState, ReconcilerStats, RemoteOutcome, SceneReconciler, SceneWidget,
    SyncSession,
};
