//! Runtime-free core of the Duet collaborative session.
//!
//! Holds the two replicated stores (code text and whiteboard elements), the
//! presence record type, and the bindings that connect those stores to host
//! widgets. Nothing here touches the network or a clock: transports feed
//! bytes in, and callers pass the current `Instant` to anything timed.

pub mod binding;
pub mod config;
pub mod decoration;
mod decoding;
pub mod element;
pub mod error;
pub mod graphics;
pub mod observer;
pub mod position;
pub mod presence;
pub mod replica;
pub mod text;

pub use config::SyncTimings;
pub use element::{Bounds, ElementId, ElementKind, ElementRecord, Point};
pub use error::{CollabError, CollabResult};
pub use graphics::{ElementMap, MapChange, MapOp, SharedGraphics};
pub use observer::{ChangeOrigin, SubscriptionId};
pub use position::{LogicalPosition, LogicalRange};
pub use presence::{ClientId, PresenceFields, PresenceRecord};
pub use replica::Replica;
pub use text::{SharedText, TextChange, TextEdit, TextReplica};
