//! # duet-collab — networking for Duet collaborative sessions
//!
//! Carries the two replicated stores of `duet-core` between participants
//! through a WebSocket relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    one WebSocket     ┌──────────────┐
//! │ CollabSession    │ ◄──────────────────► │ SyncServer   │
//! │  TransportProvider│   Binary Proto      │  (relay)     │
//! │  ├ "s::code"     │                      └──────┬───────┘
//! │  └ "s::whiteboard"│                            │
//! └──────────────────┘                     ┌───────┴───────┐
//!                                          │ BroadcastGroup│
//!                                          │ per room      │
//!                                          └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`room`] — Room ids derived from a session id
//! - [`broadcast`] — Room-based fan-out
//! - [`server`] — Relay with in-memory authoritative replicas
//! - [`transport`] — Client connection, reconnect and offline queue
//! - [`awareness`] — Ephemeral presence with timeout-driven expiry
//! - [`session`] — Client event loop wiring stores, widgets and transport

pub mod awareness;
pub mod broadcast;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod transport;

pub use awareness::{AwarenessChange, AwarenessChannel, AwarenessMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope, RoomManager};
pub use protocol::{JoinRequest, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use room::{RoomId, RoomKind};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer, RELAY_PEER_ID};
pub use session::{CollabSession, LocalEvent, SessionConfig, SessionHandle, SessionInput};
pub use transport::{
    Backoff, ConnectionStatus, OfflineQueue, RoomEvent, RoomHandle, TransportConfig, TransportError,
    TransportProvider,
};
