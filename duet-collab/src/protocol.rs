//! Binary protocol for room-scoped CRDT synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ varint    │ string   │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake for one room:
//! ```text
//! client                         relay
//!   │──── Join {kind, name} ───────►│
//!   │◄─── SyncStep1 (relay sv) ─────│
//!   │──── Update (diff for relay) ─►│
//!   │──── SyncStep1 (client sv) ───►│
//!   │◄─── SyncStep2 (diff) ─────────│   → synced
//! ```
//!
//! Payloads are opaque to this module: store updates, state vectors and
//! awareness messages are produced and consumed elsewhere.

use duet_core::ClientId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::room::{RoomId, RoomKind};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Enter a room; payload is a [`JoinRequest`].
    Join = 1,
    /// Leave a room.
    Leave = 2,
    /// State vector: "send me what I am missing".
    SyncStep1 = 3,
    /// Diff answering a `SyncStep1`.
    SyncStep2 = 4,
    /// Incremental store update.
    Update = 5,
    /// Presence update; payload is an encoded awareness message.
    Awareness = 6,
    /// Peer joined notification; payload is a [`PeerInfo`].
    PeerJoined = 7,
    /// Peer left notification.
    PeerLeft = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub kind: RoomKind,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub client_id: ClientId,
    pub display_name: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: ClientId,
    pub room: RoomId,
    /// Per-sender counter; informational for relays and logs.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: ClientId, room: RoomId, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room,
            clock,
            payload,
        }
    }

    pub fn join(peer_id: ClientId, room: RoomId, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Join, peer_id, room, 0, encode_payload(request)?))
    }

    pub fn leave(peer_id: ClientId, room: RoomId) -> Self {
        Self::new(MessageType::Leave, peer_id, room, 0, Vec::new())
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: ClientId, room: RoomId, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: ClientId, room: RoomId, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, state_diff)
    }

    pub fn update(peer_id: ClientId, room: RoomId, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, room, clock, update)
    }

    pub fn awareness(peer_id: ClientId, room: RoomId, clock: u64, encoded: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, peer_id, room, clock, encoded)
    }

    pub fn peer_joined(room: RoomId, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::PeerJoined, info.client_id, room, 0, encode_payload(info)?))
    }

    pub fn peer_left(peer_id: ClientId, room: RoomId) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: ClientId) -> Self {
        Self::new(MessageType::Ping, peer_id, RoomId::from(""), 0, Vec::new())
    }

    pub fn pong(peer_id: ClientId) -> Self {
        Self::new(MessageType::Pong, peer_id, RoomId::from(""), 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.expect(MessageType::Join)?;
        decode_payload(&self.payload)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        decode_payload(&self.payload)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type == msg_type {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType)
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Offline queue full ({0} operations)")]
    QueueFull(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::derive("session-1", RoomKind::Text)
    }

    #[test]
    fn test_update_roundtrip() {
        let payload = vec![1, 2, 3, 4, 5];
        let msg = SyncMessage::update(7, room(), 42, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.peer_id, 7);
        assert_eq!(decoded.room, room());
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_join_request_roundtrip() {
        let request = JoinRequest {
            kind: RoomKind::Graphics,
            display_name: "Ada".into(),
        };
        let msg = SyncMessage::join(3, room(), &request).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.join_request().unwrap(), request);
    }

    #[test]
    fn test_peer_joined_roundtrip() {
        let info = PeerInfo {
            client_id: 11,
            display_name: "Grace".into(),
        };
        let msg = SyncMessage::peer_joined(room(), &info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.peer_id, 11);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_wrong_payload_accessor() {
        let msg = SyncMessage::ping(1);
        assert_eq!(msg.join_request(), Err(ProtocolError::InvalidMessageType));
        assert_eq!(msg.peer_info(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(matches!(
            SyncMessage::decode(&[0xFF, 0xFE, 0xFD]),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::update(u64::MAX, room(), 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 100, "Encoded size {} too large for 50-byte update", encoded.len());
    }

    #[test]
    fn test_large_update() {
        let update = vec![42u8; 65536];
        let msg = SyncMessage::update(1, room(), 999, update.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, update);
    }
}
