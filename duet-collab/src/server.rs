//! WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                   ┌── "s1::code"       TextReplica  + BroadcastGroup
//!            ├── one socket ─────┤
//! Client B ──┘   per client      └── "s1::whiteboard" ElementMap   + BroadcastGroup
//! ```
//!
//! Each room keeps an in-memory authoritative replica, chosen by the kind
//! the first joiner declares, so late joiners can be caught up with a
//! state vector diff. Nothing is persisted: a room and its replica are
//! dropped when the last peer leaves.
//!
//! The relay never echoes a message to its sender and never forwards an
//! update it failed to merge.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use duet_core::{ClientId, CollabResult, ElementMap, Replica, TextReplica};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::{BroadcastGroup, Envelope, RoomManager};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::room::{RoomId, RoomKind};

/// Peer id the relay uses for messages it originates.
pub const RELAY_PEER_ID: ClientId = 0;

/// Server configuration.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Connections silent for three intervals are closed
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1) * 3)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    /// Updates dropped because they failed to merge.
    pub rejected_updates: u64,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Authoritative replica of one room.
///
/// Each room carries its own lock so a large merge in one room never
/// stalls traffic in another.
struct RelayRoom {
    kind: RoomKind,
    replica: RwLock<Box<dyn Replica + Send + Sync>>,
}

impl RelayRoom {
    fn new(kind: RoomKind) -> Self {
        let replica: Box<dyn Replica + Send + Sync> = match kind {
            RoomKind::Text => Box::new(TextReplica::new()),
            RoomKind::Graphics => Box::new(ElementMap::new()),
        };
        Self {
            kind,
            replica: RwLock::new(replica),
        }
    }

    async fn state_vector(&self) -> Vec<u8> {
        self.replica.read().await.state_vector()
    }

    async fn encode_diff(&self, remote_state_vector: &[u8]) -> CollabResult<Vec<u8>> {
        self.replica.read().await.encode_diff(remote_state_vector)
    }

    async fn merge_update(&self, update: &[u8]) -> CollabResult<bool> {
        self.replica.write().await.merge_update(update)
    }
}

/// The map lock only guards lookup, insertion and removal.
type Replicas = Arc<RwLock<HashMap<RoomId, Arc<RelayRoom>>>>;

async fn lookup(replicas: &Replicas, room: &RoomId) -> Option<Arc<RelayRoom>> {
    replicas.read().await.get(room).cloned()
}

/// A room this connection has joined.
struct Membership {
    group: Arc<BroadcastGroup>,
    forwarder: JoinHandle<()>,
}

/// Per-connection state.
struct Connection {
    addr: SocketAddr,
    client_id: Option<ClientId>,
    rooms: HashMap<RoomId, Membership>,
    /// Feeds forwarded room traffic to the socket writer.
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
}

/// The relay server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    replicas: Replicas,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            replicas: Arc::new(RwLock::new(HashMap::new())),
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (outbound, mut outbound_rx) = mpsc::channel(self.config.broadcast_capacity.max(1));
        let mut conn = Connection {
            addr,
            client_id: None,
            rooms: HashMap::new(),
            outbound,
        };
        let idle_timeout = self.config.idle_timeout();
        let mut last_seen = Instant::now();

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let replies = self.handle_frame(&mut conn, bytes).await;
                            let mut failed = None;
                            for reply in replies {
                                if let Err(e) = ws_sender.send(Message::Binary(reply.into())).await {
                                    failed = Some(e);
                                    break;
                                }
                            }
                            if let Some(e) = failed {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                    }
                }

                Some(bytes) = outbound_rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::Binary(bytes.to_vec().into())).await {
                        break Err(e.into());
                    }
                }

                _ = tokio::time::sleep_until(last_seen + idle_timeout) => {
                    log::info!("Closing idle connection from {addr}");
                    break Ok(());
                }
            }
        };

        let joined: Vec<RoomId> = conn.rooms.keys().cloned().collect();
        for room in joined {
            self.leave_room(&mut conn, &room).await;
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = self.room_manager.room_count().await;
        }
        result
    }

    /// Handle one inbound frame and return the replies for this socket.
    async fn handle_frame(&self, conn: &mut Connection, bytes: Vec<u8>) -> Vec<Vec<u8>> {
        let msg = match SyncMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {}: {e}", conn.addr);
                return Vec::new();
            }
        };
        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }

        match conn.client_id {
            None if msg.msg_type != MessageType::Ping => conn.client_id = Some(msg.peer_id),
            Some(id) if id != msg.peer_id => {
                log::warn!(
                    "Peer {id} at {} sent a message as {}; ignoring",
                    conn.addr,
                    msg.peer_id
                );
                return Vec::new();
            }
            _ => {}
        }

        let msg_type = msg.msg_type;
        let result = match msg_type {
            MessageType::Join => self.join_room(conn, &msg).await,
            MessageType::Leave => {
                self.leave_room(conn, &msg.room).await;
                Ok(Vec::new())
            }
            MessageType::SyncStep1 => self.answer_sync(conn, &msg).await,
            MessageType::Update | MessageType::SyncStep2 => {
                self.relay_update(conn, msg, bytes).await;
                Ok(Vec::new())
            }
            MessageType::Awareness => {
                self.relay_awareness(conn, &msg, bytes).await;
                Ok(Vec::new())
            }
            MessageType::Ping => SyncMessage::pong(RELAY_PEER_ID).encode().map(|pong| vec![pong]),
            MessageType::Pong => Ok(Vec::new()),
            MessageType::PeerJoined | MessageType::PeerLeft => {
                log::debug!("Ignoring relay-only message {:?} from {}", msg.msg_type, conn.addr);
                Ok(Vec::new())
            }
        };

        result.unwrap_or_else(|e| {
            log::warn!("Failed to handle {:?} from {}: {e}", msg_type, conn.addr);
            Vec::new()
        })
    }

    async fn join_room(&self, conn: &mut Connection, msg: &SyncMessage) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let request = msg.join_request()?;
        let info = PeerInfo {
            client_id: msg.peer_id,
            display_name: request.display_name.clone(),
        };
        let room = msg.room.clone();

        // Lock order: replicas, then room manager, then the room's replica.
        let (group, relay_room) = {
            let mut replicas = self.replicas.write().await;
            let group = self.room_manager.get_or_create(&room).await;
            if !group.has_peer(info.client_id).await
                && group.peer_count().await >= self.config.max_peers_per_room
            {
                log::warn!("Room {room} is full; rejecting {}", info.client_id);
                return Ok(Vec::new());
            }
            let relay_room = replicas
                .entry(room.clone())
                .or_insert_with(|| Arc::new(RelayRoom::new(request.kind)))
                .clone();
            if relay_room.kind != request.kind {
                log::warn!(
                    "Peer {} asked for {:?} but room {room} holds {:?}",
                    info.client_id,
                    request.kind,
                    relay_room.kind
                );
                return Ok(Vec::new());
            }
            (group, relay_room)
        };
        let state_vector = relay_room.state_vector().await;

        if let Some(previous) = conn.rooms.remove(&room) {
            previous.forwarder.abort();
        }
        let existing: Vec<PeerInfo> = group
            .peers()
            .await
            .into_iter()
            .filter(|p| p.client_id != info.client_id)
            .collect();
        let rx = group.add_peer(info.clone()).await;
        let forwarder = self.spawn_forwarder(rx, info.client_id, room.clone(), group.clone(), conn.outbound.clone());
        conn.rooms.insert(room.clone(), Membership { group: group.clone(), forwarder });

        let mut replies = vec![SyncMessage::sync_step1(RELAY_PEER_ID, room.clone(), state_vector).encode()?];
        for peer in &existing {
            replies.push(SyncMessage::peer_joined(room.clone(), peer)?.encode()?);
        }
        for cached in group.cached_awareness(info.client_id).await {
            replies.push(cached.to_vec());
        }

        group.broadcast(info.client_id, &SyncMessage::peer_joined(room.clone(), &info)?)?;
        {
            let mut s = self.stats.write().await;
            s.active_rooms = self.room_manager.room_count().await;
        }
        log::info!(
            "Peer {} ({}) joined room {room} with {} others",
            info.display_name,
            info.client_id,
            existing.len()
        );
        Ok(replies)
    }

    async fn leave_room(&self, conn: &mut Connection, room: &RoomId) {
        let Some(membership) = conn.rooms.remove(room) else {
            return;
        };
        membership.forwarder.abort();
        let Some(client_id) = conn.client_id else {
            return;
        };

        membership.group.remove_peer(client_id).await;
        if let Err(e) = membership
            .group
            .broadcast(client_id, &SyncMessage::peer_left(client_id, room.clone()))
        {
            log::warn!("Failed to announce departure of {client_id} from {room}: {e}");
        }

        let mut replicas = self.replicas.write().await;
        if self.room_manager.remove_if_empty(room).await {
            replicas.remove(room);
            log::info!("Room {room} removed (empty)");
        }
        log::info!("Peer {client_id} left room {room}");
    }

    async fn answer_sync(&self, conn: &Connection, msg: &SyncMessage) -> Result<Vec<Vec<u8>>, ProtocolError> {
        if !conn.rooms.contains_key(&msg.room) {
            log::debug!("SyncStep1 for unjoined room {} from {}", msg.room, conn.addr);
            return Ok(Vec::new());
        }
        let Some(relay_room) = lookup(&self.replicas, &msg.room).await else {
            return Ok(Vec::new());
        };
        match relay_room.encode_diff(&msg.payload).await {
            Ok(diff) => Ok(vec![SyncMessage::sync_step2(RELAY_PEER_ID, msg.room.clone(), diff).encode()?]),
            Err(e) => {
                log::warn!("Bad state vector from {} for {}: {e}", msg.peer_id, msg.room);
                Ok(Vec::new())
            }
        }
    }

    async fn relay_update(&self, conn: &Connection, msg: SyncMessage, raw: Vec<u8>) {
        let Some(membership) = conn.rooms.get(&msg.room) else {
            log::debug!("Update for unjoined room {} from {}", msg.room, conn.addr);
            return;
        };

        let Some(relay_room) = lookup(&self.replicas, &msg.room).await else {
            return;
        };
        if let Err(e) = relay_room.merge_update(&msg.payload).await {
            log::warn!("Dropping malformed update from {} in {}: {e}", msg.peer_id, msg.room);
            self.stats.write().await.rejected_updates += 1;
            return;
        }

        log::trace!("Relaying {} byte update from {} in {}", msg.payload.len(), msg.peer_id, msg.room);
        let bytes = if msg.msg_type == MessageType::Update {
            Arc::new(raw)
        } else {
            let forwarded = SyncMessage::update(msg.peer_id, msg.room.clone(), msg.clock, msg.payload);
            match forwarded.encode() {
                Ok(bytes) => Arc::new(bytes),
                Err(e) => {
                    log::warn!("Failed to re-encode update: {e}");
                    return;
                }
            }
        };
        membership.group.broadcast_raw(Envelope {
            from: msg.peer_id,
            bytes,
        });
    }

    async fn relay_awareness(&self, conn: &Connection, msg: &SyncMessage, raw: Vec<u8>) {
        let Some(membership) = conn.rooms.get(&msg.room) else {
            return;
        };
        log::trace!("Awareness from {} in {}", msg.peer_id, msg.room);
        let bytes = Arc::new(raw);
        membership.group.cache_awareness(msg.peer_id, bytes.clone()).await;
        membership.group.broadcast_raw(Envelope {
            from: msg.peer_id,
            bytes,
        });
    }

    /// Forward room traffic to one connection, skipping its own messages.
    ///
    /// A lagging peer has missed updates, so it is sent a fresh `SyncStep1`
    /// to pull the difference.
    fn spawn_forwarder(
        &self,
        mut rx: broadcast::Receiver<Envelope>,
        client_id: ClientId,
        room: RoomId,
        group: Arc<BroadcastGroup>,
        outbound: mpsc::Sender<Arc<Vec<u8>>>,
    ) -> JoinHandle<()> {
        let replicas = self.replicas.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.from == client_id {
                            continue;
                        }
                        if outbound.send(envelope.bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {client_id} lagged by {n} messages in {room}; resyncing");
                        group.record_dropped(n);
                        let Some(relay_room) = lookup(&replicas, &room).await else {
                            break;
                        };
                        let state_vector = relay_room.state_vector().await;
                        match SyncMessage::sync_step1(RELAY_PEER_ID, room.clone(), state_vector).encode() {
                            Ok(bytes) => {
                                if outbound.send(Arc::new(bytes)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Failed to encode resync request: {e}"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}
