//! Client side of the relay connection.
//!
//! One [`TransportProvider`] owns one WebSocket and multiplexes any number
//! of rooms over it. Each joined room is a [`RoomHandle`] with its own event
//! stream. The provider:
//! - reconnects with exponential backoff after a drop
//! - re-joins every room on reconnect and replays queued updates before the
//!   handshake completes
//! - raises [`RoomEvent::Synced`] once per connection per room, when the
//!   relay's answer to our state vector has been delivered
//! - pings the relay and treats prolonged silence as a drop
//!
//! The stores themselves live with the caller; the handshake asks for a
//! diff through [`RoomEvent::SyncRequested`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duet_core::ClientId;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::{JoinRequest, MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::room::{RoomId, RoomKind};

const OUTGOING_CAPACITY: usize = 256;
const SEND_ATTEMPTS: usize = 2;

/// Exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 10_000,
            factor: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_ms as f64 * self.factor.max(1.0).powi(attempt.min(32) as i32);
        Duration::from_millis(scaled.min(self.max_ms as f64) as u64)
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Relay address, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    pub client_id: ClientId,
    pub display_name: String,
    pub backoff: Backoff,
    /// Updates kept per room while offline.
    pub offline_queue_capacity: usize,
    pub ping_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            client_id: random_client_id(),
            display_name: "Anonymous".to_string(),
            backoff: Backoff::default(),
            offline_queue_capacity: 10_000,
            ping_interval_ms: 10_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Fast reconnects and heartbeats for tests against a local relay.
    pub fn for_testing(url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            backoff: Backoff {
                initial_ms: 20,
                max_ms: 200,
                factor: 2.0,
            },
            ping_interval_ms: 500,
            connect_timeout_ms: 1_000,
            ..Self::new(url, display_name)
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

/// Non-zero random id; zero is reserved for the relay.
pub fn random_client_id() -> ClientId {
    Uuid::new_v4().as_u64_pair().0.max(1)
}

/// Connection status shown by the host as a persistent indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Events delivered to one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Status(ConnectionStatus),
    /// The relay sent its state vector. Answer with
    /// [`RoomHandle::answer_sync`].
    SyncRequested { state_vector: Vec<u8> },
    /// A store update from a peer or from the relay.
    RemoteUpdate { from: ClientId, payload: Vec<u8> },
    /// Full remote state has been delivered for this connection.
    Synced,
    RemoteAwareness { from: ClientId, payload: Vec<u8> },
    PeerJoined(PeerInfo),
    PeerLeft(ClientId),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("Connection timed out")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Updates made while a room is offline, replayed on re-join.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns `false` if the queue is full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate { clock, payload });
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.queue.iter().map(|u| (u.clock, u.payload.as_slice()))
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.clock, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

struct RoomInner {
    queue: OfflineQueue,
    /// Joined on the current connection.
    online: bool,
    synced: bool,
    members: BTreeMap<ClientId, PeerInfo>,
}

struct RoomShared {
    id: RoomId,
    kind: RoomKind,
    events: mpsc::UnboundedSender<RoomEvent>,
    inner: Mutex<RoomInner>,
}

impl RoomShared {
    fn emit(&self, event: RoomEvent) {
        // The handle may already be gone; its Leave is in flight.
        let _ = self.events.send(event);
    }
}

struct Shared {
    config: TransportConfig,
    status: watch::Sender<ConnectionStatus>,
    /// Sender into the current connection's writer task.
    link: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    clock: AtomicU64,
}

impl Shared {
    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        let link = self.link.lock().await.clone();
        match link {
            Some(tx) => tx.send(bytes).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn set_status(&self, status: ConnectionStatus, rooms: &HashMap<RoomId, Arc<RoomShared>>) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            log::info!("Connection to {} is now {status:?}", self.config.url);
            for room in rooms.values() {
                room.emit(RoomEvent::Status(status));
            }
        }
    }
}

enum Command {
    Join(Arc<RoomShared>),
    Leave(RoomId),
    Shutdown,
}

enum LinkEnd {
    Lost,
    Shutdown,
}

/// Aborts the wrapped task when dropped, so an aborted supervisor never
/// leaks its writer task or socket.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One connection to the relay, shared by every room joined through it.
pub struct TransportProvider {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    supervisor: Option<JoinHandle<()>>,
}

impl TransportProvider {
    /// Start connecting in the background. Must be called inside a tokio
    /// runtime.
    pub fn connect(config: TransportConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let shared = Arc::new(Shared {
            config,
            status,
            link: Mutex::new(None),
            clock: AtomicU64::new(0),
        });
        let (commands, command_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervise(shared.clone(), command_rx));
        Self {
            shared,
            commands,
            supervisor: Some(supervisor),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.config.client_id
    }

    pub fn display_name(&self) -> &str {
        &self.shared.config.display_name
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Watch status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Join `room`. The room stays joined across reconnects until the
    /// handle is dropped.
    pub fn join(&self, room: RoomId, kind: RoomKind) -> RoomHandle {
        let (events, event_rx) = mpsc::unbounded_channel();
        let shared_room = Arc::new(RoomShared {
            id: room,
            kind,
            events,
            inner: Mutex::new(RoomInner {
                queue: OfflineQueue::new(self.shared.config.offline_queue_capacity),
                online: false,
                synced: false,
                members: BTreeMap::new(),
            }),
        });
        if self.commands.send(Command::Join(shared_room.clone())).is_err() {
            log::warn!("Transport supervisor is gone; room {} stays offline", shared_room.id);
        }
        RoomHandle {
            room: shared_room,
            shared: self.shared.clone(),
            commands: self.commands.clone(),
            events: event_rx,
        }
    }

    /// Leave every room, close the socket and stop reconnecting.
    pub async fn disconnect(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(supervisor) = self.supervisor.take() {
            if tokio::time::timeout(self.shared.config.connect_timeout(), supervisor)
                .await
                .is_err()
            {
                log::warn!("Transport did not shut down in time");
            }
        }
    }
}

impl Drop for TransportProvider {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// A joined room.
pub struct RoomHandle {
    room: Arc<RoomShared>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<RoomEvent>,
}

impl RoomHandle {
    pub fn id(&self) -> &RoomId {
        &self.room.id
    }

    pub fn kind(&self) -> RoomKind {
        self.room.kind
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub async fn is_synced(&self) -> bool {
        self.room.inner.lock().await.synced
    }

    pub async fn members(&self) -> Vec<PeerInfo> {
        self.room.inner.lock().await.members.values().cloned().collect()
    }

    pub async fn queued(&self) -> usize {
        self.room.inner.lock().await.queue.len()
    }

    /// Next event, or `None` once the provider is gone. Cancel safe.
    pub async fn next_event(&mut self) -> Option<RoomEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<RoomEvent> {
        self.events.try_recv().ok()
    }

    /// Send a store update to the room, or queue it while offline.
    ///
    /// The room lock is only held to check `online` and to enqueue, never
    /// across the send, so the supervisor can keep dispatching while the
    /// writer is backed up.
    pub async fn broadcast(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = self.shared.next_clock();
        let bytes = SyncMessage::update(self.shared.config.client_id, self.room.id.clone(), clock, update.clone())
            .encode()?;

        // A second attempt covers a link replaced between check and send.
        for _ in 0..SEND_ATTEMPTS {
            {
                let mut inner = self.room.inner.lock().await;
                if !inner.online {
                    return self.enqueue(&mut inner, clock, update);
                }
            }
            match self.shared.send(bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(_) => log::debug!("Link closed while sending to {}; retrying", self.room.id),
            }
        }
        // Still marked online with a dead link: the supervisor is about to
        // reconnect and will replay the queue.
        let mut inner = self.room.inner.lock().await;
        self.enqueue(&mut inner, clock, update)
    }

    fn enqueue(&self, inner: &mut RoomInner, clock: u64, update: Vec<u8>) -> Result<(), ProtocolError> {
        if inner.queue.enqueue(clock, update) {
            Ok(())
        } else {
            log::warn!("Offline queue for {} is full", self.room.id);
            Err(ProtocolError::QueueFull(inner.queue.capacity()))
        }
    }

    /// Send an encoded awareness message. Dropped while offline: presence
    /// is re-announced after every join.
    pub async fn send_awareness(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.room.inner.lock().await.online {
            return Ok(());
        }
        let msg = SyncMessage::awareness(
            self.shared.config.client_id,
            self.room.id.clone(),
            self.shared.next_clock(),
            encoded,
        );
        match self.shared.send(msg.encode()?).await {
            Ok(()) | Err(ProtocolError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Answer the relay's state vector: send what it lacks, then ask for
    /// what we lack.
    pub async fn answer_sync(&self, diff: Vec<u8>, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let client_id = self.shared.config.client_id;
        let update = SyncMessage::update(client_id, self.room.id.clone(), self.shared.next_clock(), diff);
        self.shared.send(update.encode()?).await?;
        let step1 = SyncMessage::sync_step1(client_id, self.room.id.clone(), state_vector);
        self.shared.send(step1.encode()?).await
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Leave(self.room.id.clone()));
    }
}

async fn supervise(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut rooms: HashMap<RoomId, Arc<RoomShared>> = HashMap::new();
    let mut attempt: u32 = 0;

    loop {
        shared.set_status(ConnectionStatus::Connecting, &rooms);
        let url = shared.config.url.clone();
        match tokio::time::timeout(shared.config.connect_timeout(), tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => {
                attempt = 0;
                log::info!("Connected to {url}");
                if let LinkEnd::Shutdown = run_connection(&shared, ws, &mut rooms, &mut commands).await {
                    go_offline(&shared, &rooms).await;
                    return;
                }
            }
            Ok(Err(e)) => log::warn!("{}", TransportError::Connect(e)),
            Err(_) => log::warn!("{} ({url})", TransportError::Timeout),
        }
        go_offline(&shared, &rooms).await;

        let delay = shared.config.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        log::debug!("Reconnecting to {url} in {delay:?}");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = commands.recv() => match cmd {
                    Some(Command::Join(room)) => {
                        room.emit(RoomEvent::Status(*shared.status.borrow()));
                        rooms.insert(room.id.clone(), room);
                    }
                    Some(Command::Leave(id)) => {
                        rooms.remove(&id);
                    }
                    Some(Command::Shutdown) | None => return,
                }
            }
        }
    }
}

async fn go_offline(shared: &Shared, rooms: &HashMap<RoomId, Arc<RoomShared>>) {
    *shared.link.lock().await = None;
    for room in rooms.values() {
        let mut inner = room.inner.lock().await;
        inner.online = false;
        inner.synced = false;
        inner.members.clear();
    }
    shared.set_status(ConnectionStatus::Disconnected, rooms);
}

async fn run_connection(
    shared: &Shared,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    rooms: &mut HashMap<RoomId, Arc<RoomShared>>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> LinkEnd {
    let (mut ws_writer, mut ws_reader) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);

    let mut writer = AbortOnDrop(tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    }));

    *shared.link.lock().await = Some(out_tx.clone());
    shared.set_status(ConnectionStatus::Connected, rooms);
    for room in rooms.values() {
        if let Err(e) = join_room(shared, room, &out_tx).await {
            log::warn!("Failed to join {}: {e}", room.id);
            return LinkEnd::Lost;
        }
    }

    let ping_interval = shared.config.ping_interval();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = ws_reader.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    last_seen = Instant::now();
                    dispatch(shared, rooms, data.into(), &out_tx).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Relay closed the connection");
                    return LinkEnd::Lost;
                }
                Some(Err(e)) => {
                    log::warn!("Connection error: {e}");
                    return LinkEnd::Lost;
                }
                Some(Ok(_)) => last_seen = Instant::now(),
            },

            cmd = commands.recv() => match cmd {
                Some(Command::Join(room)) => {
                    room.emit(RoomEvent::Status(ConnectionStatus::Connected));
                    let joined = join_room(shared, &room, &out_tx).await;
                    rooms.insert(room.id.clone(), room);
                    if let Err(e) = joined {
                        log::warn!("Failed to join room: {e}");
                        return LinkEnd::Lost;
                    }
                }
                Some(Command::Leave(id)) => {
                    if rooms.remove(&id).is_some() {
                        send_leave(shared, &id, &out_tx).await;
                    }
                }
                Some(Command::Shutdown) | None => {
                    for id in rooms.keys() {
                        send_leave(shared, id, &out_tx).await;
                    }
                    *shared.link.lock().await = None;
                    drop(out_tx);
                    // Let the writer flush the leave frames and close.
                    let _ = tokio::time::timeout(shared.config.connect_timeout(), &mut writer.0).await;
                    return LinkEnd::Shutdown;
                }
            },

            _ = ping.tick() => {
                if last_seen.elapsed() > ping_interval * 3 {
                    log::warn!("No traffic from relay for {:?}; reconnecting", last_seen.elapsed());
                    return LinkEnd::Lost;
                }
                match SyncMessage::ping(shared.config.client_id).encode() {
                    Ok(bytes) => {
                        if out_tx.send(bytes).await.is_err() {
                            return LinkEnd::Lost;
                        }
                    }
                    Err(e) => log::warn!("Failed to encode ping: {e}"),
                }
            }
        }
    }
}

/// Send `Join` and replay the offline queue, holding the room lock so no
/// live update can overtake queued ones.
async fn join_room(shared: &Shared, room: &RoomShared, out: &mpsc::Sender<Vec<u8>>) -> Result<(), ProtocolError> {
    let client_id = shared.config.client_id;
    let mut inner = room.inner.lock().await;

    let request = JoinRequest {
        kind: room.kind,
        display_name: shared.config.display_name.clone(),
    };
    let join = SyncMessage::join(client_id, room.id.clone(), &request)?;
    out.send(join.encode()?).await.map_err(|_| ProtocolError::ConnectionClosed)?;

    if !inner.queue.is_empty() {
        log::info!("Replaying {} queued updates for {}", inner.queue.len(), room.id);
    }
    for (clock, payload) in inner.queue.iter() {
        let msg = SyncMessage::update(client_id, room.id.clone(), clock, payload.to_vec());
        out.send(msg.encode()?).await.map_err(|_| ProtocolError::ConnectionClosed)?;
    }
    inner.queue.clear();
    inner.online = true;
    inner.synced = false;
    Ok(())
}

async fn send_leave(shared: &Shared, room: &RoomId, out: &mpsc::Sender<Vec<u8>>) {
    match SyncMessage::leave(shared.config.client_id, room.clone()).encode() {
        Ok(bytes) => {
            let _ = out.send(bytes).await;
        }
        Err(e) => log::warn!("Failed to encode leave for {room}: {e}"),
    }
}

async fn dispatch(
    shared: &Shared,
    rooms: &HashMap<RoomId, Arc<RoomShared>>,
    bytes: Vec<u8>,
    out: &mpsc::Sender<Vec<u8>>,
) {
    let msg = match SyncMessage::decode(&bytes) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Dropping undecodable frame: {e}");
            return;
        }
    };

    match msg.msg_type {
        MessageType::Ping => {
            if let Ok(pong) = SyncMessage::pong(shared.config.client_id).encode() {
                let _ = out.send(pong).await;
            }
            return;
        }
        MessageType::Pong => {
            log::trace!("Pong from relay");
            return;
        }
        _ => {}
    }

    let Some(room) = rooms.get(&msg.room) else {
        log::debug!("Frame for unknown room {}", msg.room);
        return;
    };
    if msg.peer_id == shared.config.client_id {
        return;
    }

    match msg.msg_type {
        MessageType::SyncStep1 => room.emit(RoomEvent::SyncRequested {
            state_vector: msg.payload,
        }),
        MessageType::SyncStep2 => {
            room.emit(RoomEvent::RemoteUpdate {
                from: msg.peer_id,
                payload: msg.payload,
            });
            let mut inner = room.inner.lock().await;
            if inner.online && !inner.synced {
                inner.synced = true;
                log::info!("Room {} synced", room.id);
                room.emit(RoomEvent::Synced);
            }
        }
        MessageType::Update => room.emit(RoomEvent::RemoteUpdate {
            from: msg.peer_id,
            payload: msg.payload,
        }),
        MessageType::Awareness => room.emit(RoomEvent::RemoteAwareness {
            from: msg.peer_id,
            payload: msg.payload,
        }),
        MessageType::PeerJoined => match msg.peer_info() {
            Ok(info) => {
                room.inner.lock().await.members.insert(info.client_id, info.clone());
                room.emit(RoomEvent::PeerJoined(info));
            }
            Err(e) => log::warn!("Bad PeerJoined payload: {e}"),
        },
        MessageType::PeerLeft => {
            room.inner.lock().await.members.remove(&msg.peer_id);
            room.emit(RoomEvent::PeerLeft(msg.peer_id));
        }
        other => log::debug!("Ignoring {other:?} from relay"),
    }
}
