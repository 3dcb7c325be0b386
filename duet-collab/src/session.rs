//! The client event loop for one collaborative session.
//!
//! A session owns one store per room, injects them into the editor binding
//! and the scene reconciler, and drives every timer (debounce, snapshot
//! grace, presence expiry and heartbeat) from a single `select!` loop. All
//! store mutation happens on this loop, one event at a time.
//!
//! ```text
//!  text room ─────┐                         ┌─► TextWidget
//!  graphics room ─┼─► CollabSession::handle ┼─► SceneWidget
//!  LocalEvent ────┤   (one at a time)       └─► TransportProvider
//!  timers ────────┘
//! ```
//!
//! Local editing keeps working while disconnected; store updates are
//! queued by the transport and everything is reconciled on reconnect.

use std::ops::Range;
use std::time::Duration;

use duet_core::binding::{EditorBinding, FlushOutcome, SceneReconciler, SceneWidget, TextWidget, WidgetInstanceId};
use duet_core::{
    ClientId, ElementRecord, LogicalRange, PresenceFields, PresenceRecord, Replica, SharedGraphics, SharedText,
    SyncTimings, TextEdit,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::awareness::{AwarenessChannel, AwarenessMessage};
use crate::protocol::ProtocolError;
use crate::room::{RoomId, RoomKind};
use crate::transport::{ConnectionStatus, RoomEvent, RoomHandle, TransportConfig, TransportProvider};

/// How long the loop sleeps when no timer is armed.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Enclosing session identifier; room ids are derived from it.
    pub session_id: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub timings: SyncTimings,
}

/// Something the host widgets reported.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    /// The user edited the code buffer; the widget already shows it.
    TextEdited(TextEdit),
    CursorMoved(usize),
    SelectionChanged(Option<Range<usize>>),
    /// The whiteboard reported its full element list.
    SceneChanged(Vec<ElementRecord>),
    /// The whiteboard remounted.
    SceneRemounted,
    Shutdown,
}

/// One unit of work for [`CollabSession::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Room(RoomKind, RoomEvent),
    Local(LocalEvent),
    Timer,
}

/// Cloneable sender for [`LocalEvent`]s.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<LocalEvent>,
}

impl SessionHandle {
    /// Returns `false` once the session has stopped.
    pub fn send(&self, event: LocalEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn edit(&self, edit: TextEdit) -> bool {
        self.send(LocalEvent::TextEdited(edit))
    }

    pub fn move_cursor(&self, offset: usize) -> bool {
        self.send(LocalEvent::CursorMoved(offset))
    }

    pub fn scene_changed(&self, elements: Vec<ElementRecord>) -> bool {
        self.send(LocalEvent::SceneChanged(elements))
    }

    pub fn shutdown(&self) -> bool {
        self.send(LocalEvent::Shutdown)
    }
}

pub struct CollabSession<T, S> {
    client_id: ClientId,
    provider: TransportProvider,
    text_room: RoomHandle,
    graphics_room: RoomHandle,
    text: SharedText,
    graphics: SharedGraphics,
    awareness: AwarenessChannel,
    editor: EditorBinding,
    editor_widget: T,
    reconciler: SceneReconciler,
    scene_widget: S,
    scene_instance: WidgetInstanceId,
    local_events: mpsc::UnboundedReceiver<LocalEvent>,
    stopped: bool,
}

impl<T: TextWidget, S: SceneWidget> CollabSession<T, S> {
    /// Connect to the relay, join both rooms and bind the widgets.
    pub fn start(config: SessionConfig, mut editor_widget: T, scene_widget: S) -> (Self, SessionHandle) {
        let client_id = config.transport.client_id;
        let local = PresenceRecord::new(client_id, config.transport.display_name.clone());
        let provider = TransportProvider::connect(config.transport);
        let text_room = provider.join(RoomId::derive(&config.session_id, RoomKind::Text), RoomKind::Text);
        let graphics_room = provider.join(RoomId::derive(&config.session_id, RoomKind::Graphics), RoomKind::Graphics);

        let text = SharedText::new();
        let mut editor = EditorBinding::new();
        editor.bind(1, &text, &mut editor_widget);
        let mut reconciler = SceneReconciler::new(config.timings);
        reconciler.attach(std_now());

        let (tx, local_events) = mpsc::unbounded_channel();
        log::info!("Session {} started as client {client_id}", config.session_id);
        let session = Self {
            client_id,
            provider,
            text_room,
            graphics_room,
            text,
            graphics: SharedGraphics::new(),
            awareness: AwarenessChannel::new(local, &config.timings),
            editor,
            editor_widget,
            reconciler,
            scene_widget,
            scene_instance: 1,
            local_events,
            stopped: false,
        };
        (session, SessionHandle { tx })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Persistent connection indicator.
    pub fn status(&self) -> ConnectionStatus {
        self.provider.status()
    }

    pub fn text(&self) -> &SharedText {
        &self.text
    }

    pub fn graphics(&self) -> &SharedGraphics {
        &self.graphics
    }

    pub fn awareness(&self) -> &AwarenessChannel {
        &self.awareness
    }

    pub fn reconciler(&self) -> &SceneReconciler {
        &self.reconciler
    }

    pub fn editor(&self) -> &EditorBinding {
        &self.editor
    }

    pub fn editor_widget(&self) -> &T {
        &self.editor_widget
    }

    pub fn editor_widget_mut(&mut self) -> &mut T {
        &mut self.editor_widget
    }

    pub fn scene_widget(&self) -> &S {
        &self.scene_widget
    }

    pub fn scene_widget_mut(&mut self) -> &mut S {
        &mut self.scene_widget
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Process events until shutdown or until the transport goes away.
    pub async fn run(&mut self) {
        while let Some(input) = self.next_input().await {
            self.handle(input).await;
        }
    }

    /// Wait for the next unit of work. Cancel safe; returns `None` once
    /// the session has stopped.
    pub async fn next_input(&mut self) -> Option<SessionInput> {
        if self.stopped {
            return None;
        }
        let deadline = self.next_deadline();
        tokio::select! {
            event = self.text_room.next_event() => event.map(|e| SessionInput::Room(RoomKind::Text, e)),
            event = self.graphics_room.next_event() => event.map(|e| SessionInput::Room(RoomKind::Graphics, e)),
            event = self.local_events.recv() => Some(SessionInput::Local(event.unwrap_or(LocalEvent::Shutdown))),
            _ = tokio::time::sleep_until(deadline) => Some(SessionInput::Timer),
        }
    }

    fn next_deadline(&self) -> Instant {
        let candidates = [self.reconciler.next_deadline(), self.awareness.next_deadline()];
        candidates
            .into_iter()
            .flatten()
            .min()
            .map(Instant::from_std)
            .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP)
    }

    /// Handle one input to completion.
    pub async fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Room(RoomKind::Text, event) => self.on_text_event(event).await,
            SessionInput::Room(RoomKind::Graphics, event) => self.on_graphics_event(event).await,
            SessionInput::Local(event) => self.on_local_event(event).await,
            SessionInput::Timer => self.on_timer().await,
        }
    }

    async fn on_text_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Status(status) => {
                log::debug!("Text room status: {status:?}");
                if status == ConnectionStatus::Disconnected && !self.awareness.clear_peers().is_empty() {
                    self.refresh_decorations();
                }
            }
            RoomEvent::SyncRequested { state_vector } => {
                let answer = self.text.encode_diff(&state_vector).map(|diff| (diff, self.text.state_vector()));
                match answer {
                    Ok((diff, own)) => {
                        log_send_error("text sync", self.text_room.answer_sync(diff, own).await);
                        let hello = self.awareness.announce(std_now());
                        self.send_presence(hello).await;
                    }
                    Err(e) => log::warn!("Cannot answer text sync request: {e}"),
                }
            }
            RoomEvent::RemoteUpdate { from, payload } => match self.text.apply_remote_update(&payload) {
                Ok(Some(change)) => {
                    self.editor.on_document_change(&change, &mut self.editor_widget);
                    self.refresh_decorations();
                }
                Ok(None) => log::trace!("Duplicate text update from {from}"),
                Err(e) => log::warn!("Dropping text update from {from}: {e}"),
            },
            RoomEvent::Synced => log::info!("Code buffer synced ({} bytes)", self.text.len()),
            RoomEvent::RemoteAwareness { from, payload } => match AwarenessMessage::decode(&payload) {
                Ok(msg) => {
                    if !self.awareness.apply_remote(msg, std_now()).is_empty() {
                        self.refresh_decorations();
                    }
                }
                Err(e) => log::warn!("Dropping presence from {from}: {e}"),
            },
            RoomEvent::PeerJoined(info) => log::info!("{} joined", info.display_name),
            RoomEvent::PeerLeft(id) => {
                if !self.awareness.remove_peer(id).is_empty() {
                    self.refresh_decorations();
                }
            }
        }
    }

    async fn on_graphics_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::SyncRequested { state_vector } => match self.graphics.encode_diff(&state_vector) {
                Ok(diff) => {
                    let own = self.graphics.state_vector();
                    log_send_error("graphics sync", self.graphics_room.answer_sync(diff, own).await);
                }
                Err(e) => log::warn!("Cannot answer graphics sync request: {e}"),
            },
            RoomEvent::RemoteUpdate { from, payload } => {
                let outcome = self
                    .reconciler
                    .apply_remote(&mut self.graphics, &payload, &mut self.scene_widget, std_now());
                match outcome {
                    Ok(outcome) => {
                        if let Some(flushed) = outcome.flushed {
                            self.broadcast_graphics(flushed).await;
                        }
                    }
                    Err(e) => log::warn!("Dropping graphics update from {from}: {e}"),
                }
            }
            RoomEvent::Synced => {
                log::info!("Whiteboard synced ({} elements)", self.graphics.map().visible_len());
                self.reconciler.mark_synced();
            }
            RoomEvent::Status(status) => log::debug!("Graphics room status: {status:?}"),
            // Presence travels on the text room.
            RoomEvent::RemoteAwareness { .. } | RoomEvent::PeerJoined(_) | RoomEvent::PeerLeft(_) => {}
        }
    }

    async fn on_local_event(&mut self, event: LocalEvent) {
        match event {
            LocalEvent::TextEdited(edit) => match self.editor.on_local_edit(&mut self.text, &edit) {
                Ok(Some(update)) => {
                    log_send_error("text update", self.text_room.broadcast(update).await);
                    self.refresh_decorations();
                }
                Ok(None) => {}
                Err(e) => log::warn!("Rejected local edit {:?}: {e}", edit.range),
            },
            LocalEvent::CursorMoved(offset) => match self.text.logical_position(offset) {
                Ok(position) => {
                    let fields = PresenceFields {
                        cursor: Some(Some(position)),
                        selection: Some(None),
                        ..PresenceFields::default()
                    };
                    if let Some(msg) = self.awareness.set_local_state(fields, std_now()) {
                        self.send_presence(msg).await;
                    }
                }
                Err(e) => log::debug!("Cursor at {offset} not anchored: {e}"),
            },
            LocalEvent::SelectionChanged(range) => {
                let selection = match range {
                    Some(range) => {
                        let anchor = self.text.logical_position(range.start);
                        let head = self.text.logical_position(range.end);
                        match (anchor, head) {
                            (Ok(anchor), Ok(head)) => Some(LogicalRange::new(anchor, head)),
                            (Err(e), _) | (_, Err(e)) => {
                                log::debug!("Selection {range:?} not anchored: {e}");
                                return;
                            }
                        }
                    }
                    None => None,
                };
                if let Some(msg) = self.awareness.set_local_state(PresenceFields::selection(selection), std_now()) {
                    self.send_presence(msg).await;
                }
            }
            LocalEvent::SceneChanged(elements) => self.reconciler.on_scene_changed(elements, std_now()),
            LocalEvent::SceneRemounted => {
                self.scene_instance += 1;
                log::debug!("Whiteboard remounted as instance {}", self.scene_instance);
                let synced = self.reconciler.session().is_synced;
                self.reconciler.detach();
                self.reconciler.attach(std_now());
                if synced {
                    self.reconciler.mark_synced();
                }
            }
            LocalEvent::Shutdown => self.shutdown().await,
        }
    }

    async fn on_timer(&mut self) {
        let now = std_now();
        match self.reconciler.poll(&mut self.graphics, &mut self.scene_widget, now) {
            Ok(FlushOutcome::Propagated(update)) => self.broadcast_graphics(update).await,
            Ok(outcome) => log::trace!("Scene flush: {outcome:?}"),
            Err(e) => log::warn!("Scene flush failed: {e}"),
        }

        if !self.awareness.expire(now).is_empty() {
            self.refresh_decorations();
        }
        if let Some(msg) = self.awareness.renew(now) {
            self.send_presence(msg).await;
        }
    }

    async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let leave = self.awareness.leave_message();
        self.send_presence(leave).await;
        self.editor.unbind();
        self.reconciler.detach();
        log::info!("Session for client {} stopped", self.client_id);
    }

    async fn broadcast_graphics(&mut self, update: Vec<u8>) {
        log_send_error("graphics update", self.graphics_room.broadcast(update).await);
    }

    async fn send_presence(&mut self, msg: AwarenessMessage) {
        match msg.encode() {
            Ok(bytes) => log_send_error("presence", self.text_room.send_awareness(bytes).await),
            Err(e) => log::warn!("Failed to encode presence: {e}"),
        }
    }

    fn refresh_decorations(&mut self) {
        let states = self.awareness.get_states();
        self.editor
            .on_awareness_change(states.values(), self.client_id, &self.text, &mut self.editor_widget);
    }
}

fn std_now() -> std::time::Instant {
    std::time::Instant::now()
}

fn log_send_error(what: &str, result: Result<(), ProtocolError>) {
    if let Err(e) = result {
        log::warn!("Failed to send {what}: {e}");
    }
}
