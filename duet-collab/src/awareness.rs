//! Ephemeral presence over a room.
//!
//! Each client owns one [`PresenceRecord`] and broadcasts it whenever it
//! changes and again every renew interval. Peers that stay silent past the
//! timeout are dropped, so a crashed client never leaves a stale cursor.
//! Records are never persisted.
//!
//! Cursor and selection are logical positions; resolving them to offsets is
//! left to the decoration projector.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use duet_core::observer::ObserverRegistry;
use duet_core::{ClientId, PresenceFields, PresenceRecord, SubscriptionId, SyncTimings};
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

/// Presence message carried in an `Awareness` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full record of the sender. `clock` grows with every broadcast so
    /// reordered frames cannot roll a record back.
    Update { record: PresenceRecord, clock: u64 },
    /// The sender is going away.
    Leave { client_id: ClientId },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn client_id(&self) -> ClientId {
        match self {
            AwarenessMessage::Update { record, .. } => record.client_id,
            AwarenessMessage::Leave { client_id } => *client_id,
        }
    }
}

/// Which clients were added, updated or removed by one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    fn added(id: ClientId) -> Self {
        Self {
            added: vec![id],
            ..Self::default()
        }
    }

    fn updated(id: ClientId) -> Self {
        Self {
            updated: vec![id],
            ..Self::default()
        }
    }

    fn removed(ids: Vec<ClientId>) -> Self {
        Self {
            removed: ids,
            ..Self::default()
        }
    }
}

struct PeerState {
    record: PresenceRecord,
    clock: u64,
    last_seen: Instant,
}

/// Presence for one room: the local record plus every live peer.
pub struct AwarenessChannel {
    local: PresenceRecord,
    local_clock: u64,
    last_broadcast: Option<Instant>,
    peers: BTreeMap<ClientId, PeerState>,
    /// Highest clock seen per client, kept after removal so a late frame
    /// from before a leave cannot resurrect the peer.
    seen_clocks: BTreeMap<ClientId, u64>,
    timeout: Duration,
    renew: Duration,
    observers: ObserverRegistry<AwarenessChange>,
}

impl AwarenessChannel {
    pub fn new(local: PresenceRecord, timings: &SyncTimings) -> Self {
        Self {
            local,
            local_clock: 0,
            last_broadcast: None,
            peers: BTreeMap::new(),
            seen_clocks: BTreeMap::new(),
            timeout: timings.presence_timeout(),
            renew: timings.presence_renew(),
            observers: ObserverRegistry::new(),
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local.client_id
    }

    pub fn local_state(&self) -> &PresenceRecord {
        &self.local
    }

    /// Merge `fields` into the local record and return the message to
    /// broadcast, or `None` if nothing changed.
    pub fn set_local_state(&mut self, fields: PresenceFields, now: Instant) -> Option<AwarenessMessage> {
        if !fields.apply_to(&mut self.local) {
            return None;
        }
        self.observers.emit(&AwarenessChange::updated(self.local.client_id));
        Some(self.local_message(now))
    }

    /// The local record stamped with a fresh clock. Used for the initial
    /// announcement after a (re)join.
    pub fn announce(&mut self, now: Instant) -> AwarenessMessage {
        self.local_message(now)
    }

    /// Heartbeat: re-broadcast the local record if it has not been sent
    /// within the renew interval.
    pub fn renew(&mut self, now: Instant) -> Option<AwarenessMessage> {
        let due = self
            .last_broadcast
            .is_none_or(|sent| now.duration_since(sent) >= self.renew);
        due.then(|| self.local_message(now))
    }

    fn local_message(&mut self, now: Instant) -> AwarenessMessage {
        self.local_clock += 1;
        self.last_broadcast = Some(now);
        AwarenessMessage::Update {
            record: self.local.clone(),
            clock: self.local_clock,
        }
    }

    /// The departure message for this client.
    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            client_id: self.local.client_id,
        }
    }

    /// Every known record, the local one included, by client id.
    pub fn get_states(&self) -> BTreeMap<ClientId, PresenceRecord> {
        let mut states: BTreeMap<ClientId, PresenceRecord> = self
            .peers
            .iter()
            .map(|(id, peer)| (*id, peer.record.clone()))
            .collect();
        states.insert(self.local.client_id, self.local.clone());
        states
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, client_id: ClientId) -> Option<&PresenceRecord> {
        self.peers.get(&client_id).map(|p| &p.record)
    }

    /// Apply a peer's message. Messages about the local client and stale
    /// clocks are ignored.
    pub fn apply_remote(&mut self, msg: AwarenessMessage, now: Instant) -> AwarenessChange {
        let client_id = msg.client_id();
        if client_id == self.local.client_id {
            return AwarenessChange::default();
        }

        let change = match msg {
            AwarenessMessage::Update { record, clock } => {
                if self.seen_clocks.get(&client_id).is_some_and(|seen| clock <= *seen) {
                    log::trace!("Stale presence from {client_id} (clock {clock})");
                    return AwarenessChange::default();
                }
                self.seen_clocks.insert(client_id, clock);
                match self.peers.get_mut(&client_id) {
                    Some(peer) => {
                        peer.clock = clock;
                        peer.last_seen = now;
                        if peer.record == record {
                            AwarenessChange::default()
                        } else {
                            peer.record = record;
                            AwarenessChange::updated(client_id)
                        }
                    }
                    None => {
                        log::debug!("Presence added for {client_id} ({})", record.display_name);
                        self.peers.insert(
                            client_id,
                            PeerState {
                                record,
                                clock,
                                last_seen: now,
                            },
                        );
                        AwarenessChange::added(client_id)
                    }
                }
            }
            AwarenessMessage::Leave { client_id } => match self.peers.remove(&client_id) {
                Some(_) => AwarenessChange::removed(vec![client_id]),
                None => AwarenessChange::default(),
            },
        };

        if !change.is_empty() {
            self.observers.emit(&change);
        }
        change
    }

    /// Drop a peer the transport reported as gone.
    pub fn remove_peer(&mut self, client_id: ClientId) -> AwarenessChange {
        if self.peers.remove(&client_id).is_none() {
            return AwarenessChange::default();
        }
        let change = AwarenessChange::removed(vec![client_id]);
        self.observers.emit(&change);
        change
    }

    /// Drop every peer silent for longer than the timeout. All expirations
    /// are reported in a single notification.
    pub fn expire(&mut self, now: Instant) -> AwarenessChange {
        let expired: Vec<ClientId> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.duration_since(peer.last_seen) > self.timeout)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return AwarenessChange::default();
        }
        for id in &expired {
            self.peers.remove(id);
            log::debug!("Presence for {id} expired");
        }
        let change = AwarenessChange::removed(expired);
        self.observers.emit(&change);
        change
    }

    /// Forget every peer, e.g. after the connection dropped. Emits one
    /// removal notification.
    pub fn clear_peers(&mut self) -> AwarenessChange {
        if self.peers.is_empty() {
            return AwarenessChange::default();
        }
        let removed: Vec<ClientId> = std::mem::take(&mut self.peers).into_keys().collect();
        let change = AwarenessChange::removed(removed);
        self.observers.emit(&change);
        change
    }

    /// Earliest instant at which a peer can expire or a heartbeat is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        let expiry = self
            .peers
            .values()
            .map(|peer| peer.last_seen + self.timeout)
            .min()
            .map(|at| at + Duration::from_millis(1));
        let renew = self.last_broadcast.map(|sent| sent + self.renew);
        match (expiry, renew) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn observe(&mut self, callback: impl Fn(&AwarenessChange) + 'static) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }
}

impl std::fmt::Debug for AwarenessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwarenessChannel")
            .field("local", &self.local.client_id)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::LogicalPosition;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn channel(id: ClientId) -> AwarenessChannel {
        AwarenessChannel::new(PresenceRecord::new(id, format!("user-{id}")), &SyncTimings::default())
    }

    fn update(id: ClientId, clock: u64) -> AwarenessMessage {
        AwarenessMessage::Update {
            record: PresenceRecord::new(id, format!("user-{id}")),
            clock,
        }
    }

    #[test]
    fn test_set_local_state_broadcasts_only_changes() {
        let now = Instant::now();
        let mut ch = channel(1);
        let cursor = LogicalPosition::from_bytes(vec![9, 9]);

        let msg = ch.set_local_state(PresenceFields::cursor(cursor.clone()), now).unwrap();
        match msg {
            AwarenessMessage::Update { record, clock } => {
                assert_eq!(record.cursor, Some(cursor.clone()));
                assert_eq!(clock, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ch.set_local_state(PresenceFields::cursor(cursor), now).is_none());
    }

    #[test]
    fn test_get_states_includes_local_and_peers() {
        let now = Instant::now();
        let mut ch = channel(1);
        let change = ch.apply_remote(update(2, 1), now);
        assert_eq!(change.added, vec![2]);

        let states = ch.get_states();
        assert_eq!(states.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_own_echo_and_stale_clock_ignored() {
        let now = Instant::now();
        let mut ch = channel(1);
        assert!(ch.apply_remote(update(1, 5), now).is_empty());

        ch.apply_remote(update(2, 3), now);
        let mut renamed = PresenceRecord::new(2, "renamed");
        renamed.color = "#000000".into();
        let stale = AwarenessMessage::Update {
            record: renamed,
            clock: 2,
        };
        assert!(ch.apply_remote(stale, now).is_empty());
        assert_eq!(ch.peer(2).unwrap().display_name, "user-2");
    }

    #[test]
    fn test_late_frame_cannot_resurrect_departed_peer() {
        let now = Instant::now();
        let mut ch = channel(1);
        ch.apply_remote(update(2, 4), now);
        ch.apply_remote(AwarenessMessage::Leave { client_id: 2 }, now);
        assert!(ch.apply_remote(update(2, 3), now).is_empty());
        assert_eq!(ch.peer_count(), 0);
    }

    #[test]
    fn test_expiry_emits_exactly_one_notification() {
        let t0 = Instant::now();
        let mut ch = channel(1);
        let notifications = Rc::new(RefCell::new(Vec::new()));
        let sink = notifications.clone();
        ch.observe(move |change| sink.borrow_mut().push(change.clone()));

        ch.apply_remote(update(2, 1), t0);
        notifications.borrow_mut().clear();

        assert!(ch.expire(t0 + Duration::from_secs(29)).is_empty());
        let change = ch.expire(t0 + Duration::from_secs(31));
        assert_eq!(change.removed, vec![2]);
        assert!(ch.expire(t0 + Duration::from_secs(60)).is_empty());

        assert_eq!(notifications.borrow().len(), 1);
        assert!(!ch.get_states().contains_key(&2));
    }

    #[test]
    fn test_heartbeat_keeps_peer_alive() {
        let t0 = Instant::now();
        let mut ch = channel(1);
        ch.apply_remote(update(2, 1), t0);
        ch.apply_remote(update(2, 2), t0 + Duration::from_secs(20));
        assert!(ch.expire(t0 + Duration::from_secs(40)).is_empty());
        assert_eq!(ch.peer_count(), 1);
    }

    #[test]
    fn test_renew_interval() {
        let t0 = Instant::now();
        let mut ch = channel(1);
        assert!(ch.renew(t0).is_some());
        assert!(ch.renew(t0 + Duration::from_secs(5)).is_none());
        assert!(ch.renew(t0 + Duration::from_secs(15)).is_some());
    }

    #[test]
    fn test_next_deadline_tracks_expiry() {
        let t0 = Instant::now();
        let mut ch = channel(1);
        assert!(ch.next_deadline().is_none());
        ch.apply_remote(update(2, 1), t0);
        let deadline = ch.next_deadline().unwrap();
        assert!(deadline > t0 + Duration::from_secs(30));
        assert!(ch.expire(deadline).removed == vec![2]);
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = update(7, 3);
        assert_eq!(AwarenessMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }
}
