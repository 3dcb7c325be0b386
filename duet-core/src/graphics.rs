//! Last-writer-wins map of whiteboard elements.
//!
//! Each key holds either a record or a tombstone, together with a [`Stamp`].
//! Merging keeps the entry with the highest stamp; equal stamps fall back to
//! a fixed ordering (tombstone, then deleted record, then live record, then
//! encoded content) so every replica converges regardless of delivery order
//! or duplication.
//!
//! Updates are bincode-encoded batches of [`MapOp`]. The map exchanges full
//! state during sync: its state vector is empty and a diff is the whole map.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::element::{ElementId, ElementRecord};
use crate::error::{CollabError, CollabResult};
use crate::observer::{ChangeOrigin, ObserverRegistry, SubscriptionId};
use crate::replica::Replica;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub version: u64,
    pub version_nonce: u32,
}

impl Stamp {
    pub fn of(record: &ElementRecord) -> Self {
        Self {
            version: record.version,
            version_nonce: record.version_nonce,
        }
    }
}

/// Set one key to a record, or to a tombstone when `value` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapOp {
    pub id: ElementId,
    pub stamp: Stamp,
    pub value: Option<ElementRecord>,
}

impl MapOp {
    pub fn put(record: ElementRecord) -> Self {
        Self {
            id: record.id.clone(),
            stamp: Stamp::of(&record),
            value: Some(record),
        }
    }

    pub fn remove(id: impl Into<ElementId>, stamp: Stamp) -> Self {
        Self {
            id: id.into(),
            stamp,
            value: None,
        }
    }

    pub fn encode_batch(ops: &[MapOp]) -> CollabResult<Vec<u8>> {
        bincode::serde::encode_to_vec(ops, bincode::config::standard())
            .map_err(|e| CollabError::Serialization(e.to_string()))
    }

    /// Decode and validate a batch. Nothing is applied if any op is invalid.
    pub fn decode_batch(bytes: &[u8]) -> CollabResult<Vec<MapOp>> {
        let (ops, _): (Vec<MapOp>, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CollabError::MalformedUpdate(e.to_string()))?;

        for op in &ops {
            if let Some(record) = &op.value {
                if record.id != op.id || Stamp::of(record) != op.stamp {
                    return Err(CollabError::MalformedUpdate(format!(
                        "element op for {} carries inconsistent record",
                        op.id
                    )));
                }
            }
        }
        Ok(ops)
    }

    fn rank(&self) -> u8 {
        match &self.value {
            Some(record) if !record.is_deleted => 0,
            Some(_) => 1,
            None => 2,
        }
    }

    fn content_bytes(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(&self.value, bincode::config::standard()).unwrap_or_default()
    }

    /// Total order used to pick a winner between two writes of one key.
    fn precedence(&self, other: &MapOp) -> Ordering {
        self.stamp
            .cmp(&other.stamp)
            .then_with(|| self.rank().cmp(&other.rank()))
            .then_with(|| self.content_bytes().cmp(&other.content_bytes()))
    }
}

/// The replicated element map without change notification.
#[derive(Debug, Clone, Default)]
pub struct ElementMap {
    entries: BTreeMap<ElementId, MapOp>,
}

impl ElementMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Present (not tombstoned) record for `id`, deleted or not.
    pub fn get(&self, id: &str) -> Option<&ElementRecord> {
        self.entries.get(id).and_then(|entry| entry.value.as_ref())
    }

    pub fn records(&self) -> impl Iterator<Item = &ElementRecord> {
        self.entries.values().filter_map(|entry| entry.value.as_ref())
    }

    /// All present records in id order.
    pub fn snapshot(&self) -> Vec<ElementRecord> {
        self.records().cloned().collect()
    }

    /// Number of present records.
    pub fn len(&self) -> usize {
        self.records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of present records not marked deleted.
    pub fn visible_len(&self) -> usize {
        self.records().filter(|r| !r.is_deleted).count()
    }

    /// Merge a single op. Returns `true` if the entry changed.
    pub fn merge(&mut self, op: MapOp) -> bool {
        match self.entries.get(&op.id) {
            Some(current) if op.precedence(current) != Ordering::Greater => false,
            _ => {
                self.entries.insert(op.id.clone(), op);
                true
            }
        }
    }

    /// Merge a batch, returning the ids whose entries changed.
    pub fn apply_ops(&mut self, ops: Vec<MapOp>) -> Vec<ElementId> {
        let mut changed = Vec::new();
        for op in ops {
            let id = op.id.clone();
            if self.merge(op) && !changed.contains(&id) {
                changed.push(id);
            }
        }
        changed
    }

    /// Tombstone for `id` that supersedes its current record.
    ///
    /// At `u64::MAX` the stamp saturates; the tombstone then wins on rank.
    pub fn removal_for(&self, id: &str) -> Option<MapOp> {
        self.get(id).map(|record| {
            MapOp::remove(
                id,
                Stamp {
                    version: record.version.saturating_add(1),
                    version_nonce: record.version_nonce,
                },
            )
        })
    }

    pub fn encode_state(&self) -> CollabResult<Vec<u8>> {
        let ops: Vec<MapOp> = self.entries.values().cloned().collect();
        MapOp::encode_batch(&ops)
    }
}

impl Replica for ElementMap {
    fn state_vector(&self) -> Vec<u8> {
        Vec::new()
    }

    fn encode_diff(&self, _remote_state_vector: &[u8]) -> CollabResult<Vec<u8>> {
        self.encode_state()
    }

    fn merge_update(&mut self, update: &[u8]) -> CollabResult<bool> {
        let ops = MapOp::decode_batch(update)?;
        Ok(!self.apply_ops(ops).is_empty())
    }
}

/// Change notification delivered to [`SharedGraphics`] observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapChange {
    pub origin: ChangeOrigin,
    pub changed: Vec<ElementId>,
}

/// A batch of local writes, committed as one update.
pub struct LocalTransaction<'a> {
    map: &'a mut ElementMap,
    ops: Vec<MapOp>,
}

impl LocalTransaction<'_> {
    /// Write a record. Returns `false` if the map already holds a newer or
    /// identical entry.
    pub fn put(&mut self, record: ElementRecord) -> bool {
        let op = MapOp::put(record);
        if self.map.merge(op.clone()) {
            self.ops.push(op);
            true
        } else {
            false
        }
    }

    /// Tombstone a key. Returns `false` if nothing was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(op) = self.map.removal_for(id) else {
            return false;
        };
        if self.map.merge(op.clone()) {
            self.ops.push(op);
            true
        } else {
            false
        }
    }

    pub fn map(&self) -> &ElementMap {
        self.map
    }
}

/// The client-side shared element map with origin-tagged notifications.
pub struct SharedGraphics {
    map: ElementMap,
    observers: ObserverRegistry<MapChange>,
}

impl SharedGraphics {
    pub fn new() -> Self {
        Self {
            map: ElementMap::new(),
            observers: ObserverRegistry::new(),
        }
    }

    pub fn map(&self) -> &ElementMap {
        &self.map
    }

    pub fn get(&self, id: &str) -> Option<&ElementRecord> {
        self.map.get(id)
    }

    pub fn snapshot(&self) -> Vec<ElementRecord> {
        self.map.snapshot()
    }

    /// Run a batch of local writes. Observers see one change for the whole
    /// batch; the returned update is `None` when nothing changed.
    pub fn transact_local<F>(&mut self, f: F) -> CollabResult<Option<Vec<u8>>>
    where
        F: FnOnce(&mut LocalTransaction<'_>),
    {
        let mut txn = LocalTransaction {
            map: &mut self.map,
            ops: Vec::new(),
        };
        f(&mut txn);
        let ops = txn.ops;
        if ops.is_empty() {
            return Ok(None);
        }

        let update = MapOp::encode_batch(&ops)?;
        let mut changed: Vec<ElementId> = Vec::with_capacity(ops.len());
        for op in ops {
            if !changed.contains(&op.id) {
                changed.push(op.id);
            }
        }
        self.observers.emit(&MapChange {
            origin: ChangeOrigin::Local,
            changed,
        });
        Ok(Some(update))
    }

    /// Merge a peer's update. Returns `None` for duplicates.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> CollabResult<Option<MapChange>> {
        let ops = MapOp::decode_batch(update)?;
        Ok(self.apply_remote_ops(ops))
    }

    /// Merge already-validated ops from a peer.
    pub fn apply_remote_ops(&mut self, ops: Vec<MapOp>) -> Option<MapChange> {
        let changed = self.map.apply_ops(ops);
        if changed.is_empty() {
            return None;
        }
        let change = MapChange {
            origin: ChangeOrigin::Remote,
            changed,
        };
        self.observers.emit(&change);
        Some(change)
    }

    pub fn observe(&mut self, callback: impl Fn(&MapChange) + 'static) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn encode_state(&self) -> CollabResult<Vec<u8>> {
        self.map.encode_state()
    }
}

impl Default for SharedGraphics {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for SharedGraphics {
    fn state_vector(&self) -> Vec<u8> {
        self.map.state_vector()
    }

    fn encode_diff(&self, remote_state_vector: &[u8]) -> CollabResult<Vec<u8>> {
        self.map.encode_diff(remote_state_vector)
    }

    fn merge_update(&mut self, update: &[u8]) -> CollabResult<bool> {
        Ok(self.apply_remote_update(update)?.is_some())
    }
}

impl std::fmt::Debug for SharedGraphics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedGraphics")
            .field("elements", &self.map.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Bounds, ElementKind};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn rect(id: &str, version: u64, nonce: u32) -> ElementRecord {
        let mut r = ElementRecord::new(id, ElementKind::Rectangle, Bounds::new(0.0, 0.0, 10.0, 10.0));
        r.version = version;
        r.version_nonce = nonce;
        r
    }

    #[test]
    fn test_higher_version_wins() {
        let mut map = ElementMap::new();
        assert!(map.merge(MapOp::put(rect("a", 2, 0))));
        assert!(!map.merge(MapOp::put(rect("a", 1, 500))));
        assert!(map.merge(MapOp::put(rect("a", 3, 0))));
        assert_eq!(map.get("a").unwrap().version, 3);
    }

    #[test]
    fn test_nonce_breaks_version_ties() {
        let mut left = ElementMap::new();
        let mut right = ElementMap::new();
        let low = rect("a", 5, 10);
        let high = rect("a", 5, 20);

        left.merge(MapOp::put(low.clone()));
        left.merge(MapOp::put(high.clone()));
        right.merge(MapOp::put(high));
        right.merge(MapOp::put(low));

        assert_eq!(left.get("a").unwrap().version_nonce, 20);
        assert_eq!(right.get("a").unwrap().version_nonce, 20);
    }

    #[test]
    fn test_equal_stamp_prefers_deleted_then_content() {
        let live = rect("a", 4, 1);
        let mut deleted = live.clone();
        deleted.is_deleted = true;

        let mut map = ElementMap::new();
        map.merge(MapOp::put(deleted.clone()));
        assert!(!map.merge(MapOp::put(live.clone())));
        assert!(map.get("a").unwrap().is_deleted);

        let mut moved = live.clone();
        moved.bounds.x = 50.0;
        let mut m1 = ElementMap::new();
        let mut m2 = ElementMap::new();
        m1.merge(MapOp::put(live.clone()));
        m1.merge(MapOp::put(moved.clone()));
        m2.merge(MapOp::put(moved));
        m2.merge(MapOp::put(live));
        assert_eq!(m1.get("a"), m2.get("a"));
    }

    #[test]
    fn test_tombstone_supersedes_record() {
        let mut map = ElementMap::new();
        map.merge(MapOp::put(rect("a", 3, 9)));
        let removal = map.removal_for("a").unwrap();
        assert_eq!(removal.stamp.version, 4);

        assert!(map.merge(removal.clone()));
        assert!(map.get("a").is_none());
        assert!(!map.merge(MapOp::put(rect("a", 3, 9))));
        assert!(!map.merge(removal));
        // A later edit resurrects the key.
        assert!(map.merge(MapOp::put(rect("a", 5, 0))));
        assert!(map.get("a").is_some());
    }

    #[test]
    fn test_tombstone_supersedes_record_at_max_version() {
        let mut graphics = SharedGraphics::new();
        let remote = MapOp::encode_batch(&[MapOp::put(rect("a", u64::MAX, 7))]).unwrap();
        graphics.apply_remote_update(&remote).unwrap();

        let update = graphics
            .transact_local(|tx| {
                assert!(tx.remove("a"));
            })
            .unwrap()
            .unwrap();
        assert!(graphics.get("a").is_none());

        let ops = MapOp::decode_batch(&update).unwrap();
        assert_eq!(ops[0].stamp.version, u64::MAX);
        assert!(ops[0].value.is_none());

        // Peers holding the record converge on the deletion too.
        let mut peer = ElementMap::new();
        peer.merge(MapOp::put(rect("a", u64::MAX, 7)));
        peer.apply_ops(ops);
        assert!(peer.get("a").is_none());
    }

    #[test]
    fn test_transaction_emits_single_change() {
        let mut graphics = SharedGraphics::new();
        let seen: Rc<RefCell<Vec<MapChange>>> = Rc::default();
        let sink = seen.clone();
        graphics.observe(move |c| sink.borrow_mut().push(c.clone()));

        let update = graphics
            .transact_local(|tx| {
                tx.put(rect("a", 1, 0));
                tx.put(rect("b", 1, 0));
                tx.put(rect("a", 2, 0));
            })
            .unwrap();

        assert!(update.is_some());
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, ChangeOrigin::Local);
        assert_eq!(seen[0].changed, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_noop_transaction_returns_none() {
        let mut graphics = SharedGraphics::new();
        graphics.transact_local(|tx| {
            tx.put(rect("a", 1, 0));
        })
        .unwrap();
        let update = graphics
            .transact_local(|tx| {
                tx.put(rect("a", 1, 0));
                tx.remove("missing");
            })
            .unwrap();
        assert!(update.is_none());
    }

    #[test]
    fn test_remote_update_and_duplicate() {
        let mut a = SharedGraphics::new();
        let mut b = SharedGraphics::new();
        let update = a
            .transact_local(|tx| {
                tx.put(rect("a", 1, 0));
            })
            .unwrap()
            .unwrap();

        let change = b.apply_remote_update(&update).unwrap().unwrap();
        assert_eq!(change.origin, ChangeOrigin::Remote);
        assert!(b.apply_remote_update(&update).unwrap().is_none());
        assert_eq!(b.snapshot(), a.snapshot());
    }

    #[test]
    fn test_malformed_update_rejected() {
        let mut graphics = SharedGraphics::new();
        assert!(matches!(
            graphics.apply_remote_update(&[0xFF, 0xFF, 0xFF]),
            Err(CollabError::MalformedUpdate(_))
        ));

        let mut bad = MapOp::put(rect("a", 1, 0));
        bad.id = "other".into();
        let bytes = MapOp::encode_batch(&[MapOp::put(rect("ok", 1, 0)), bad]).unwrap();
        assert!(graphics.apply_remote_update(&bytes).is_err());
        assert!(graphics.map().is_empty());
    }

    #[test]
    fn test_full_state_diff_sync() {
        let mut a = SharedGraphics::new();
        let mut b = SharedGraphics::new();
        a.transact_local(|tx| {
            tx.put(rect("a", 1, 0));
            tx.put(rect("gone", 1, 0));
            tx.remove("gone");
        })
        .unwrap();
        b.transact_local(|tx| {
            tx.put(rect("gone", 1, 0));
            tx.put(rect("b", 1, 0));
        })
        .unwrap();

        let for_b = a.encode_diff(&b.state_vector()).unwrap();
        let for_a = b.encode_diff(&a.state_vector()).unwrap();
        b.merge_update(&for_b).unwrap();
        a.merge_update(&for_a).unwrap();

        assert_eq!(a.snapshot(), b.snapshot());
        assert!(a.get("gone").is_none());
        assert_eq!(a.map().len(), 2);
    }

    #[test]
    fn test_visible_len_ignores_deleted() {
        let mut map = ElementMap::new();
        let mut d = rect("d", 2, 0);
        d.is_deleted = true;
        map.merge(MapOp::put(rect("a", 1, 0)));
        map.merge(MapOp::put(d));
        assert_eq!(map.len(), 2);
        assert_eq!(map.visible_len(), 1);
    }
}
