//! Reconciles the shared element map with a retained-mode whiteboard.
//!
//! The widget only knows "replace the whole scene" and "the scene changed,
//! here is every element". The reconciler turns that into map writes and
//! back, without oscillating and without wiping peer content while a new
//! client is still loading.
//!
//! ```text
//!            attach                first snapshot / grace timeout
//!  Unbound ─────────► AwaitingInitialSnapshot ─────────────────► Bound
//!     ▲                                                            │
//!     └──────────────────────────── detach ◄───────────────────────┘
//! ```
//!
//! Outbound flushes run after a trailing debounce and pass four guards in
//! this order: echo, readiness, anti-wipe, diff/apply.
//!
//! Time is passed in by the caller, so every transition is deterministic
//! under test.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::config::SyncTimings;
use crate::element::{ElementId, ElementRecord, Revision};
use crate::error::CollabResult;
use crate::graphics::{MapOp, SharedGraphics};

use super::WidgetError;

/// The whiteboard as seen by the reconciler.
pub trait SceneWidget {
    fn replace_scene(&mut self, elements: &[ElementRecord]) -> Result<(), WidgetError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Unbound,
    AwaitingInitialSnapshot { attached_at: Instant },
    Bound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSession {
    pub is_synced: bool,
    pub last_remote_update_at: Option<Instant>,
    pub has_loaded_initial_snapshot: bool,
    pub entered_bound_at: Option<Instant>,
}

/// Result of one outbound flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was due.
    Idle,
    EchoSuppressed,
    NotReady,
    /// An empty scene was replaced by the map's contents.
    WipePrevented,
    /// The scene already matches the map.
    Unchanged,
    /// The update to broadcast.
    Propagated(Vec<u8>),
}

/// Result of merging a remote graphics update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutcome {
    /// Pending local edits flushed ahead of the merge, if any.
    pub flushed: Option<Vec<u8>>,
    /// Whether the map changed and the widget was reloaded.
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub flushes_propagated: u64,
    pub echoes_suppressed: u64,
    pub readiness_skips: u64,
    pub wipes_prevented: u64,
    pub snapshots_applied: u64,
    pub widget_errors: u64,
}

struct PendingScene {
    elements: Vec<ElementRecord>,
    due: Instant,
}

pub struct SceneReconciler {
    timings: SyncTimings,
    state: ReconcilerState,
    session: SyncSession,
    pending: Option<PendingScene>,
    /// Revisions last pushed into the widget, keyed by id.
    last_applied: HashMap<ElementId, Revision>,
    stats: ReconcilerStats,
}

impl SceneReconciler {
    pub fn new(timings: SyncTimings) -> Self {
        Self {
            timings,
            state: ReconcilerState::Unbound,
            session: SyncSession::default(),
            pending: None,
            last_applied: HashMap::new(),
            stats: ReconcilerStats::default(),
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn session(&self) -> SyncSession {
        self.session
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// A widget instance mounted. Re-attaching while attached is a no-op.
    pub fn attach(&mut self, now: Instant) {
        if self.state == ReconcilerState::Unbound {
            log::debug!("Scene widget attached; awaiting initial snapshot");
            self.state = ReconcilerState::AwaitingInitialSnapshot { attached_at: now };
        }
    }

    /// The widget unmounted. Pending local edits are discarded.
    pub fn detach(&mut self) {
        if self.pending.take().is_some() {
            log::debug!("Discarding pending scene on detach");
        }
        self.state = ReconcilerState::Unbound;
        self.last_applied.clear();
        self.session.has_loaded_initial_snapshot = false;
        self.session.entered_bound_at = None;
        self.session.last_remote_update_at = None;
    }

    /// The graphics room finished its initial sync. Stays set across
    /// reconnects so offline edits keep flowing into the map.
    pub fn mark_synced(&mut self) {
        self.session.is_synced = true;
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let grace = match self.state {
            ReconcilerState::AwaitingInitialSnapshot { attached_at } => Some(attached_at + self.timings.sync_grace()),
            _ => None,
        };
        let flush = self.pending.as_ref().map(|p| p.due);
        match (grace, flush) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The widget reported its full element list.
    pub fn on_scene_changed(&mut self, elements: Vec<ElementRecord>, now: Instant) {
        if self.state == ReconcilerState::Unbound {
            return;
        }
        if self.within_echo_window(now) {
            self.stats.echoes_suppressed += 1;
            log::debug!("Scene change inside echo window; treating as re-render");
            return;
        }
        if self.pending.is_none() && self.matches_last_applied(&elements) {
            self.stats.echoes_suppressed += 1;
            log::debug!("Scene change identical to last applied snapshot");
            return;
        }
        let due = now + self.timings.debounce();
        self.pending = Some(PendingScene { elements, due });
    }

    /// Drive timers: the initial-snapshot grace window and debounced flushes.
    pub fn poll<W: SceneWidget>(
        &mut self,
        graphics: &mut SharedGraphics,
        widget: &mut W,
        now: Instant,
    ) -> CollabResult<FlushOutcome> {
        if let ReconcilerState::AwaitingInitialSnapshot { attached_at } = self.state {
            if now >= attached_at + self.timings.sync_grace() {
                log::debug!("Initial snapshot grace expired; binding with current map");
                self.load_snapshot(graphics, widget, now);
            }
        }

        match &self.pending {
            Some(pending) if pending.due <= now => {}
            _ => return Ok(FlushOutcome::Idle),
        }
        match self.pending.take() {
            Some(pending) => self.flush(graphics, widget, pending.elements, now),
            None => Ok(FlushOutcome::Idle),
        }
    }

    /// Merge a remote graphics update and reload the widget if it changed
    /// the map. Pending local edits are flushed first so they are not lost
    /// to the reload.
    pub fn apply_remote<W: SceneWidget>(
        &mut self,
        graphics: &mut SharedGraphics,
        update: &[u8],
        widget: &mut W,
        now: Instant,
    ) -> CollabResult<RemoteOutcome> {
        let ops = MapOp::decode_batch(update)?;

        let mut outcome = RemoteOutcome::default();
        if let Some(pending) = self.pending.take() {
            if let FlushOutcome::Propagated(bytes) = self.flush(graphics, widget, pending.elements, now)? {
                outcome.flushed = Some(bytes);
            }
        }

        if graphics.apply_remote_ops(ops).is_some() {
            outcome.applied = true;
            if self.state != ReconcilerState::Unbound {
                self.load_snapshot(graphics, widget, now);
            }
        }
        Ok(outcome)
    }

    fn flush<W: SceneWidget>(
        &mut self,
        graphics: &mut SharedGraphics,
        widget: &mut W,
        elements: Vec<ElementRecord>,
        now: Instant,
    ) -> CollabResult<FlushOutcome> {
        // 1. echo
        if self.within_echo_window(now) {
            self.stats.echoes_suppressed += 1;
            log::debug!("Flush skipped: remote update applied {:?} ago", self.since_remote(now));
            return Ok(FlushOutcome::EchoSuppressed);
        }

        // 2. readiness
        if self.state != ReconcilerState::Bound || !self.session.is_synced {
            self.stats.readiness_skips += 1;
            log::debug!(
                "Flush skipped: state {:?}, synced {}",
                self.state,
                self.session.is_synced
            );
            return Ok(FlushOutcome::NotReady);
        }

        // 3. anti-wipe
        let recently_bound = self
            .session
            .entered_bound_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.timings.anti_wipe_window());
        if elements.is_empty() && graphics.map().visible_len() > 0 && recently_bound {
            self.stats.wipes_prevented += 1;
            log::debug!(
                "Empty scene right after binding with {} elements in the map; reloading",
                graphics.map().visible_len()
            );
            self.push_to_widget(graphics, widget, now);
            return Ok(FlushOutcome::WipePrevented);
        }

        // 4. diff and apply
        let scene_ids: HashSet<&str> = elements.iter().map(|e| e.id.as_str()).collect();
        let stale: Vec<ElementId> = if elements.is_empty() {
            Vec::new()
        } else {
            graphics
                .map()
                .records()
                .filter(|r| !scene_ids.contains(r.id.as_str()))
                .map(|r| r.id.clone())
                .collect()
        };

        let update = graphics.transact_local(|tx| {
            for element in &elements {
                let differs = tx
                    .map()
                    .get(&element.id)
                    .is_none_or(|current| current.revision() != element.revision());
                if differs {
                    tx.put(element.clone());
                }
            }
            for id in &stale {
                tx.remove(id);
            }
        })?;

        self.last_applied = elements.iter().map(|e| (e.id.clone(), e.revision())).collect();
        match update {
            Some(bytes) => {
                self.stats.flushes_propagated += 1;
                Ok(FlushOutcome::Propagated(bytes))
            }
            None => Ok(FlushOutcome::Unchanged),
        }
    }

    fn load_snapshot<W: SceneWidget>(&mut self, graphics: &SharedGraphics, widget: &mut W, now: Instant) {
        self.push_to_widget(graphics, widget, now);
        self.stats.snapshots_applied += 1;
        if self.state != ReconcilerState::Bound {
            log::debug!("Scene reconciler bound");
            self.state = ReconcilerState::Bound;
            self.session.has_loaded_initial_snapshot = true;
            self.session.entered_bound_at = Some(now);
        }
    }

    fn push_to_widget<W: SceneWidget>(&mut self, graphics: &SharedGraphics, widget: &mut W, now: Instant) {
        let snapshot = graphics.snapshot();
        self.session.last_remote_update_at = Some(now);
        match widget.replace_scene(&snapshot) {
            Ok(()) => {
                self.last_applied = snapshot.iter().map(|e| (e.id.clone(), e.revision())).collect();
            }
            Err(e) => {
                self.stats.widget_errors += 1;
                log::warn!("Scene widget rejected replace of {} elements: {e}", snapshot.len());
            }
        }
    }

    fn within_echo_window(&self, now: Instant) -> bool {
        self.session
            .last_remote_update_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.timings.echo_suppression())
    }

    fn since_remote(&self, now: Instant) -> Option<std::time::Duration> {
        self.session
            .last_remote_update_at
            .map(|at| now.saturating_duration_since(at))
    }

    fn matches_last_applied(&self, elements: &[ElementRecord]) -> bool {
        self.session.has_loaded_initial_snapshot
            && elements.len() == self.last_applied.len()
            && elements
                .iter()
                .all(|e| self.last_applied.get(&e.id) == Some(&e.revision()))
    }
}

impl std::fmt::Debug for SceneReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneReconciler")
            .field("state", &self.state)
            .field("session", &self.session)
            .field("pending", &self.pending.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Bounds, ElementKind};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeBoard {
        scene: Vec<ElementRecord>,
        replaces: usize,
    }

    impl SceneWidget for FakeBoard {
        fn replace_scene(&mut self, elements: &[ElementRecord]) -> Result<(), WidgetError> {
            self.scene = elements.to_vec();
            self.replaces += 1;
            Ok(())
        }
    }

    fn shape(id: &str, version: u64) -> ElementRecord {
        let mut e = ElementRecord::new(id, ElementKind::Ellipse, Bounds::new(1.0, 2.0, 3.0, 4.0));
        e.version = version;
        e
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn bound_reconciler(
        graphics: &mut SharedGraphics,
        board: &mut FakeBoard,
        t0: Instant,
    ) -> SceneReconciler {
        let mut r = SceneReconciler::new(SyncTimings::default());
        r.attach(t0);
        r.mark_synced();
        r.poll(graphics, board, t0 + ms(1500)).unwrap();
        assert_eq!(r.state(), ReconcilerState::Bound);
        r
    }

    #[test]
    fn test_attach_then_grace_timeout_binds() {
        let mut graphics = SharedGraphics::new();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = SceneReconciler::new(SyncTimings::default());
        assert_eq!(r.state(), ReconcilerState::Unbound);

        r.attach(t0);
        assert_eq!(r.next_deadline(), Some(t0 + ms(1500)));
        r.poll(&mut graphics, &mut board, t0 + ms(1000)).unwrap();
        assert!(matches!(r.state(), ReconcilerState::AwaitingInitialSnapshot { .. }));

        r.poll(&mut graphics, &mut board, t0 + ms(1500)).unwrap();
        assert_eq!(r.state(), ReconcilerState::Bound);
        assert!(r.session().has_loaded_initial_snapshot);
        assert_eq!(r.session().entered_bound_at, Some(t0 + ms(1500)));
    }

    #[test]
    fn test_remote_snapshot_binds_early() {
        let mut peer = SharedGraphics::new();
        let update = peer
            .transact_local(|tx| {
                tx.put(shape("a", 1));
            })
            .unwrap()
            .unwrap();

        let mut graphics = SharedGraphics::new();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = SceneReconciler::new(SyncTimings::default());
        r.attach(t0);

        let outcome = r.apply_remote(&mut graphics, &update, &mut board, t0 + ms(50)).unwrap();
        assert!(outcome.applied);
        assert_eq!(r.state(), ReconcilerState::Bound);
        assert_eq!(board.scene.len(), 1);
    }

    #[test]
    fn test_local_edit_propagates_after_debounce() {
        let mut graphics = SharedGraphics::new();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = bound_reconciler(&mut graphics, &mut board, t0);

        let t1 = t0 + ms(5000);
        r.on_scene_changed(vec![shape("a", 1)], t1);
        assert_eq!(r.next_deadline(), Some(t1 + ms(100)));
        assert_eq!(r.poll(&mut graphics, &mut board, t1 + ms(50)).unwrap(), FlushOutcome::Idle);

        let out = r.poll(&mut graphics, &mut board, t1 + ms(100)).unwrap();
        assert!(matches!(out, FlushOutcome::Propagated(_)));
        assert!(graphics.get("a").is_some());
    }

    #[test]
    fn test_echo_guard_blocks_rerender() {
        let mut peer = SharedGraphics::new();
        let update = peer
            .transact_local(|tx| {
                tx.put(shape("a", 1));
            })
            .unwrap()
            .unwrap();

        let mut graphics = SharedGraphics::new();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = bound_reconciler(&mut graphics, &mut board, t0);

        let t1 = t0 + ms(5000);
        r.apply_remote(&mut graphics, &update, &mut board, t1).unwrap();
        // Widget re-render shortly after the replace.
        r.on_scene_changed(board.scene.clone(), t1 + ms(10));
        assert!(!r.has_pending());
        assert_eq!(r.stats().echoes_suppressed, 1);
    }

    #[test]
    fn test_identical_scene_is_not_an_edit() {
        let mut graphics = SharedGraphics::new();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = bound_reconciler(&mut graphics, &mut board, t0);

        r.on_scene_changed(board.scene.clone(), t0 + ms(9000));
        assert!(!r.has_pending());
    }

    #[test]
    fn test_readiness_guard_until_synced() {
        let mut graphics = SharedGraphics::new();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = SceneReconciler::new(SyncTimings::default());
        r.attach(t0);
        r.poll(&mut graphics, &mut board, t0 + ms(1500)).unwrap();

        r.on_scene_changed(vec![shape("a", 1)], t0 + ms(5000));
        let out = r.poll(&mut graphics, &mut board, t0 + ms(5100)).unwrap();
        assert_eq!(out, FlushOutcome::NotReady);
        assert!(graphics.map().is_empty());
        assert_eq!(r.stats().readiness_skips, 1);
    }

    #[test]
    fn test_diff_skips_unchanged_and_removes_absent() {
        let mut graphics = SharedGraphics::new();
        graphics
            .transact_local(|tx| {
                tx.put(shape("keep", 1));
                tx.put(shape("drop", 1));
            })
            .unwrap();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = bound_reconciler(&mut graphics, &mut board, t0);

        let t1 = t0 + ms(5000);
        r.on_scene_changed(vec![shape("keep", 1), shape("new", 1)], t1);
        let out = r.poll(&mut graphics, &mut board, t1 + ms(100)).unwrap();

        let FlushOutcome::Propagated(bytes) = out else {
            panic!("expected propagation, got {out:?}");
        };
        let ops = MapOp::decode_batch(&bytes).unwrap();
        let ids: Vec<&str> = ops.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "drop"]);
        assert!(graphics.get("drop").is_none());
        assert!(graphics.get("keep").is_some());
    }

    #[test]
    fn test_empty_scene_after_window_removes_nothing() {
        let mut graphics = SharedGraphics::new();
        graphics
            .transact_local(|tx| {
                tx.put(shape("a", 1));
            })
            .unwrap();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = bound_reconciler(&mut graphics, &mut board, t0);

        let late = t0 + ms(10_000);
        r.on_scene_changed(Vec::new(), late);
        let out = r.poll(&mut graphics, &mut board, late + ms(100)).unwrap();
        assert_eq!(out, FlushOutcome::Unchanged);
        assert!(graphics.get("a").is_some());
    }

    #[test]
    fn test_anti_wipe_reloads_widget() {
        let mut peer = SharedGraphics::new();
        let update = peer
            .transact_local(|tx| {
                for i in 0..3 {
                    tx.put(shape(&format!("e{i}"), 1));
                }
            })
            .unwrap()
            .unwrap();

        let mut graphics = SharedGraphics::new();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = SceneReconciler::new(SyncTimings::default());
        r.attach(t0);
        r.mark_synced();
        r.apply_remote(&mut graphics, &update, &mut board, t0 + ms(100)).unwrap();

        // Widget finishes its own init and reports an empty scene.
        r.on_scene_changed(Vec::new(), t0 + ms(400));
        let out = r.poll(&mut graphics, &mut board, t0 + ms(500)).unwrap();

        assert_eq!(out, FlushOutcome::WipePrevented);
        assert_eq!(graphics.map().visible_len(), 3);
        assert_eq!(board.scene.len(), 3);
        assert_eq!(r.stats().wipes_prevented, 1);
    }

    #[test]
    fn test_pending_edit_flushed_before_remote_merge() {
        let mut peer = SharedGraphics::new();
        let remote = peer
            .transact_local(|tx| {
                tx.put(shape("theirs", 1));
            })
            .unwrap()
            .unwrap();

        let mut graphics = SharedGraphics::new();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = bound_reconciler(&mut graphics, &mut board, t0);

        let t1 = t0 + ms(5000);
        r.on_scene_changed(vec![shape("mine", 1)], t1);
        let outcome = r.apply_remote(&mut graphics, &remote, &mut board, t1 + ms(10)).unwrap();

        assert!(outcome.flushed.is_some());
        assert!(outcome.applied);
        assert!(graphics.get("mine").is_some());
        assert!(graphics.get("theirs").is_some());
        assert_eq!(board.scene.len(), 2);
    }

    #[test]
    fn test_detach_resets() {
        let mut graphics = SharedGraphics::new();
        let mut board = FakeBoard::default();
        let t0 = Instant::now();
        let mut r = bound_reconciler(&mut graphics, &mut board, t0);
        r.on_scene_changed(vec![shape("a", 1)], t0 + ms(5000));

        r.detach();
        assert_eq!(r.state(), ReconcilerState::Unbound);
        assert!(!r.has_pending());
        assert!(r.session().is_synced);
        assert!(!r.session().has_loaded_initial_snapshot);
        assert_eq!(r.next_deadline(), None);
    }
}
