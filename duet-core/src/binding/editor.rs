//! Two-way bridge between [`SharedText`] and a code editor widget.
//!
//! Local edits become store edits; remote store changes become incremental
//! widget edits over the same range, so the widget keeps its cursor, scroll
//! position and undo history. Presence changes only touch decorations.

use crate::decoration::{project, Decoration};
use crate::error::CollabResult;
use crate::observer::ChangeOrigin;
use crate::presence::{ClientId, PresenceRecord};
use crate::text::{minimal_edit, SharedText, TextChange, TextEdit};

use super::WidgetError;

/// Identity of a mounted widget instance. A remount gets a new id.
pub type WidgetInstanceId = u64;

/// The code editor as seen by the binding.
///
/// Edits applied through [`TextWidget::apply_edit`] are programmatic and
/// must not be reported back as user edits.
pub trait TextWidget {
    fn text(&self) -> String;

    /// Apply one edit in place, preserving undo, cursor and scroll state.
    fn apply_edit(&mut self, edit: &TextEdit) -> Result<(), WidgetError>;

    /// Replace all presence overlays.
    fn set_decorations(&mut self, decorations: &[Decoration]) -> Result<(), WidgetError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditorStats {
    pub local_edits: u64,
    pub remote_edits_applied: u64,
    pub decoration_refreshes: u64,
    pub widget_errors: u64,
}

#[derive(Debug, Default)]
pub struct EditorBinding {
    bound: Option<WidgetInstanceId>,
    stats: EditorStats,
}

impl EditorBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    pub fn stats(&self) -> EditorStats {
        self.stats
    }

    /// Bind `widget` to `doc`, bringing the widget's content in line with
    /// the store. Re-binding the same instance is a no-op and returns
    /// `false`.
    pub fn bind<W: TextWidget>(&mut self, instance: WidgetInstanceId, doc: &SharedText, widget: &mut W) -> bool {
        if self.bound == Some(instance) {
            log::debug!("Editor instance {instance} already bound");
            return false;
        }

        if let Some(edit) = minimal_edit(&widget.text(), &doc.current_text()) {
            if let Err(e) = widget.apply_edit(&edit) {
                self.widget_failed("initial content load", &e);
            }
        }
        if let Some(previous) = self.bound.replace(instance) {
            log::info!("Editor rebound from instance {previous} to {instance}");
        } else {
            log::info!("Editor bound to instance {instance}");
        }
        true
    }

    pub fn unbind(&mut self) {
        if let Some(instance) = self.bound.take() {
            log::info!("Editor instance {instance} unbound");
        }
    }

    /// Forward a user edit to the store. Returns the update to broadcast.
    pub fn on_local_edit(&mut self, doc: &mut SharedText, edit: &TextEdit) -> CollabResult<Option<Vec<u8>>> {
        if !self.is_bound() {
            log::debug!("Ignoring editor edit while unbound");
            return Ok(None);
        }
        let update = doc.apply_local_edit(edit.range.clone(), &edit.replacement)?;
        if update.is_some() {
            self.stats.local_edits += 1;
        }
        Ok(update)
    }

    /// Mirror a store change into the widget. Local-origin changes are the
    /// widget's own edits and are skipped.
    pub fn on_document_change<W: TextWidget>(&mut self, change: &TextChange, widget: &mut W) {
        if !self.is_bound() || change.origin == ChangeOrigin::Local {
            return;
        }
        for edit in &change.edits {
            match widget.apply_edit(edit) {
                Ok(()) => self.stats.remote_edits_applied += 1,
                Err(e) => self.widget_failed("remote edit", &e),
            }
        }
    }

    /// Recompute peer decorations. Never touches content.
    pub fn on_awareness_change<'a, W, I>(&mut self, states: I, local_client: ClientId, doc: &SharedText, widget: &mut W)
    where
        W: TextWidget,
        I: IntoIterator<Item = &'a PresenceRecord>,
    {
        if !self.is_bound() {
            return;
        }
        let decorations = project(states, local_client, doc);
        match widget.set_decorations(&decorations) {
            Ok(()) => self.stats.decoration_refreshes += 1,
            Err(e) => self.widget_failed("decorations", &e),
        }
    }

    fn widget_failed(&mut self, during: &str, error: &WidgetError) {
        self.stats.widget_errors += 1;
        log::warn!("Editor widget call failed during {during}: {error}");
    }
}
