//! Collaborative code buffer backed by a Yrs `Text`.
//!
//! Offsets are UTF-8 byte offsets into the current snapshot, which is also
//! the offset unit of a default Yrs document. Ranges must fall on character
//! boundaries.
//!
//! ```text
//! widget edit ──► SharedText::apply_local_edit ──► update bytes ──► transport
//!                                   │
//!                                   └─► TextChange { origin: Local }
//!
//! transport ──► SharedText::apply_remote_update ──► TextChange { origin: Remote, edits }
//! ```

use std::ops::Range;

use serde::{Deserialize, Serialize};
use yrs::updates::encoder::Encode;
use yrs::{
    Assoc, Doc, GetString, IndexedSequence, ReadTxn, StateVector, StickyIndex, Text, TextRef,
    Transact, Update,
};

use crate::decoding;
use crate::error::{CollabError, CollabResult};
use crate::observer::{ChangeOrigin, ObserverRegistry, SubscriptionId};
use crate::position::LogicalPosition;
use crate::replica::Replica;

/// Name of the root-level Y.Text holding the code buffer.
const TEXT_NAME: &str = "code";

/// A single contiguous replacement over a text snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    /// Byte range of the snapshot being replaced.
    pub range: Range<usize>,
    pub replacement: String,
}

impl TextEdit {
    pub fn new(range: Range<usize>, replacement: impl Into<String>) -> Self {
        Self {
            range,
            replacement: replacement.into(),
        }
    }

    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::new(at..at, text)
    }

    pub fn delete(range: Range<usize>) -> Self {
        Self::new(range, String::new())
    }

    /// Apply this edit to a plain string (used by widgets and tests).
    pub fn apply_to(&self, target: &mut String) -> CollabResult<()> {
        check_range(target, &self.range)?;
        target.replace_range(self.range.clone(), &self.replacement);
        Ok(())
    }

    pub fn is_noop(&self) -> bool {
        self.range.is_empty() && self.replacement.is_empty()
    }
}

/// Compute the smallest single edit that turns `before` into `after`.
///
/// Common prefix and suffix are measured in whole characters so the
/// resulting byte range never splits a code point.
pub fn minimal_edit(before: &str, after: &str) -> Option<TextEdit> {
    if before == after {
        return None;
    }

    let prefix: usize = before
        .chars()
        .zip(after.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();

    let suffix: usize = before[prefix..]
        .chars()
        .rev()
        .zip(after[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();

    Some(TextEdit {
        range: prefix..before.len() - suffix,
        replacement: after[prefix..after.len() - suffix].to_string(),
    })
}

fn check_range(text: &str, range: &Range<usize>) -> CollabResult<()> {
    let valid = range.start <= range.end
        && range.end <= text.len()
        && text.is_char_boundary(range.start)
        && text.is_char_boundary(range.end);
    if valid {
        Ok(())
    } else {
        Err(CollabError::InvalidRange {
            start: range.start,
            end: range.end,
            len: text.len(),
        })
    }
}

/// Change notification delivered to [`SharedText`] observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub origin: ChangeOrigin,
    /// Edits to apply, in order, to the snapshot that preceded the change.
    pub edits: Vec<TextEdit>,
}

/// Observer-free text replica.
///
/// This is the part shared by the client store and the relay: it only
/// knows how to edit, merge and diff.
pub struct TextReplica {
    doc: Doc,
}

impl TextReplica {
    pub fn new() -> Self {
        let doc = Doc::new();
        // Register the root type before any transaction is opened.
        let _ = doc.get_or_insert_text(TEXT_NAME);
        Self { doc }
    }

    fn text_ref(&self) -> TextRef {
        self.doc.get_or_insert_text(TEXT_NAME)
    }

    pub fn content(&self) -> String {
        let text = self.text_ref();
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    pub fn len(&self) -> usize {
        self.content().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace `range` with `replacement` and return the encoded update,
    /// or `None` when the edit changes nothing.
    pub fn edit(&self, range: Range<usize>, replacement: &str) -> CollabResult<Option<Vec<u8>>> {
        let text = self.text_ref();
        let current = {
            let txn = self.doc.transact();
            text.get_string(&txn)
        };
        check_range(&current, &range)?;
        if range.is_empty() && replacement.is_empty() {
            return Ok(None);
        }
        if current[range.clone()] == *replacement {
            return Ok(None);
        }

        let mut txn = self.doc.transact_mut();
        if !range.is_empty() {
            text.remove_range(&mut txn, range.start as u32, range.len() as u32);
        }
        if !replacement.is_empty() {
            text.insert(&mut txn, range.start as u32, replacement);
        }
        Ok(Some(txn.encode_update_v1()))
    }

    /// Merge an encoded update. Duplicate or already-known updates are no-ops.
    ///
    /// Returns `true` if the update integrated new items or deletions.
    pub fn merge(&self, update: &[u8]) -> CollabResult<bool> {
        let update: Update = decoding::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        let before = txn.state_vector();
        txn.apply_update(update)
            .map_err(|e| CollabError::MalformedUpdate(e.to_string()))?;
        Ok(txn.state_vector() != before || !txn.delete_set().is_empty())
    }

    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Anchor a logical position at `offset`, sticking to the character
    /// that follows it.
    pub fn anchor(&self, offset: usize) -> CollabResult<LogicalPosition> {
        let text = self.text_ref();
        let len = self.len();
        if offset > len {
            return Err(CollabError::InvalidRange {
                start: offset,
                end: offset,
                len,
            });
        }
        let mut txn = self.doc.transact_mut();
        let sticky = text
            .sticky_index(&mut txn, offset as u32, Assoc::After)
            .ok_or(CollabError::InvalidRange {
                start: offset,
                end: offset,
                len,
            })?;
        Ok(LogicalPosition::from_bytes(sticky.encode_v1()))
    }

    /// Resolve a logical position against the current snapshot.
    ///
    /// Returns `None` when the anchor cannot be located, e.g. it refers to
    /// content this replica has not received.
    pub fn resolve(&self, position: &LogicalPosition) -> Option<usize> {
        let sticky: StickyIndex = decoding::decode_v1(position.as_bytes()).ok()?;
        let len = self.len();
        let txn = self.doc.transact();
        let offset = sticky.get_offset(&txn)?;
        let index = offset.index as usize;
        (index <= len).then_some(index)
    }
}

impl Default for TextReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for TextReplica {
    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_diff(&self, remote_state_vector: &[u8]) -> CollabResult<Vec<u8>> {
        let sv: StateVector = decoding::decode_v1(remote_state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    fn merge_update(&mut self, update: &[u8]) -> CollabResult<bool> {
        self.merge(update)
    }
}

/// The client-side shared code buffer.
///
/// Wraps a [`TextReplica`] and tags every mutation with its origin so the
/// editor binding never re-applies its own writes.
pub struct SharedText {
    replica: TextReplica,
    observers: ObserverRegistry<TextChange>,
}

impl SharedText {
    pub fn new() -> Self {
        Self {
            replica: TextReplica::new(),
            observers: ObserverRegistry::new(),
        }
    }

    pub fn current_text(&self) -> String {
        self.replica.content()
    }

    pub fn len(&self) -> usize {
        self.replica.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replica.is_empty()
    }

    /// Apply an edit made on this client.
    ///
    /// Returns the update to disseminate, or `None` if the edit was a no-op.
    pub fn apply_local_edit(
        &mut self,
        range: Range<usize>,
        replacement: &str,
    ) -> CollabResult<Option<Vec<u8>>> {
        let update = self.replica.edit(range.clone(), replacement)?;
        if update.is_some() {
            self.observers.emit(&TextChange {
                origin: ChangeOrigin::Local,
                edits: vec![TextEdit::new(range, replacement)],
            });
        }
        Ok(update)
    }

    /// Merge an update received from a peer.
    ///
    /// Returns the resulting change, or `None` if the update was already
    /// known (duplicate delivery) or is still waiting on missing history.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> CollabResult<Option<TextChange>> {
        let before = self.replica.content();
        self.replica.merge(update)?;
        let after = self.replica.content();

        let Some(edit) = minimal_edit(&before, &after) else {
            return Ok(None);
        };
        let change = TextChange {
            origin: ChangeOrigin::Remote,
            edits: vec![edit],
        };
        self.observers.emit(&change);
        Ok(Some(change))
    }

    pub fn observe(&mut self, callback: impl Fn(&TextChange) + 'static) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Anchor a content-relative position at byte `offset`.
    pub fn logical_position(&self, offset: usize) -> CollabResult<LogicalPosition> {
        self.replica.anchor(offset)
    }

    pub fn resolve(&self, position: &LogicalPosition) -> Option<usize> {
        self.replica.resolve(position)
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.replica.encode_state()
    }
}

impl Default for SharedText {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for SharedText {
    fn state_vector(&self) -> Vec<u8> {
        self.replica.state_vector()
    }

    fn encode_diff(&self, remote_state_vector: &[u8]) -> CollabResult<Vec<u8>> {
        self.replica.encode_diff(remote_state_vector)
    }

    fn merge_update(&mut self, update: &[u8]) -> CollabResult<bool> {
        Ok(self.apply_remote_update(update)?.is_some())
    }
}

impl std::fmt::Debug for SharedText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedText")
            .field("len", &self.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
