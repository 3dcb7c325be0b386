//! Turns peer presence into editor decorations.

use std::ops::Range;

use crate::presence::{ClientId, PresenceRecord};
use crate::text::SharedText;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecorationKind {
    /// Zero-width caret marker, labelled with the peer's name.
    Cursor,
    /// Highlighted range.
    Selection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoration {
    pub client_id: ClientId,
    pub kind: DecorationKind,
    /// Byte range in the current text snapshot.
    pub range: Range<usize>,
    pub color: String,
    pub label: String,
}

/// Project every remote peer's cursor and selection onto `doc`.
///
/// The local client is skipped. Positions that no longer resolve against
/// the current text are dropped silently.
pub fn project<'a, I>(states: I, local_client: ClientId, doc: &SharedText) -> Vec<Decoration>
where
    I: IntoIterator<Item = &'a PresenceRecord>,
{
    let mut out = Vec::new();
    for state in states {
        if state.client_id == local_client {
            continue;
        }

        if let Some(selection) = &state.selection {
            if let (Some(anchor), Some(head)) = (doc.resolve(&selection.anchor), doc.resolve(&selection.head)) {
                if anchor != head {
                    out.push(Decoration {
                        client_id: state.client_id,
                        kind: DecorationKind::Selection,
                        range: anchor.min(head)..anchor.max(head),
                        color: state.color.clone(),
                        label: state.display_name.clone(),
                    });
                }
            }
        }

        if let Some(offset) = state.cursor.as_ref().and_then(|cursor| doc.resolve(cursor)) {
            out.push(Decoration {
                client_id: state.client_id,
                kind: DecorationKind::Cursor,
                range: offset..offset,
                color: state.color.clone(),
                label: state.display_name.clone(),
            });
        }
    }
    out.sort_by_key(|d| (d.client_id, d.kind == DecorationKind::Cursor));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{LogicalPosition, LogicalRange};

    fn doc_with(text: &str) -> SharedText {
        let mut doc = SharedText::new();
        doc.apply_local_edit(0..0, text).unwrap();
        doc
    }

    #[test]
    fn test_local_client_excluded() {
        let doc = doc_with("abc");
        let mut me = PresenceRecord::new(1, "me");
        me.cursor = Some(doc.logical_position(1).unwrap());
        let mut peer = PresenceRecord::new(2, "peer");
        peer.cursor = Some(doc.logical_position(2).unwrap());

        let decorations = project([&me, &peer], 1, &doc);
        assert_eq!(decorations.len(), 1);
        assert_eq!(decorations[0].client_id, 2);
        assert_eq!(decorations[0].range, 2..2);
        assert_eq!(decorations[0].label, "peer");
        assert_eq!(decorations[0].color, peer.color);
    }

    #[test]
    fn test_selection_normalized() {
        let doc = doc_with("hello world");
        let mut peer = PresenceRecord::new(2, "peer");
        let anchor = doc.logical_position(8).unwrap();
        let head = doc.logical_position(3).unwrap();
        peer.selection = Some(LogicalRange::new(anchor, head.clone()));
        peer.cursor = Some(head);

        let decorations = project([&peer], 1, &doc);
        assert_eq!(decorations.len(), 2);
        assert_eq!(decorations[0].kind, DecorationKind::Selection);
        assert_eq!(decorations[0].range, 3..8);
        assert_eq!(decorations[1].kind, DecorationKind::Cursor);
    }

    #[test]
    fn test_unresolvable_peer_dropped() {
        let doc = doc_with("abc");
        let mut ghost = PresenceRecord::new(3, "ghost");
        ghost.cursor = Some(LogicalPosition::from_bytes(vec![0xAA, 0xBB]));
        assert!(project([&ghost], 1, &doc).is_empty());

        let idle = PresenceRecord::new(4, "idle");
        assert!(project([&idle], 1, &doc).is_empty());
    }
}
