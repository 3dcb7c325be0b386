//! Convergence and idempotence across replicas fed the same operations in
//! different orders, with duplicates.

use duet_core::{Bounds, ElementKind, ElementRecord, MapOp, Replica, SharedGraphics, SharedText};

/// Three writers each produce a few updates against their own replica.
fn text_updates() -> Vec<Vec<u8>> {
    let mut a = SharedText::new();
    let mut b = SharedText::new();
    let mut c = SharedText::new();

    let base = a.apply_local_edit(0..0, "def solve(nums):\n    return 0\n").unwrap().unwrap();
    b.apply_remote_update(&base).unwrap();
    c.apply_remote_update(&base).unwrap();

    let mut updates = vec![base];
    updates.push(a.apply_local_edit(4..9, "answer").unwrap().unwrap());
    updates.push(b.apply_local_edit(0..0, "# two pointers\n").unwrap().unwrap());
    let end = c.len();
    updates.push(c.apply_local_edit(end..end, "print(solve([1, 2]))\n").unwrap().unwrap());
    let len = b.len();
    updates.push(b.apply_local_edit(len - 2..len - 1, "1").unwrap().unwrap());
    updates
}

#[test]
fn text_converges_regardless_of_order_and_duplicates() {
    let updates = text_updates();

    let mut forward = SharedText::new();
    for u in &updates {
        forward.apply_remote_update(u).unwrap();
    }

    let mut reversed = SharedText::new();
    for u in updates.iter().rev() {
        reversed.apply_remote_update(u).unwrap();
    }

    let mut shuffled = SharedText::new();
    for i in [2, 0, 4, 0, 1, 3, 2, 4] {
        shuffled.apply_remote_update(&updates[i]).unwrap();
    }

    assert_eq!(forward.current_text(), reversed.current_text());
    assert_eq!(forward.current_text(), shuffled.current_text());
    assert!(forward.current_text().contains("# two pointers"));
    assert!(forward.current_text().contains("def answer(nums)"));
}

#[test]
fn text_redelivery_is_noop() {
    let updates = text_updates();
    let mut doc = SharedText::new();
    for u in &updates {
        doc.apply_remote_update(u).unwrap();
    }
    let settled = doc.current_text();
    for u in &updates {
        assert!(doc.apply_remote_update(u).unwrap().is_none());
    }
    assert_eq!(doc.current_text(), settled);
}

#[test]
fn malformed_update_between_valid_ones_does_not_block() {
    let updates = text_updates();
    let mut doc = SharedText::new();
    doc.apply_remote_update(&updates[0]).unwrap();
    assert!(doc.apply_remote_update(&[1, 2, 3, 250, 251]).is_err());
    for u in &updates[1..] {
        doc.apply_remote_update(u).unwrap();
    }

    let mut clean = SharedText::new();
    for u in &updates {
        clean.apply_remote_update(u).unwrap();
    }
    assert_eq!(doc.current_text(), clean.current_text());
}

fn shape(id: &str, version: u64, nonce: u32, x: f32) -> ElementRecord {
    let mut e = ElementRecord::new(id, ElementKind::Rectangle, Bounds::new(x, 0.0, 10.0, 10.0));
    e.version = version;
    e.version_nonce = nonce;
    e
}

fn map_updates() -> Vec<Vec<u8>> {
    let mut a = SharedGraphics::new();
    let mut b = SharedGraphics::new();
    let mut updates = Vec::new();

    updates.push(
        a.transact_local(|tx| {
            tx.put(shape("r1", 1, 11, 0.0));
            tx.put(shape("r2", 1, 12, 0.0));
        })
        .unwrap()
        .unwrap(),
    );
    // Concurrent writes to r1 at the same version.
    updates.push(a.transact_local(|tx| { tx.put(shape("r1", 2, 100, 5.0)); }).unwrap().unwrap());
    updates.push(b.transact_local(|tx| { tx.put(shape("r1", 2, 200, 9.0)); }).unwrap().unwrap());
    // Independent keys never conflict.
    updates.push(b.transact_local(|tx| { tx.put(shape("r3", 1, 13, 0.0)); }).unwrap().unwrap());
    // Removal racing with nothing newer.
    updates.push(a.transact_local(|tx| { tx.remove("r2"); }).unwrap().unwrap());
    updates
}

#[test]
fn map_converges_regardless_of_order_and_duplicates() {
    let updates = map_updates();

    let mut forward = SharedGraphics::new();
    for u in &updates {
        forward.apply_remote_update(u).unwrap();
    }
    let mut backward = SharedGraphics::new();
    for u in updates.iter().rev() {
        backward.apply_remote_update(u).unwrap();
    }
    let mut noisy = SharedGraphics::new();
    for i in [3, 1, 1, 4, 0, 2, 0, 3] {
        noisy.apply_remote_update(&updates[i]).unwrap();
    }

    assert_eq!(forward.snapshot(), backward.snapshot());
    assert_eq!(forward.snapshot(), noisy.snapshot());

    let r1 = forward.get("r1").unwrap();
    assert_eq!((r1.version, r1.version_nonce), (2, 200));
    assert!(forward.get("r2").is_none());
    assert!(forward.get("r3").is_some());
}

#[test]
fn map_redelivery_is_noop() {
    let updates = map_updates();
    let mut graphics = SharedGraphics::new();
    for u in &updates {
        graphics.apply_remote_update(u).unwrap();
    }
    let before = graphics.snapshot();
    for u in &updates {
        assert!(!graphics.merge_update(u).unwrap());
    }
    assert_eq!(graphics.snapshot(), before);
}

#[test]
fn full_state_diff_matches_incremental_delivery() {
    let updates = map_updates();
    let mut source = SharedGraphics::new();
    for u in &updates {
        source.apply_remote_update(u).unwrap();
    }

    let mut joiner = SharedGraphics::new();
    let diff = source.encode_diff(&joiner.state_vector()).unwrap();
    joiner.merge_update(&diff).unwrap();
    assert_eq!(joiner.snapshot(), source.snapshot());

    // A batch with one bad op is rejected as a whole.
    let mut bad = MapOp::put(shape("x", 1, 0, 0.0));
    bad.stamp.version = 99;
    let bytes = MapOp::encode_batch(&[MapOp::put(shape("y", 1, 0, 0.0)), bad]).unwrap();
    assert!(joiner.apply_remote_update(&bytes).is_err());
    assert!(joiner.get("y").is_none());
}
