use criterion::{black_box, criterion_group, criterion_main, Criterion};
use duet_collab::awareness::{AwarenessChannel, AwarenessMessage};
use duet_collab::broadcast::{BroadcastGroup, Envelope};
use duet_collab::protocol::{PeerInfo, SyncMessage};
use duet_collab::room::{RoomId, RoomKind};
use duet_collab::OfflineQueue;
use duet_core::{PresenceFields, PresenceRecord, SharedText, SyncTimings};
use std::sync::Arc;
use std::time::Instant;

fn room() -> RoomId {
    RoomId::derive("bench-session", RoomKind::Text)
}

fn bench_update_encode(c: &mut Criterion) {
    let update = vec![0u8; 64]; // Typical keystroke update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(7), room(), black_box(1), black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(7, room(), 1, vec![0u8; 64]).encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn presence_with_cursor() -> AwarenessMessage {
    let mut doc = SharedText::new();
    doc.apply_local_edit(0..0, "fn main() {\n    println!(\"hi\");\n}\n").unwrap();
    let mut channel = AwarenessChannel::new(PresenceRecord::new(7, "Bench"), &SyncTimings::default());
    let cursor = doc.logical_position(12).unwrap();
    channel
        .set_local_state(PresenceFields::cursor(cursor), Instant::now())
        .unwrap()
}

fn bench_awareness_encode(c: &mut Criterion) {
    let msg = presence_with_cursor();

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let msg = presence_with_cursor();

    c.bench_function("awareness_apply_remote", |b| {
        let mut channel = AwarenessChannel::new(PresenceRecord::new(8, "Local"), &SyncTimings::default());
        b.iter(|| {
            // Clock does not advance, so every apply after the first is stale.
            black_box(channel.apply_remote(black_box(msg.clone()), Instant::now()));
        })
    });
}

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for i in 1..=100u64 {
                    let peer = PeerInfo {
                        client_id: i,
                        display_name: format!("Peer{i}"),
                    };
                    receivers.push(group.add_peer(peer).await);
                }

                let count = group.broadcast_raw(Envelope {
                    from: 1,
                    bytes: Arc::new(vec![0u8; 64]),
                });
                black_box(count);
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000u64 {
                queue.enqueue(i, vec![0u8; 64]);
            }
            black_box(queue.drain());
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_encode,
    bench_awareness_apply,
    bench_broadcast_raw,
    bench_offline_queue,
);
criterion_main!(benches);
