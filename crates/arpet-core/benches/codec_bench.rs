//! Criterion benchmarks for the anchor-sharing binary codec.
//!
//! The interesting case is `SharedCloudAnchors`, whose size grows with the
//! number of anchors in the scene; view commands and replies are tiny.
//!
//! Run with:
//! ```bash
//! cargo bench --package arpet-core --bench codec_bench
//! ```

use arpet_core::protocol::codec::{decode_message, encode_message};
use arpet_core::protocol::messages::{PetMessage, ReplyStatus, ViewCommand};
use arpet_core::{CloudAnchor, ObjectType, Pose};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

// ── Message fixtures ──────────────────────────────────────────────────────────

fn make_view_command() -> PetMessage {
    PetMessage::ViewCommand(ViewCommand::LookingSideBySide)
}

fn make_reply() -> PetMessage {
    PetMessage::Reply {
        request_seq: 42,
        status: ReplyStatus::Failed("anchor could not be resolved".to_string()),
    }
}

fn make_anchors(count: usize) -> PetMessage {
    let anchors = (0..count)
        .map(|i| {
            CloudAnchor::new(
                if i == 0 { ObjectType::Pet } else { ObjectType::Bowl },
                format!("ua-{i:08x}-0c5f-4a4e-9f3c-5a1d2e7b9c10"),
                Pose::from_translation(i as f32 * 0.25, 0.0, -1.5),
            )
        })
        .collect();
    PetMessage::SharedCloudAnchors(anchors)
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_message");
    group.bench_function("ViewCommand", |b| {
        let msg = make_view_command();
        b.iter(|| encode_message(black_box(&msg), black_box(1), black_box(0)).unwrap())
    });
    group.bench_function("Reply", |b| {
        let msg = make_reply();
        b.iter(|| encode_message(black_box(&msg), black_box(1), black_box(0)).unwrap())
    });
    for count in [1usize, 5, 50] {
        let msg = make_anchors(count);
        group.bench_with_input(BenchmarkId::new("SharedCloudAnchors", count), &msg, |b, msg| {
            b.iter(|| encode_message(black_box(msg), black_box(1), black_box(0)).unwrap())
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_message");
    for count in [1usize, 5, 50] {
        let bytes = encode_message(&make_anchors(count), 1, 0)
            .expect("encode must succeed for benchmark setup");
        group.bench_with_input(BenchmarkId::new("SharedCloudAnchors", count), &bytes, |b, bytes| {
            b.iter(|| decode_message(black_box(bytes)).expect("decode must succeed"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
