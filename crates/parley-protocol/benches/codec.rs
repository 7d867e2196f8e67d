//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, ChatMessage, Envelope, ServerEvent};

fn room_envelope(content_len: usize) -> Envelope {
    let message = ChatMessage::text("m-bench", "alice", "x".repeat(content_len)).to_room("general");
    Envelope::for_message(message, "instance-bench")
}

fn bench_encode_envelope(c: &mut Criterion) {
    let envelope = room_envelope(64);

    let mut group = c.benchmark_group("encode_envelope");
    group.throughput(Throughput::Elements(1));
    group.bench_function("text_64B", |b| {
        b.iter(|| codec::encode_envelope(black_box(&envelope)))
    });
    group.finish();
}

fn bench_decode_envelope(c: &mut Criterion) {
    let encoded = codec::encode_envelope(&room_envelope(64)).unwrap();

    let mut group = c.benchmark_group("decode_envelope");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("text_64B", |b| {
        b.iter(|| codec::decode_envelope(black_box(&encoded)))
    });
    group.finish();
}

fn bench_event_json(c: &mut Criterion) {
    let event = ServerEvent::Message(ChatMessage::text("m-bench", "alice", "x".repeat(256)));

    c.bench_function("encode_event_256B", |b| {
        b.iter(|| codec::encode_event(black_box(&event)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_encode_envelope,
    bench_decode_envelope,
    bench_event_json
);
criterion_main!(benches);
