//! Local fan-out benchmarks.
//!
//! Each iteration delivers one fresh envelope to every matching session on
//! the instance and drains the session queues.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parley_bench::Fixture;
use parley_protocol::{ChatMessage, Envelope};

const ROOM: &str = "bench-room";

fn bench_room_fanout(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    let mut group = c.benchmark_group("room_fanout");
    for sessions in [1usize, 10, 100, 1000] {
        let mut fixture = Fixture::new(sessions, ROOM);
        let mut seq = 0u64;

        group.throughput(Throughput::Elements(sessions as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sessions), &sessions, |b, _| {
            b.iter(|| {
                seq += 1;
                let message =
                    ChatMessage::text(format!("m-{seq}"), "user-0", "hello").to_room(ROOM);
                let envelope = Envelope::for_message(message, "bench");
                let delivered = fixture.hub.router().deliver_local(black_box(&envelope));
                fixture.drain();
                delivered
            });
        });
    }
    group.finish();
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    let mut group = c.benchmark_group("broadcast_fanout");
    for sessions in [10usize, 1000] {
        let mut fixture = Fixture::new(sessions, ROOM);
        let mut seq = 0u64;

        group.throughput(Throughput::Elements(sessions as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sessions), &sessions, |b, _| {
            b.iter(|| {
                seq += 1;
                let message = ChatMessage::text(format!("m-{seq}"), "user-0", "hello");
                let envelope = Envelope::for_message(message, "bench");
                let delivered = fixture.hub.router().deliver_local(black_box(&envelope));
                fixture.drain();
                delivered
            });
        });
    }
    group.finish();
}

fn bench_duplicate_suppression(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    let mut fixture = Fixture::new(100, ROOM);
    let message = ChatMessage::text("m-repeat", "user-0", "hello").to_room(ROOM);
    let envelope = Envelope::for_message(message, "bench");
    fixture.hub.router().deliver_local(&envelope);
    fixture.drain();

    c.bench_function("duplicate_suppression_100", |b| {
        b.iter(|| fixture.hub.router().deliver_local(black_box(&envelope)))
    });
}

criterion_group!(
    benches,
    bench_room_fanout,
    bench_broadcast_fanout,
    bench_duplicate_suppression
);
criterion_main!(benches);
