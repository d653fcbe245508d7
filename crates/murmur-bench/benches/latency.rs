//! Latency benchmarks for Murmur.
//!
//! These benchmarks focus on single-operation latency through the hub.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use murmur_core::{outbox, ConnectionId, Hub, Identity};
use std::time::Instant;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Benchmark submit + receive with one and ten listeners.
fn bench_submit_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("submit_latency");

    for listeners in [1usize, 10] {
        group.bench_function(format!("{listeners}_listeners"), |b| {
            b.iter_custom(|iters| {
                let hub = Hub::in_memory();
                let mut inboxes = Vec::new();
                rt.block_on(async {
                    for i in 0..listeners {
                        let (tx, rx) = outbox();
                        let conn = ConnectionId::new(format!("conn-{i}"));
                        hub.connect(&conn, &Identity::new(format!("user-{i}")), tx)
                            .unwrap();
                        hub.join(&conn, "public").await.unwrap();
                        inboxes.push(rx);
                    }
                });
                let sender = ConnectionId::new("conn-0");

                let start = Instant::now();
                rt.block_on(async {
                    for _ in 0..iters {
                        hub.submit(&sender, "public", "ping").await.unwrap();
                        for rx in &mut inboxes {
                            while rx.try_recv().is_ok() {}
                        }
                    }
                });
                start.elapsed()
            });
        });
    }

    group.finish();
}

/// Benchmark join/leave churn on a busy room.
fn bench_join_churn(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("join_churn");

    group.bench_function("join_leave", |b| {
        let hub = Hub::in_memory();
        let mut inboxes = Vec::new();
        rt.block_on(async {
            for i in 0..50 {
                let (tx, rx) = outbox();
                let conn = ConnectionId::new(format!("conn-{i}"));
                hub.connect(&conn, &Identity::new(format!("user-{i}")), tx)
                    .unwrap();
                hub.join(&conn, "hackers").await.unwrap();
                inboxes.push(rx);
            }
        });
        let (tx, _rx) = outbox();
        let churner = ConnectionId::new("churner");
        hub.connect(&churner, &Identity::new("churner"), tx).unwrap();

        b.iter_custom(|iters| {
            let start = Instant::now();
            rt.block_on(async {
                for _ in 0..iters {
                    hub.join(black_box(&churner), "hackers").await.unwrap();
                    hub.leave(black_box(&churner), "hackers").await.unwrap();
                }
            });
            let elapsed = start.elapsed();
            for rx in &mut inboxes {
                while rx.try_recv().is_ok() {}
            }
            elapsed
        });
    });

    group.finish();
}

/// Benchmark unread count aggregation over the default rooms.
fn bench_unread_counts(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("unread_counts");

    let hub = Hub::in_memory();
    let (tx, _rx) = outbox();
    let conn = ConnectionId::new("reader");
    hub.connect(&conn, &Identity::new("reader"), tx).unwrap();
    rt.block_on(async {
        for room in ["public", "girls", "boys", "hackers", "friendly"] {
            for n in 0..100 {
                hub.submit(&conn, room, &format!("message {n}")).await.unwrap();
            }
        }
    });

    group.bench_function("five_rooms", |b| {
        b.iter(|| rt.block_on(hub.unread_counts(black_box(&conn))).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_submit_latency,
    bench_join_churn,
    bench_unread_counts,
);
criterion_main!(benches);
