//! Throughput benchmarks for Roomcast.
//!
//! These benchmarks measure raw routing throughput of the registry and the hub.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use roomcast_bench::{drain, populated_registry};
use roomcast_core::registry::mailbox;
use roomcast_core::{Hub, Message, SessionHandle, SessionKey};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Benchmark broadcast fan-out in the registry.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (mut registry, mut receivers) = populated_registry("broadcast", size, 4);
            let message = Arc::new(Message::new("user-0".into(), "broadcast".into(), "x".repeat(64)));

            // Mailboxes are drained outside the measured section.
            b.iter_custom(|iters| {
                let mut elapsed = Duration::ZERO;
                for _ in 0..iters {
                    let start = Instant::now();
                    black_box(registry.route(black_box(&message)));
                    elapsed += start.elapsed();
                    drain(&mut receivers);
                }
                elapsed
            });
        });
    }

    group.finish();
}

/// Benchmark registry operations.
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("directed_in_1000", |b| {
        let (mut registry, mut receivers) = populated_registry("room", 1000, 4);
        let message = Arc::new(
            Message::new("user-0".into(), "room".into(), "psst").with_recipient("user-500".into()),
        );

        b.iter(|| {
            let outcome = registry.route(black_box(&message));
            drain(&mut receivers[500..501]);
            outcome
        });
    });

    group.bench_function("register_replace", |b| {
        let (mut registry, _receivers) = populated_registry("room", 100, 4);
        let mut i = 0u64;
        b.iter(|| {
            let (tx, _rx) = mailbox(4);
            let key = SessionKey::new("room".into(), format!("user-{}", i % 100).into());
            i += 1;
            registry.register(SessionHandle::new(key, tx))
        });
    });

    group.finish();
}

/// Benchmark messages routed through the hub task.
fn bench_hub(c: &mut Criterion) {
    let mut group = c.benchmark_group("hub");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for members in [1usize, 100] {
        group.throughput(Throughput::Elements(members as u64));
        group.bench_with_input(BenchmarkId::new("route", members), &members, |b, &members| {
            let handle = rt.block_on(async {
                let hub = Hub::new();
                let handle = hub.handle();
                hub.spawn();
                for i in 0..members {
                    let (tx, mut rx) = mailbox(1024);
                    let key = SessionKey::new("room".into(), format!("user-{i}").into());
                    handle.register(SessionHandle::new(key, tx)).await.unwrap();
                    tokio::spawn(async move { while rx.recv().await.is_some() {} });
                }
                handle
            });

            b.iter_custom(|iters| {
                rt.block_on(async {
                    let start = Instant::now();
                    for _ in 0..iters {
                        handle
                            .route(Message::new("user-0".into(), "room".into(), "x".repeat(64)))
                            .await
                            .unwrap();
                    }
                    // Answered only after every route above is applied.
                    handle.stats().await.unwrap();
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fanout, bench_registry, bench_hub);
criterion_main!(benches);
