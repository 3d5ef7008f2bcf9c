//! Latency benchmarks for Beacon.
//!
//! These benchmarks focus on measuring publish-to-receive latency.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_beacon_bench::{memory_engine, message};
use tenvis_beacon_core::{Bus, BusEngine, ChannelOptions, Config, Engine, Hub, MemoryStore};

/// Benchmark publish + receive through the memory engine.
fn bench_memory_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_latency");
    let id = Config::default().channel_id("test");
    let options = ChannelOptions::default();

    group.bench_function("single_subscriber", |b| {
        b.iter_custom(|iters| {
            let (hub, engine) = memory_engine();
            let mut rx = hub.subscribe("conn-1", "test").unwrap().receiver;

            let start = Instant::now();
            for _ in 0..iters {
                drop(engine.publish_message(&id, message("test", 64), &options));
                let _ = rx.try_recv();
            }
            start.elapsed()
        });
    });

    group.bench_function("ten_subscribers", |b| {
        b.iter_custom(|iters| {
            let (hub, engine) = memory_engine();
            let mut rxs: Vec<_> = (0..10)
                .map(|i| hub.subscribe(&format!("conn-{}", i), "test").unwrap().receiver)
                .collect();

            let start = Instant::now();
            for _ in 0..iters {
                drop(engine.publish_message(&id, message("test", 64), &options));
                for rx in &mut rxs {
                    let _ = rx.try_recv();
                }
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark publish + receive across two bus-connected nodes.
fn bench_bus_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_latency");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = Config::default();
    let id = config.channel_id("test");
    let options = ChannelOptions::default();

    let bus = Bus::default();
    let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
    let publisher = BusEngine::new(bus.clone(), Arc::new(Hub::new()), Arc::clone(&store), &config);
    let hub = Arc::new(Hub::new());
    let receiver = BusEngine::new(bus, Arc::clone(&hub), store, &config);
    let mut rx = hub.subscribe("conn-1", "test").unwrap().receiver;

    rt.block_on(async {
        publisher.run().await.unwrap();
        receiver.run().await.unwrap();
        receiver.subscribe(&id).await.unwrap();
    });

    group.bench_function("cross_node", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = Instant::now();
                for _ in 0..iters {
                    publisher
                        .publish_message(&id, message("test", 64), &options)
                        .await
                        .unwrap();
                    black_box(rx.recv().await.unwrap());
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark message creation latency.
fn bench_message_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_creation");

    group.bench_function("simple", |b| {
        b.iter(|| message(black_box("test:channel"), black_box(64)))
    });

    group.bench_function("with_client", |b| {
        b.iter(|| message(black_box("test:channel"), black_box(64)).with_client(black_box("conn-123")))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_memory_latency,
    bench_bus_latency,
    bench_message_creation,
);
criterion_main!(benches);
