//! Context allocation churn: pooled slot arrays vs. a pool that never caches

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relayflow::config::WorkerConfig;
use relayflow::inbound::InboundInfo;
use relayflow::{Protocol, Worker};
use std::sync::Arc;

fn filenames(n: usize) -> Vec<Arc<str>> {
    (0..n).map(|i| Arc::from(format!("filter-{}.js", i))).collect()
}

fn bench_context_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("context_churn");
    group.throughput(Throughput::Elements(1));

    for slots in [1usize, 4, 16] {
        let pooled = Worker::new(WorkerConfig::default());
        let pool = pooled.context_pool(filenames(slots));
        group.bench_with_input(BenchmarkId::new("pooled", slots), &slots, |b, _| {
            b.iter(|| {
                let ctx = pooled.new_context(&pool, None);
                ctx.data(0).set(black_box(42u64));
                ctx.finalize();
            })
        });

        let unpooled = Worker::new(WorkerConfig {
            context_pool_capacity: 0,
            ..Default::default()
        });
        let pool = unpooled.context_pool(filenames(slots));
        group.bench_with_input(BenchmarkId::new("unpooled", slots), &slots, |b, _| {
            b.iter(|| {
                let ctx = unpooled.new_context(&pool, None);
                ctx.data(0).set(black_box(42u64));
                ctx.finalize();
            })
        });
    }
    group.finish();
}

fn bench_inbound_lookup(c: &mut Criterion) {
    let worker = Worker::new(WorkerConfig::default());
    let inbound = worker
        .inbounds()
        .register(InboundInfo::new(Protocol::Tcp, "0.0.0.0:8080"));
    let pool = worker.context_pool(filenames(1));
    let ctx = worker.new_context(&pool, Some(inbound.downgrade()));

    c.bench_function("inbound_lookup_live", |b| {
        b.iter(|| black_box(ctx.inbound()))
    });

    let expired = worker.new_context(&pool, None);
    c.bench_function("inbound_lookup_absent", |b| {
        b.iter(|| black_box(expired.inbound()))
    });
}

criterion_group!(benches, bench_context_churn, bench_inbound_lookup);
criterion_main!(benches);
