//! Benchmark for record ingestion and snapshot publication.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowgraph::models::domain::{PacketRecord, Protocol};
use flowgraph::{Aggregator, GraphState};

fn records(hosts: usize, count: usize) -> Vec<PacketRecord> {
    (0..count)
        .map(|i| {
            let src = format!("10.0.{}.{}", (i % hosts) / 256, (i % hosts) % 256);
            let dst = format!("10.1.{}.{}", (i * 7 % hosts) / 256, (i * 7 % hosts) % 256);
            let protocol = if i % 3 == 0 { Protocol::Udp } else { Protocol::Tcp };
            PacketRecord::new(i as f64 * 0.001, src, dst, protocol, 64 + (i % 1400) as u64)
        })
        .collect()
}

fn ingest_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");

    for hosts in [10, 1_000, 10_000] {
        let batch = records(hosts, 10_000);
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(hosts), &batch, |b, batch| {
            b.iter(|| {
                let mut graph = Aggregator::new();
                for record in batch {
                    graph.ingest(black_box(record)).unwrap();
                }
                graph.flow_count()
            });
        });
    }

    group.finish();
}

fn apply_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply");

    for hosts in [10, 100, 1_000] {
        let batch = records(hosts, 1_000);
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(hosts), &batch, |b, batch| {
            b.iter(|| {
                let mut graph = Aggregator::new();
                for record in batch {
                    black_box(graph.apply(record.clone()).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, ingest_benchmark, apply_benchmark);
criterion_main!(benches);
