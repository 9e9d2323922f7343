//! Log tailing benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use logship_bench::source_with_documents;
use logship_core::Tick;
use logship_protocol::{encode_response, FilterConfig, Response};
use logship_source::{LogTailer, SnapshotProvider, SourceConfig};
use std::time::Duration;

const DOCUMENTS: usize = 5_000;

fn bench_fetch_chunk(c: &mut Criterion) {
    let db = source_with_documents("bench", DOCUMENTS, 64);
    let tailer = LogTailer::new(db, SourceConfig::default());

    let mut group = c.benchmark_group("fetch_chunk");
    for chunk_size in [512u64, 16 * 1024, 1024 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk_size), &chunk_size, |b, &size| {
            b.iter(|| {
                let chunk = tailer.fetch_chunk(black_box(&Tick::zero()), size).unwrap();
                black_box(chunk);
            });
        });
    }
    group.finish();
}

fn bench_drain_log(c: &mut Criterion) {
    let db = source_with_documents("bench", DOCUMENTS, 64);
    let entries = db.log().len() as u64;
    let tailer = LogTailer::new(db, SourceConfig::default());

    let mut group = c.benchmark_group("drain_log");
    group.throughput(Throughput::Elements(entries));
    group.bench_function("16k_chunks_encoded", |b| {
        b.iter(|| {
            let mut cursor = Tick::zero();
            loop {
                let chunk = tailer.fetch_chunk(&cursor, 16 * 1024).unwrap();
                let Some(last) = chunk.last_included_tick.clone() else {
                    break;
                };
                black_box(encode_response(&Response::Chunk(chunk)).unwrap());
                cursor = last;
            }
        });
    });
    group.finish();
}

fn bench_inventory(c: &mut Criterion) {
    let db = source_with_documents("bench", DOCUMENTS, 64);
    let provider = SnapshotProvider::new(db, Duration::from_secs(60), 1000);

    c.bench_function("inventory_capture", |b| {
        b.iter(|| {
            let inventory = provider.inventory(&FilterConfig::default());
            provider.release(&inventory.snapshot_id);
            black_box(inventory.last_log_tick);
        });
    });
}

criterion_group!(benches, bench_fetch_chunk, bench_drain_log, bench_inventory);
criterion_main!(benches);
