//! Object cache and transaction log benchmarks.
//!
//! # Usage
//!
//! ```bash
//! cargo bench --bench cache_benchmark -- --noplot
//! ```

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use ghostdb_core::storage::TxnMeta;
use ghostdb_core::{
    codec, FileLog, ManualDayClock, ObjectCache, ObjectId, PersistentObject, RecordWrite,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn populated_cache(
    count: u64,
) -> (ObjectCache<PersistentObject>, Vec<Arc<PersistentObject>>, Arc<ManualDayClock>) {
    let clock = Arc::new(ManualDayClock::new(0));
    let mut cache = ObjectCache::new(clock.clone());
    let objects: Vec<_> = (0..count)
        .map(|i| {
            let obj = Arc::new(PersistentObject::loaded(
                ObjectId(i),
                "Item",
                ghostdb_core::Tid(1),
                json!({ "n": i }),
            ));
            obj.touch((i % 86_400) as u32);
            cache.set(ObjectId(i), &obj);
            obj
        })
        .collect();
    clock.set(86_399);
    (cache, objects, clock)
}

fn bench_cache_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get");
    for size in [1_000_u64, 100_000] {
        let (cache, _objects, _clock) = populated_cache(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 7919) % size;
                black_box(cache.get(ObjectId(i)))
            });
        });
    }
    group.finish();
}

fn bench_shrink(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_shrink");
    group.sample_size(20);
    for size in [1_000_u64, 10_000] {
        group.bench_with_input(BenchmarkId::new("to_10pct", size), &size, |b, &size| {
            b.iter_batched(
                || populated_cache(size),
                |(mut cache, objects, _clock)| {
                    let report = cache.shrink((size / 10) as usize, 86_400);
                    black_box((report, objects))
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_log_append(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut log = FileLog::create(dir.path().join("bench.glog"))
        .unwrap()
        .with_sync_on_commit(false);
    let state = codec::encode_state("Item", &json!({ "title": "x".repeat(200) })).unwrap();
    let meta = TxnMeta::new("bench", "append");
    let mut oid = 0;

    c.bench_function("log_append_10_records", |b| {
        b.iter(|| {
            let writes: Vec<_> = (0..10)
                .map(|_| {
                    oid += 1;
                    RecordWrite::store(ObjectId(oid), state.clone(), vec![])
                })
                .collect();
            black_box(log.append(&meta, &writes).unwrap())
        });
    });
}

fn bench_log_copy(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut source = FileLog::create(dir.path().join("src.glog"))
        .unwrap()
        .with_sync_on_commit(false);
    let meta = TxnMeta::default();
    for round in 0..200_u64 {
        let state = codec::encode_state("Item", &json!({ "round": round % 5 })).unwrap();
        let writes: Vec<_> = (0..5)
            .map(|i| RecordWrite::store(ObjectId(i), state.clone(), vec![]))
            .collect();
        source.append(&meta, &writes).unwrap();
    }

    let mut group = c.benchmark_group("log_copy");
    group.sample_size(10);
    group.bench_function("1000_records", |b| {
        b.iter_batched(
            || FileLog::create(dir.path().join("dst.glog")).unwrap().with_sync_on_commit(false),
            |mut dest| black_box(dest.copy_transactions_from(&source).unwrap()),
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_cache_get, bench_shrink, bench_log_append, bench_log_copy);
criterion_main!(benches);
