use blobcache::DiskCache;
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;

const VALUE: [u8; 1024] = [0x5a; 1024];

fn filled(dir: &std::path::Path, entries: u64, max_size: u64) -> DiskCache {
    let cache = DiskCache::open(dir, max_size).unwrap();
    for i in 0..entries {
        cache
            .put(&format!("key-{i}"), |w| w.write_all(&VALUE))
            .unwrap();
    }
    cache
}

fn bench_put(c: &mut Criterion) {
    c.bench_function("disk_cache_put_1k", |b| {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 64 * 1024 * 1024).unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            cache
                .put(&format!("key-{i}"), |w| {
                    w.write_all(std::hint::black_box(&VALUE))
                })
                .unwrap();
        })
    });
}

fn bench_get_hit(c: &mut Criterion) {
    c.bench_function("disk_cache_get_hit", |b| {
        let dir = tempfile::tempdir().unwrap();
        let cache = filled(dir.path(), 256, 64 * 1024 * 1024);
        let mut rng = StdRng::seed_from_u64(42);
        b.iter(|| {
            let key = format!("key-{}", rng.random_range(0..256u64));
            let _ = std::hint::black_box(cache.get_bytes(&key).unwrap());
        })
    });
}

fn bench_eviction_churn(c: &mut Criterion) {
    c.bench_function("disk_cache_eviction_churn", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let cache = filled(dir.path(), 64, 64 * 1024);
                (dir, cache)
            },
            |(_dir, cache)| {
                for i in 0..128u64 {
                    cache
                        .put(&format!("churn-{i}"), |w| w.write_all(&VALUE))
                        .unwrap();
                }
            },
            BatchSize::PerIteration,
        )
    });
}

fn bench_recovery(c: &mut Criterion) {
    c.bench_function("disk_cache_reopen_256", |b| {
        let dir = tempfile::tempdir().unwrap();
        filled(dir.path(), 256, 64 * 1024 * 1024).close().unwrap();
        b.iter(|| {
            let cache = DiskCache::open(dir.path(), 64 * 1024 * 1024).unwrap();
            std::hint::black_box(cache.len());
            cache.close().unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_put,
    bench_get_hit,
    bench_eviction_churn,
    bench_recovery
);
criterion_main!(benches);
