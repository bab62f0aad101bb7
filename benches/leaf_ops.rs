//! Benchmarks for leaf operations: gate inserts, lookups, legacy
//! migration and vacuum.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nested_art::{Art, ArtKey, Config, RowId, StorageFormat};
use std::collections::BTreeMap;

fn generate_pairs(keys: usize, per_key: usize) -> Vec<(ArtKey, RowId)> {
    (0..keys)
        .flat_map(|k| {
            let key = ArtKey::encode(format!("user:{k:06}").as_str());
            (0..per_key).map(move |i| (key.clone(), (i * keys + k) as RowId))
        })
        .collect()
}

fn build(pairs: &[(ArtKey, RowId)]) -> Art {
    let mut art = Art::new();
    for (key, row_id) in pairs {
        art.insert(key, *row_id).unwrap();
    }
    art
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for per_key in [1, 8, 256] {
        let pairs = generate_pairs(20_000 / per_key, per_key);

        group.bench_with_input(BenchmarkId::new("Art", per_key), &pairs, |b, pairs| {
            b.iter(|| black_box(build(pairs)));
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", per_key), &pairs, |b, pairs| {
            b.iter(|| {
                let mut map: BTreeMap<ArtKey, Vec<RowId>> = BTreeMap::new();
                for (key, row_id) in pairs {
                    map.entry(key.clone()).or_default().push(*row_id);
                }
                black_box(map)
            });
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for per_key in [1, 8, 256] {
        let pairs = generate_pairs(20_000 / per_key, per_key);
        let art = build(&pairs);

        group.bench_with_input(BenchmarkId::new("Art", per_key), &pairs, |b, pairs| {
            let mut out = Vec::new();
            b.iter(|| {
                let mut total = 0;
                for (key, _) in pairs.iter().step_by(per_key) {
                    out.clear();
                    art.lookup(key, usize::MAX, &mut out);
                    total += out.len();
                }
                black_box(total)
            });
        });
    }

    group.finish();
}

fn bench_legacy(c: &mut Criterion) {
    let pairs = generate_pairs(1_000, 16);
    let image = build(&pairs).serialize(StorageFormat::Legacy).unwrap();

    c.bench_function("legacy/load", |b| {
        b.iter(|| black_box(Art::deserialize(&image, Config::default()).unwrap()));
    });

    c.bench_function("legacy/migrate_on_insert", |b| {
        b.iter(|| {
            let mut art = Art::deserialize(&image, Config::default()).unwrap();
            for (key, _) in pairs.iter().step_by(16) {
                art.insert(key, 1 << 40).unwrap();
            }
            black_box(art)
        });
    });
}

fn bench_vacuum(c: &mut Criterion) {
    let pairs = generate_pairs(5_000, 4);

    c.bench_function("vacuum/after_half_erase", |b| {
        b.iter(|| {
            let mut art = build(&pairs);
            for (key, row_id) in pairs.iter().step_by(2) {
                art.erase(key, *row_id).unwrap();
            }
            black_box(art.vacuum().unwrap())
        });
    });
}

criterion_group!(benches, bench_insert, bench_lookup, bench_legacy, bench_vacuum);
criterion_main!(benches);
