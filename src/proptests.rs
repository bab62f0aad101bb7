use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

type Model = BTreeMap<ArtKey, BTreeSet<RowId>>;

fn validate_tree(art: &Art, model: &Model) {
    let issues = art.verify_integrity();
    assert!(issues.is_empty(), "integrity issues: {issues:?}");

    let mut scanned = Vec::new();
    assert!(art.range_scan(Bound::Unbounded, Bound::Unbounded, usize::MAX, &mut scanned));
    let expected: Vec<RowId> = model.values().flatten().copied().collect();
    assert_eq!(scanned, expected, "full scan must list every row id in key order");

    if model.is_empty() {
        assert!(art.is_empty());
        assert_eq!(art.memory_stats().node_count(), 0, "empty index must free every node");
    }
}

fn row_id_strategy() -> impl Strategy<Value = RowId> {
    prop_oneof![
        3 => 0i64..48,
        1 => 0i64..MAX_ROW_ID_LOCAL,
    ]
}

/// Few keys and small row ids, so that gates grow, shrink and collapse often.
#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 50)]
    Insert(
        #[proptest(strategy = "0u16..24")] u16,
        #[proptest(strategy = "row_id_strategy()")] RowId,
    ),
    #[proptest(weight = 30)]
    Erase(
        #[proptest(strategy = "0u16..24")] u16,
        #[proptest(strategy = "row_id_strategy()")] RowId,
    ),
    #[proptest(weight = 15)]
    Lookup(#[proptest(strategy = "0u16..24")] u16),
    #[proptest(weight = 2)]
    Vacuum,
    /// Rewrite every gate as a legacy chain, as writing an old image does.
    #[proptest(weight = 3)]
    Downgrade,
}

fn small_segments() -> Config {
    Config {
        slots_per_segment: 8,
        vacuum_threshold: 0.9,
        ..Config::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence(ops in prop::collection::vec(any::<Op>(), 0..=600)) {
        let mut art = Art::with_config(small_segments());
        let mut model = Model::new();

        for op in ops {
            match op {
                Op::Insert(k, row_id) => {
                    let key = ArtKey::encode(&k);
                    let inserted = art.insert(&key, row_id).unwrap();
                    prop_assert_eq!(inserted, model.entry(key).or_default().insert(row_id));
                }
                Op::Erase(k, row_id) => {
                    let key = ArtKey::encode(&k);
                    art.erase(&key, row_id).unwrap();
                    if let Some(set) = model.get_mut(&key) {
                        set.remove(&row_id);
                        if set.is_empty() {
                            model.remove(&key);
                        }
                    }
                }
                Op::Lookup(k) => {
                    let key = ArtKey::encode(&k);
                    let mut got = Vec::new();
                    prop_assert!(art.lookup(&key, usize::MAX, &mut got));
                    got.sort_unstable();
                    let expected: Vec<RowId> = model
                        .get(&key)
                        .map(|s| s.iter().copied().collect())
                        .unwrap_or_default();
                    prop_assert_eq!(got, expected);
                }
                Op::Vacuum => {
                    art.vacuum().unwrap();
                }
                Op::Downgrade => {
                    art.transform_gates_to_deprecated().unwrap();
                }
            }
        }

        validate_tree(&art, &model);
    }

    #[test]
    fn prop_bulk_construct_matches_inserts(
        pairs in prop::collection::btree_set((0u32..200, row_id_strategy()), 0..400)
    ) {
        let mut model = Model::new();
        for &(k, row_id) in &pairs {
            model.entry(ArtKey::encode(&k)).or_default().insert(row_id);
        }
        let mut keys = Vec::new();
        let mut row_ids = Vec::new();
        for (key, set) in &model {
            for &row_id in set {
                keys.push(key.clone());
                row_ids.push(row_id);
            }
        }

        let mut built = Art::new();
        built.construct_from_sorted(&keys, &row_ids).unwrap();
        validate_tree(&built, &model);

        let mut inserted = Art::new();
        for (key, &row_id) in keys.iter().zip(&row_ids).rev() {
            inserted.insert(key, row_id).unwrap();
        }
        let a = built.serialize(StorageFormat::Nested).unwrap();
        let b = inserted.serialize(StorageFormat::Nested).unwrap();
        let reloaded_a = Art::deserialize(&a, Config::default()).unwrap();
        let reloaded_b = Art::deserialize(&b, Config::default()).unwrap();
        validate_tree(&reloaded_a, &model);
        validate_tree(&reloaded_b, &model);
    }

    #[test]
    fn prop_merge_is_union(
        left in prop::collection::btree_set((0u16..30, 0i64..500), 0..200),
        right in prop::collection::btree_set((0u16..30, 0i64..500), 0..200),
    ) {
        let mut model = Model::new();
        let mut a = Art::new();
        let mut b = Art::with_config(small_segments());
        for &(k, row_id) in &left {
            a.insert(&ArtKey::encode(&k), row_id).unwrap();
            model.entry(ArtKey::encode(&k)).or_default().insert(row_id);
        }
        for &(k, row_id) in &right {
            b.insert(&ArtKey::encode(&k), row_id).unwrap();
            model.entry(ArtKey::encode(&k)).or_default().insert(row_id);
        }
        // Half the time the source holds legacy leaves.
        if left.len() % 2 == 0 {
            b.transform_gates_to_deprecated().unwrap();
        }

        a.merge(&b).unwrap();
        validate_tree(&a, &model);
    }

    #[test]
    fn prop_legacy_image_round_trip(
        pairs in prop::collection::btree_set((0u8..16, 0i64..10_000), 0..300)
    ) {
        let mut model = Model::new();
        let mut art = Art::new();
        for &(k, row_id) in &pairs {
            art.insert(&ArtKey::encode(&k), row_id).unwrap();
            model.entry(ArtKey::encode(&k)).or_default().insert(row_id);
        }

        let image = art.serialize(StorageFormat::Legacy).unwrap();
        let mut loaded = Art::deserialize(&image, Config::default()).unwrap();
        validate_tree(&loaded, &model);

        // Mutating every key migrates all legacy leaves.
        for key in model.keys() {
            loaded.insert(key, MAX_ROW_ID_LOCAL - 1).unwrap();
        }
        prop_assert_eq!(loaded.memory_stats().leaf_count, 0);
        for set in model.values_mut() {
            set.insert(MAX_ROW_ID_LOCAL - 1);
        }
        validate_tree(&loaded, &model);
    }
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

#[test]
fn exhaustive_row_id_insert_order() {
    // Row ids sharing 7, 6 and 0 leading bytes with each other.
    let row_ids: Vec<RowId> = vec![1, 2, 3, 256, 257, 1 << 40];
    let key = ArtKey::encode("k");

    for_each_permutation(&row_ids, |perm| {
        let mut art = Art::new();
        let mut model = Model::new();
        for row_id in perm {
            assert!(art.insert(&key, row_id).unwrap());
            model.entry(key.clone()).or_default().insert(row_id);
        }
        validate_tree(&art, &model);
    });
}

#[test]
fn exhaustive_row_id_erase_order() {
    let row_ids: Vec<RowId> = vec![1, 2, 3, 256, 257, 1 << 40];
    let key = ArtKey::encode("k");

    let mut base = Art::new();
    let mut base_model = Model::new();
    for &row_id in &row_ids {
        base.insert(&key, row_id).unwrap();
        base_model.entry(key.clone()).or_default().insert(row_id);
    }
    let image = base.serialize(StorageFormat::Nested).unwrap();

    for_each_permutation(&row_ids, |perm| {
        let mut art = Art::deserialize(&image, Config::default()).unwrap();
        let mut model = base_model.clone();
        for row_id in perm {
            art.erase(&key, row_id).unwrap();
            let set = model.get_mut(&key).unwrap();
            set.remove(&row_id);
            if set.is_empty() {
                model.remove(&key);
            }
            validate_tree(&art, &model);
        }
        assert!(art.is_empty());
    });
}

#[test]
fn random_workload_with_periodic_vacuum() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let mut art = Art::with_config(small_segments());
    let mut model = Model::new();
    let mut live: Vec<(u32, RowId)> = Vec::new();

    for round in 0..20 {
        for _ in 0..500 {
            let k = rng.gen_range(0..64u32);
            let row_id = rng.gen_range(0..1_000_000);
            if art.insert(&ArtKey::encode(&k), row_id).unwrap() {
                live.push((k, row_id));
                model.entry(ArtKey::encode(&k)).or_default().insert(row_id);
            }
        }
        live.shuffle(&mut rng);
        for (k, row_id) in live.drain(..live.len() / 2).collect::<Vec<_>>() {
            let key = ArtKey::encode(&k);
            art.erase(&key, row_id).unwrap();
            let set = model.get_mut(&key).unwrap();
            set.remove(&row_id);
            if set.is_empty() {
                model.remove(&key);
            }
        }
        if round % 3 == 0 {
            art.vacuum().unwrap();
        }
        validate_tree(&art, &model);
    }
}
