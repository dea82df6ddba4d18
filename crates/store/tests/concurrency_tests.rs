//! Concurrent training and reading on one store
//!
//! A writer bulk-inserts while a reader samples and polls stats; the
//! reader must never observe a shrinking prefix count, and sampled
//! totals on a quiescent prefix must be stable across readers.

use markgen_core::{EngineConfig, TenantId, TrainingRecord};
use markgen_store::ChainStore;
use std::sync::Arc;

#[test]
fn test_concurrent_train_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::for_testing(dir.path(), dir.path());
    let store = ChainStore::open(TenantId::new("t1"), &config);

    // Reader's own prefix set is disjoint from the writer's
    store.add_record("r0 r1", "x", 1).unwrap();
    store.add_record("r0 r1", "y", 1).unwrap();

    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..10_000u32 {
                store
                    .add_record(&format!("w{} w{}", i, i), "z", 1)
                    .unwrap();
            }
        })
    };

    let reader = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            let mut last_count = 0usize;
            for _ in 0..10_000 {
                assert!(store.get_next("r0 r1").is_some());
                let count = store.stats().prefix_count;
                assert!(count >= last_count, "prefix count went backwards");
                last_count = count;
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    // writer prefixes + the reader prefix
    assert_eq!(store.stats().prefix_count, 10_001);
}

#[test]
fn test_two_readers_agree_on_total_weight() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::for_testing(dir.path(), dir.path());
    let store = ChainStore::open(TenantId::new("t1"), &config);
    store.add_record("a b", "c", 2).unwrap();
    store.add_record("a b", "d", 3).unwrap();

    let observe = |store: &Arc<ChainStore>| {
        let store = Arc::clone(store);
        std::thread::spawn(move || {
            let mut totals = Vec::with_capacity(1000);
            for _ in 0..1000 {
                let exported = store.export();
                totals.push(exported[0].total_weight);
            }
            totals
        })
    };

    let a = observe(&store);
    let b = observe(&store);
    let totals_a = a.join().unwrap();
    let totals_b = b.join().unwrap();
    assert!(totals_a.iter().all(|&t| t == 5));
    assert!(totals_b.iter().all(|&t| t == 5));
}

#[test]
fn test_concurrent_samplers_on_disjoint_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::for_testing(dir.path(), dir.path());
    let store = ChainStore::open(TenantId::new("t1"), &config);

    let batch: Vec<TrainingRecord> = (0..64)
        .flat_map(|p| {
            (0..4).map(move |s| {
                TrainingRecord::new(format!("p{} p{}", p, p), format!("s{}", s), 1 + s as u64)
            })
        })
        .collect();
    assert_eq!(store.add_batch(&batch).inserted, 256);

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..2_000usize {
                    let p = (worker * 8 + i) % 64;
                    let key = format!("p{} p{}", p, p);
                    assert!(store.get_next(&key).is_some());
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
