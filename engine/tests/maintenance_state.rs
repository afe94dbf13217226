//! Dirty/fresh transitions, rebuild failure handling and snapshot isolation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use rmidb_engine::store::BackingStore;
use rmidb_engine::{
    spawn_background_refresh, spawn_configured_refresh, IndexError, IndexState, Key, LearnedIndex,
    LearnedIndexConfig, MemoryStore, Position,
};

/// Store that hands back entries exactly in append order.
#[derive(Default)]
struct AppendOrderStore {
    entries: Vec<(Key, Position)>,
    fail_scans: bool,
}

impl BackingStore for AppendOrderStore {
    fn scan_sorted(&self) -> anyhow::Result<Box<dyn Iterator<Item = (Key, Position)> + '_>> {
        if self.fail_scans {
            return Err(anyhow!("store offline"));
        }
        Ok(Box::new(self.entries.iter().copied()))
    }

    fn append(&mut self, key: Key, position: Position) -> anyhow::Result<()> {
        self.entries.push((key, position));
        Ok(())
    }

    fn tombstone(&mut self, key: Key) -> anyhow::Result<bool> {
        let before = self.entries.len();
        self.entries.retain(|&(k, _)| k != key);
        Ok(self.entries.len() != before)
    }

    fn get(&self, _position: Position) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn row_count(&self) -> anyhow::Result<u64> {
        Ok(self.entries.len() as u64)
    }
}

fn sequential_index(n: i64) -> LearnedIndex<MemoryStore> {
    LearnedIndex::bulk_load(
        MemoryStore::new(),
        LearnedIndexConfig::default(),
        (0..n).map(|i| (i * 10, i as u64)),
    )
    .unwrap()
}

#[test]
fn test_state_transitions() {
    let index = LearnedIndex::with_defaults(MemoryStore::new()).unwrap();
    assert_eq!(index.state(), IndexState::Dirty);

    assert!(index.ensure_fresh().unwrap());
    assert_eq!(index.state(), IndexState::Fresh);

    index.insert_batch(vec![(1, 0), (2, 1)]).unwrap();
    assert_eq!(index.state(), IndexState::Dirty);
    // Writes never retrain on their own.
    assert_eq!(index.snapshot().len(), 0);

    index.rebuild().unwrap();
    assert_eq!(index.state(), IndexState::Fresh);
    assert_eq!(index.snapshot().len(), 2);

    index.delete(1).unwrap();
    assert_eq!(index.state(), IndexState::Dirty);
    assert_eq!(index.point_query(1).unwrap(), None);
    assert_eq!(index.state(), IndexState::Fresh);
}

#[test]
fn test_ensure_fresh_is_idempotent() {
    let index = sequential_index(1_000);
    let scans = index.with_store(|s| s.scan_count());
    let generation = index.stats().generation;

    assert!(!index.ensure_fresh().unwrap());
    assert!(!index.ensure_fresh().unwrap());
    assert_eq!(index.with_store(|s| s.scan_count()), scans);
    assert_eq!(index.stats().generation, generation);

    let before: Vec<_> = index.range_query(0, 5_000).unwrap().collect();
    let after: Vec<_> = index.range_query(0, 5_000).unwrap().collect();
    assert_eq!(before, after);
}

#[test]
fn test_many_writes_one_rebuild() {
    let index = sequential_index(10);
    let scans = index.with_store(|s| s.scan_count());
    for i in 10..110i64 {
        index.insert(i * 10, i as u64).unwrap();
    }
    assert_eq!(index.with_store(|s| s.scan_count()), scans);

    assert_eq!(index.point_query(1_000).unwrap(), Some(100));
    assert_eq!(index.point_query(1_090).unwrap(), Some(109));
    assert_eq!(index.with_store(|s| s.scan_count()), scans + 1);
}

#[test]
fn test_unordered_scan_keeps_previous_snapshot() {
    let index = LearnedIndex::bulk_load(
        AppendOrderStore::default(),
        LearnedIndexConfig::default(),
        vec![(10, 0), (20, 1), (30, 2)],
    )
    .unwrap();
    let published = index.snapshot();

    // Appending a smaller key makes the scan non-ascending.
    index.insert(5, 3).unwrap();
    match index.point_query(20) {
        Err(IndexError::CorruptSnapshot { previous, key, .. }) => {
            assert_eq!(previous, 30);
            assert_eq!(key, 5);
        }
        other => panic!("expected CorruptSnapshot, got {:?}", other),
    }

    assert!(Arc::ptr_eq(&published, &index.snapshot()));
    assert_eq!(index.state(), IndexState::Dirty);
    assert_eq!(index.stats().failed_rebuilds, 1);
    assert_eq!(index.snapshot().point_query(20).unwrap(), Some(1));

    // Repair the store; the next read rebuilds successfully.
    index.delete(5).unwrap();
    assert_eq!(index.point_query(20).unwrap(), Some(1));
    assert_eq!(index.state(), IndexState::Fresh);
}

#[test]
fn test_store_failure_propagates() {
    let index = LearnedIndex::bulk_load(
        AppendOrderStore::default(),
        LearnedIndexConfig::default(),
        vec![(1, 0), (2, 1)],
    )
    .unwrap();
    index.insert(3, 2).unwrap();
    index.with_store(|s| s.fail_scans = true);

    let err = index.point_query(1).unwrap_err();
    assert!(matches!(err, IndexError::Store(_)));
    assert!(std::error::Error::source(&err).is_some());
    assert!(index.is_dirty());
    assert_eq!(index.snapshot().len(), 2);
}

#[test]
fn test_held_snapshot_survives_rebuild() {
    let index = sequential_index(100);
    let old = index.snapshot();
    index.insert_batch((100..200).map(|i| (i * 10, i as u64))).unwrap();
    index.rebuild().unwrap();

    assert_eq!(old.len(), 100);
    assert_eq!(old.point_query(1_500).unwrap(), None);
    assert_eq!(index.point_query(1_500).unwrap(), Some(150));
    assert!(index.snapshot().generation() > old.generation());
}

#[test]
fn test_readers_run_during_rebuilds() {
    let index = Arc::new(sequential_index(20_000));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|t| {
            let index = Arc::clone(&index);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut i = t as i64;
                while !stop.load(Ordering::Relaxed) {
                    let key = (i % 20_000) * 10;
                    assert_eq!(index.point_query(key).unwrap(), Some((i % 20_000) as u64));
                    assert_eq!(index.point_query(key + 5).unwrap(), None);
                    i += 7;
                }
            })
        })
        .collect();

    for round in 0..20i64 {
        let base = 1_000_000 + round * 1_000;
        index
            .insert_batch((0..100).map(|j| (base + j, (base + j) as u64)))
            .unwrap();
        index.rebuild().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(index.len(), 22_000);
    assert_eq!(index.point_query(1_019_099).unwrap(), Some(1_019_099));
}

#[test]
fn test_verify_after_rebuild_publishes_checked_snapshot() {
    let mut config = LearnedIndexConfig::default();
    config.verify_after_rebuild = true;
    let index = LearnedIndex::bulk_load(
        MemoryStore::new(),
        config,
        (0..5_000i64).map(|i| (i * i, i as u64)),
    )
    .unwrap();
    assert_eq!(index.state(), IndexState::Fresh);
    assert_eq!(index.point_query(49 * 49).unwrap(), Some(49));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_refresh_clears_dirty_flag() {
    let mut config = LearnedIndexConfig::default();
    config.maintenance.refresh_interval_ms = 10;
    let index = Arc::new(
        LearnedIndex::bulk_load(MemoryStore::new(), config, (0..100i64).map(|i| (i * 10, i as u64)))
            .unwrap(),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = spawn_configured_refresh(&index, shutdown_rx).expect("refresh interval is set");

    index.insert(5_000, 500).unwrap();
    assert!(index.is_dirty());

    let mut waited = 0;
    while index.is_dirty() && waited < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert!(!index.is_dirty());
    assert_eq!(index.snapshot().point_query(5_000).unwrap(), Some(500));

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_configured_refresh_disabled_by_default() {
    let index = Arc::new(sequential_index(10));
    let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    assert!(spawn_configured_refresh(&index, shutdown_rx).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_explicit_refresh_stops_on_shutdown() {
    let index = Arc::new(sequential_index(100));
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = spawn_background_refresh(Arc::clone(&index), Duration::from_millis(10), shutdown_rx);

    index.delete(50).unwrap();
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
    assert_eq!(index.point_query(50).unwrap(), None);
    assert_eq!(index.point_query(60).unwrap(), Some(6));
}
