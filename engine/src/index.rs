//! Learned index maintenance: lazy rebuilds and snapshot publication.
//!
//! Writes go straight to the backing store and only flip the dirty flag.
//! The next read pays for one full O(n) retrain, which amortizes training
//! across every write since the previous rebuild. A rebuild assembles a
//! brand-new snapshot and swaps the published `Arc`; readers that already
//! cloned the old one finish against it undisturbed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::LearnedIndexConfig;
use crate::error::{IndexError, Result};
use crate::metrics;
use crate::rmi_core::{IndexSnapshot, RangeIter, SearchOutcome};
use crate::store::BackingStore;
use crate::trainer::Trainer;
use crate::{Key, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Fresh,
    Dirty,
}

/// Observability snapshot returned by [`LearnedIndex::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub segment_count: usize,
    pub avg_error_bound: f64,
    pub max_error_bound: u64,
    pub root_error_bound: u64,
    pub dirty: bool,
    pub keys: usize,
    pub generation: u64,
    pub rebuilds: u64,
    pub failed_rebuilds: u64,
    pub segments_over_warn_bound: usize,
}

/// Learned index over an external sorted key set.
///
/// Writers are serialized by the internal store lock. Readers only touch
/// the store lock when the snapshot is dirty and they have to rebuild.
pub struct LearnedIndex<S: BackingStore> {
    store: Mutex<S>,
    /// The published snapshot; swapping this `Arc` is the only publication step.
    snapshot: RwLock<Arc<IndexSnapshot>>,
    dirty: AtomicBool,
    generation: AtomicU64,
    rebuilds: AtomicU64,
    failed_rebuilds: AtomicU64,
    trainer: Trainer,
    config: LearnedIndexConfig,
}

impl<S: BackingStore> LearnedIndex<S> {
    /// Empty, dirty index: the first read builds a snapshot even when the
    /// store holds nothing.
    pub fn new(store: S, config: LearnedIndexConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| IndexError::Config(format!("{:#}", e)))?;
        Ok(Self {
            store: Mutex::new(store),
            snapshot: RwLock::new(Arc::new(IndexSnapshot::empty(0))),
            dirty: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            failed_rebuilds: AtomicU64::new(0),
            trainer: Trainer::from_config(&config),
            config,
        })
    }

    pub fn with_defaults(store: S) -> Result<Self> {
        Self::new(store, LearnedIndexConfig::default())
    }

    /// Append `entries` to `store` and build once.
    pub fn bulk_load(
        store: S,
        config: LearnedIndexConfig,
        entries: impl IntoIterator<Item = (Key, Position)>,
    ) -> Result<Self> {
        let index = Self::new(store, config)?;
        index.insert_batch(entries)?;
        index.ensure_fresh()?;
        Ok(index)
    }

    pub fn config(&self) -> &LearnedIndexConfig {
        &self.config
    }

    /// Durable append through the store, then mark stale. No retraining here.
    pub fn insert_batch(&self, entries: impl IntoIterator<Item = (Key, Position)>) -> Result<usize> {
        let mut store = self.store.lock();
        let mut appended = 0usize;
        for (key, position) in entries {
            if let Err(e) = store.append(key, position) {
                if appended > 0 {
                    self.dirty.store(true, Ordering::Release);
                }
                return Err(IndexError::Store(e));
            }
            appended += 1;
        }
        if appended > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        debug!(appended, "batch appended, snapshot marked stale");
        Ok(appended)
    }

    pub fn insert(&self, key: Key, position: Position) -> Result<()> {
        self.insert_batch(std::iter::once((key, position)))
            .map(|_| ())
    }

    /// Tombstone `key` in the store; the next rebuild drops it.
    pub fn delete(&self, key: Key) -> Result<bool> {
        let mut store = self.store.lock();
        let removed = store.tombstone(key).map_err(IndexError::Store)?;
        self.dirty.store(true, Ordering::Release);
        Ok(removed)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn state(&self) -> IndexState {
        if self.is_dirty() {
            IndexState::Dirty
        } else {
            IndexState::Fresh
        }
    }

    /// Force the next read to rebuild.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Rebuild if any write happened since the last publish.
    ///
    /// Returns whether a rebuild ran.
    pub fn ensure_fresh(&self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        let store = self.store.lock();
        // Another reader may have rebuilt while we waited.
        if !self.is_dirty() {
            return Ok(false);
        }
        self.rebuild_locked(&store)?;
        Ok(true)
    }

    /// Unconditional full retrain from a sorted store scan.
    pub fn rebuild(&self) -> Result<Arc<IndexSnapshot>> {
        let store = self.store.lock();
        self.rebuild_locked(&store)
    }

    #[instrument(level = "info", skip(self, store), fields(generation = self.generation.load(Ordering::Relaxed) + 1))]
    fn rebuild_locked(&self, store: &S) -> Result<Arc<IndexSnapshot>> {
        let started = Instant::now();
        let timer = metrics::RMI_REBUILD_DURATION_SECONDS.start_timer();

        let result = self.train_from_store(store);
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.failed_rebuilds.fetch_add(1, Ordering::Relaxed);
                metrics::RMI_REBUILD_FAILURES_TOTAL.inc();
                error!(error = %e, "rebuild aborted, keeping previous snapshot");
                return Err(e);
            }
        };

        let snapshot = Arc::new(snapshot);
        self.publish(Arc::clone(&snapshot));
        timer.observe_duration();

        info!(
            keys = snapshot.len(),
            segments = snapshot.segment_count(),
            generation = snapshot.generation(),
            duration_ms = started.elapsed().as_millis() as u64,
            "learned index rebuilt"
        );
        Ok(snapshot)
    }

    fn train_from_store(&self, store: &S) -> Result<IndexSnapshot> {
        let scan = store.scan_sorted().map_err(IndexError::Store)?;
        let (lower, _) = scan.size_hint();
        let mut keys: Vec<Key> = Vec::with_capacity(lower);
        let mut positions: Vec<Position> = Vec::with_capacity(lower);
        for (key, position) in scan {
            if let Some(&previous) = keys.last() {
                if key < previous {
                    return Err(IndexError::CorruptSnapshot {
                        position: keys.len() as Position,
                        previous,
                        key,
                    });
                }
            }
            keys.push(key);
            positions.push(position);
        }

        let generation = self.generation.load(Ordering::Acquire) + 1;
        let snapshot = self.trainer.train_sorted(keys, positions, generation)?;
        if self.config.verify_after_rebuild {
            snapshot.verify_error_bounds()?;
        }
        Ok(snapshot)
    }

    /// Swap in `snapshot` and clear the dirty flag. Callers hold the store lock.
    pub(crate) fn publish(&self, snapshot: Arc<IndexSnapshot>) {
        let over_warn = snapshot
            .segments()
            .iter()
            .filter(|s| s.max_error() > self.config.warn_error_bound)
            .count();
        if over_warn > 0 {
            warn!(
                segments = over_warn,
                threshold = self.config.warn_error_bound,
                "published snapshot has segments above the warning bound"
            );
        }
        metrics::RMI_SEGMENTS.set(snapshot.segment_count() as f64);
        metrics::RMI_EPSILON_MAX.set(snapshot.max_error_bound() as f64);

        self.generation
            .store(snapshot.generation(), Ordering::Release);
        *self.snapshot.write() = snapshot;
        self.dirty.store(false, Ordering::Release);
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        metrics::RMI_REBUILDS_TOTAL.inc();
    }

    /// Run `f` with exclusive access to the backing store.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut store = self.store.lock();
        f(&mut store)
    }

    /// Currently published snapshot, without refreshing it.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Refresh if needed, then return the published snapshot.
    pub fn fresh_snapshot(&self) -> Result<Arc<IndexSnapshot>> {
        self.ensure_fresh()?;
        Ok(self.snapshot())
    }

    pub fn point_query(&self, key: Key) -> Result<Option<Position>> {
        let snapshot = self.fresh_snapshot()?;
        metrics::RMI_LOOKUPS_TOTAL.inc();
        match snapshot.search(key) {
            SearchOutcome::Found(hit) => Ok(Some(hit.position)),
            SearchOutcome::Absent => {
                metrics::RMI_MISSES_TOTAL.inc();
                Ok(None)
            }
            SearchOutcome::BoundViolated {
                segment,
                window,
                rank,
                ..
            } => {
                error!(
                    key,
                    segment,
                    rank,
                    window_lo = window.0,
                    window_hi = window.1,
                    "key found outside its model's error window, scheduling rebuild"
                );
                // The published models are unsound; retrain on the next read.
                self.mark_dirty();
                Err(IndexError::InvariantViolation {
                    key,
                    segment,
                    detail: format!("rank {} outside window [{}, {}]", rank, window.0, window.1),
                })
            }
        }
    }

    pub fn range_query(&self, low: Key, high: Key) -> Result<RangeIter> {
        Ok(self.fresh_snapshot()?.range_query(low, high))
    }

    pub fn count_range(&self, low: Key, high: Key) -> Result<usize> {
        Ok(self.range_query(low, high)?.count())
    }

    /// Resolve `key` and fetch its bytes from the backing store.
    pub fn get_value(&self, key: Key) -> Result<Option<Vec<u8>>> {
        match self.point_query(key)? {
            Some(position) => self.store.lock().get(position).map_err(IndexError::Store),
            None => Ok(None),
        }
    }

    /// Entries in the published snapshot.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        IndexStats {
            segment_count: snapshot.segment_count(),
            avg_error_bound: snapshot.avg_error_bound(),
            max_error_bound: snapshot.max_error_bound(),
            root_error_bound: snapshot.root().max_error(),
            dirty: self.is_dirty(),
            keys: snapshot.len(),
            generation: snapshot.generation(),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            failed_rebuilds: self.failed_rebuilds.load(Ordering::Relaxed),
            segments_over_warn_bound: snapshot
                .segments()
                .iter()
                .filter(|s| s.max_error() > self.config.warn_error_bound)
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn index_with(entries: &[(Key, Position)]) -> LearnedIndex<MemoryStore> {
        LearnedIndex::bulk_load(
            MemoryStore::new(),
            LearnedIndexConfig::default(),
            entries.iter().copied(),
        )
        .unwrap()
    }

    #[test]
    fn test_starts_dirty_and_builds_empty_snapshot() {
        let index = LearnedIndex::with_defaults(MemoryStore::new()).unwrap();
        assert_eq!(index.state(), IndexState::Dirty);
        assert_eq!(index.point_query(1).unwrap(), None);
        assert_eq!(index.state(), IndexState::Fresh);
        assert_eq!(index.stats().segment_count, 0);
        assert_eq!(index.stats().generation, 1);
    }

    #[test]
    fn test_write_marks_dirty_without_retraining() {
        let index = index_with(&[(1, 0), (2, 1)]);
        let generation = index.stats().generation;
        index.insert(3, 2).unwrap();
        assert!(index.is_dirty());
        assert_eq!(index.snapshot().generation(), generation);
        assert_eq!(index.point_query(3).unwrap(), Some(2));
        assert_eq!(index.snapshot().generation(), generation + 1);
    }

    #[test]
    fn test_delete_excluded_after_rebuild() {
        let index = index_with(&[(10, 0), (20, 1), (30, 2)]);
        assert!(index.delete(20).unwrap());
        assert_eq!(index.point_query(20).unwrap(), None);
        assert_eq!(index.len(), 2);
        assert!(!index.delete(20).unwrap());
        assert!(index.is_dirty());
    }

    fn publish_understated(index: &LearnedIndex<MemoryStore>) {
        let current = index.snapshot();
        let segments = current
            .segments()
            .iter()
            .map(|m| {
                crate::rmi_core::LinearModel::from_parts(m.slope(), m.intercept(), m.start(), m.end(), 0)
                    .unwrap()
            })
            .collect();
        let stale = IndexSnapshot::from_parts(
            *current.root(),
            segments,
            current.keys().to_vec(),
            current.positions().to_vec(),
            current.generation() + 1,
        )
        .unwrap();
        index.with_store(|_| index.publish(Arc::new(stale)));
    }

    #[test]
    fn test_bound_violation_fails_loudly_then_heals() {
        let mut config = LearnedIndexConfig::default();
        config.partition = crate::trainer::PartitionKind::Fixed;
        config.segment_count = 4;
        let entries: Vec<(Key, Position)> = (0..500i64).map(|i| (i * i, i as u64)).collect();
        let index = LearnedIndex::bulk_load(MemoryStore::new(), config, entries.clone()).unwrap();
        assert!(index.stats().max_error_bound > 0);
        publish_understated(&index);
        assert_eq!(index.state(), IndexState::Fresh);

        let mut violations = 0;
        for &(key, position) in &entries {
            match index.point_query(key) {
                Ok(found) => assert_eq!(found, Some(position)),
                Err(IndexError::InvariantViolation { .. }) => {
                    violations += 1;
                    assert!(index.is_dirty());
                    assert_eq!(index.point_query(key).unwrap(), Some(position));
                }
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert_eq!(violations, 1);
        index.snapshot().verify_error_bounds().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = LearnedIndexConfig::default();
        config.epsilon = 0;
        assert!(matches!(
            LearnedIndex::new(MemoryStore::new(), config),
            Err(IndexError::Config(_))
        ));
    }

    #[test]
    fn test_get_value_resolves_through_store() {
        let index = LearnedIndex::with_defaults(MemoryStore::new()).unwrap();
        index.insert(5, 0).unwrap();
        index.with_store(|s| s.put_value(0, b"five".to_vec()));
        assert_eq!(index.get_value(5).unwrap(), Some(b"five".to_vec()));
        assert_eq!(index.get_value(6).unwrap(), None);
    }
}
