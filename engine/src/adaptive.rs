//! Observed-error monitoring on top of [`LearnedIndex`].
//!
//! Each lookup records how far the model's clamped prediction landed from
//! the true rank. Published models are exact, so this only fires for stale
//! or externally loaded models. Once a segment's observed error exceeds
//! `error_margin * recorded bound`, the lookup is answered from the global
//! fallback and the index is marked dirty so the next read retrains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{IndexError, Result};
use crate::index::LearnedIndex;
use crate::metrics;
use crate::rmi_core::{IndexSnapshot, RangeIter, SearchOutcome};
use crate::store::BackingStore;
use crate::{Key, Position};

#[derive(Debug, Default)]
struct SegmentObservation {
    lookups: AtomicU64,
    max_offset: AtomicU64,
    violations: AtomicU64,
}

impl SegmentObservation {
    #[inline]
    fn record(&self, offset: u64) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.max_offset.fetch_max(offset, Ordering::Relaxed);
    }
}

/// Observations are only meaningful for the snapshot they were taken on.
#[derive(Debug, Default)]
struct ObservationTable {
    generation: u64,
    segments: Vec<SegmentObservation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentErrorStats {
    pub segment: usize,
    pub lookups: u64,
    pub max_observed_error: u64,
    pub recorded_bound: u64,
    pub violations: u64,
}

pub struct AdaptiveIndex<S: BackingStore> {
    inner: Arc<LearnedIndex<S>>,
    table: RwLock<ObservationTable>,
    enabled: bool,
    error_margin: f64,
    triggered: AtomicU64,
}

impl<S: BackingStore> AdaptiveIndex<S> {
    pub fn new(inner: Arc<LearnedIndex<S>>) -> Self {
        let adaptive = inner.config().adaptive.clone();
        Self {
            inner,
            table: RwLock::new(ObservationTable::default()),
            enabled: adaptive.enabled,
            error_margin: adaptive.error_margin,
            triggered: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<LearnedIndex<S>> {
        &self.inner
    }

    /// Rebuilds requested by the monitor so far.
    pub fn triggered_rebuilds(&self) -> u64 {
        self.triggered.load(Ordering::Relaxed)
    }

    pub fn point_query(&self, key: Key) -> Result<Option<Position>> {
        let snapshot = self.inner.fresh_snapshot()?;
        metrics::RMI_LOOKUPS_TOTAL.inc();
        match snapshot.search(key) {
            SearchOutcome::Found(hit) => {
                self.observe(&snapshot, hit.segment, |obs| obs.record(hit.offset));
                Ok(Some(hit.position))
            }
            SearchOutcome::Absent => {
                metrics::RMI_MISSES_TOTAL.inc();
                Ok(None)
            }
            SearchOutcome::BoundViolated {
                segment,
                window,
                rank,
                position,
            } => {
                let model = &snapshot.segments()[segment];
                let observed = rank.abs_diff(model.predict_clamped(key));
                self.observe(&snapshot, segment, |obs| {
                    obs.record(observed);
                    obs.violations.fetch_add(1, Ordering::Relaxed);
                });

                if !self.enabled {
                    self.inner.mark_dirty();
                    return Err(IndexError::InvariantViolation {
                        key,
                        segment,
                        detail: format!(
                            "rank {} outside window [{}, {}]",
                            rank, window.0, window.1
                        ),
                    });
                }

                let allowed = self.error_margin * model.max_error() as f64;
                if observed as f64 > allowed {
                    self.inner.mark_dirty();
                    self.triggered.fetch_add(1, Ordering::Relaxed);
                    metrics::RMI_ADAPTIVE_REBUILDS_TOTAL.inc();
                    warn!(
                        key,
                        segment,
                        observed,
                        recorded_bound = model.max_error(),
                        margin = self.error_margin,
                        "observed error exceeds recorded bound, scheduling rebuild"
                    );
                } else {
                    debug!(key, segment, observed, "bound miss within tolerated margin");
                }
                Ok(Some(position))
            }
        }
    }

    pub fn range_query(&self, low: Key, high: Key) -> Result<RangeIter> {
        self.inner.range_query(low, high)
    }

    pub fn count_range(&self, low: Key, high: Key) -> Result<usize> {
        self.inner.count_range(low, high)
    }

    /// Per-segment observations for the currently published snapshot.
    pub fn segment_stats(&self) -> Vec<SegmentErrorStats> {
        let snapshot = self.inner.snapshot();
        let table = self.table.read();
        if table.generation != snapshot.generation() {
            return Vec::new();
        }
        table
            .segments
            .iter()
            .zip(snapshot.segments())
            .enumerate()
            .map(|(segment, (obs, model))| SegmentErrorStats {
                segment,
                lookups: obs.lookups.load(Ordering::Relaxed),
                max_observed_error: obs.max_offset.load(Ordering::Relaxed),
                recorded_bound: model.max_error(),
                violations: obs.violations.load(Ordering::Relaxed),
            })
            .collect()
    }

    fn observe(&self, snapshot: &IndexSnapshot, segment: usize, f: impl FnOnce(&SegmentObservation)) {
        {
            let table = self.table.read();
            if table.generation == snapshot.generation() {
                if let Some(obs) = table.segments.get(segment) {
                    f(obs);
                }
                return;
            }
        }

        let mut table = self.table.write();
        if table.generation != snapshot.generation() {
            table.generation = snapshot.generation();
            table.segments = (0..snapshot.segment_count())
                .map(|_| SegmentObservation::default())
                .collect();
        }
        if let Some(obs) = table.segments.get(segment) {
            f(obs);
        }
    }
}
