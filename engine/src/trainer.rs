//! Segmentation and model training.
//!
//! A full rebuild is linear in the number of entries: one pass to partition,
//! one fit plus one exact error scan per segment, and one root fit.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::LearnedIndexConfig;
use crate::error::Result;
use crate::rmi_core::{key_span, IndexSnapshot, LinearModel, RootModel};
use crate::{Key, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    /// Grow each segment while a line with error <= epsilon still exists.
    Greedy,
    /// `segment_count` equal-size chunks.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    Greedy { epsilon: u64 },
    Fixed { segment_count: usize },
}

impl PartitionStrategy {
    /// Inclusive `[start, end]` rank ranges over sorted `keys`.
    pub fn partition(&self, keys: &[Key]) -> Vec<(usize, usize)> {
        match *self {
            PartitionStrategy::Greedy { epsilon } => greedy_partition(keys, epsilon),
            PartitionStrategy::Fixed { segment_count } => fixed_partition(keys.len(), segment_count),
        }
    }
}

fn fixed_partition(n: usize, segment_count: usize) -> Vec<(usize, usize)> {
    let count = segment_count.max(1).min(n);
    let mut ranges = Vec::with_capacity(count);
    for i in 0..count {
        let start = i * n / count;
        let end = (i + 1) * n / count;
        if start < end {
            ranges.push((start, end - 1));
        }
    }
    ranges
}

/// Slope interval of every line through a segment's first point that keeps
/// all points seen so far within `epsilon`.
#[derive(Debug, Clone, Copy)]
struct Cone {
    anchor_key: Key,
    anchor_rank: usize,
    lo: f64,
    hi: f64,
}

impl Cone {
    fn new(anchor_key: Key, anchor_rank: usize) -> Self {
        Self {
            anchor_key,
            anchor_rank,
            lo: 0.0,
            hi: f64::INFINITY,
        }
    }

    /// Narrow the cone to include `(key, rank)`; false if it would close.
    fn admit(&mut self, key: Key, rank: usize, epsilon: f64) -> bool {
        let dy = (rank - self.anchor_rank) as f64;
        let dx = key_span(self.anchor_key, key);
        if dx <= 0.0 {
            // Equal keys predict the anchor's rank.
            return dy <= epsilon;
        }
        let lo = self.lo.max((dy - epsilon) / dx);
        let hi = self.hi.min((dy + epsilon) / dx);
        if lo > hi {
            return false;
        }
        self.lo = lo;
        self.hi = hi;
        true
    }

    fn slope(&self) -> f64 {
        if self.hi.is_finite() {
            (self.lo + self.hi) / 2.0
        } else {
            self.lo
        }
    }
}

fn greedy_partition(keys: &[Key], epsilon: u64) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    if keys.is_empty() {
        return ranges;
    }
    let eps = epsilon as f64;
    let mut start = 0;
    let mut cone = Cone::new(keys[0], 0);
    for (i, &key) in keys.iter().enumerate().skip(1) {
        if !cone.admit(key, i, eps) {
            ranges.push((start, i - 1));
            start = i;
            cone = Cone::new(key, i);
        }
    }
    ranges.push((start, keys.len() - 1));
    ranges
}

/// Builds index snapshots from sorted entries.
#[derive(Debug, Clone)]
pub struct Trainer {
    strategy: PartitionStrategy,
    warn_error_bound: u64,
}

impl Trainer {
    pub fn new(strategy: PartitionStrategy) -> Self {
        Self {
            strategy,
            warn_error_bound: u64::MAX,
        }
    }

    pub fn from_config(config: &LearnedIndexConfig) -> Self {
        Self {
            strategy: config.partition_strategy(),
            warn_error_bound: config.warn_error_bound,
        }
    }

    pub fn strategy(&self) -> PartitionStrategy {
        self.strategy
    }

    /// Train from an arbitrary batch, sorting it by key first if needed.
    pub fn train(&self, mut entries: Vec<(Key, Position)>, generation: u64) -> Result<IndexSnapshot> {
        if !entries.windows(2).all(|w| w[0].0 <= w[1].0) {
            debug!(entries = entries.len(), "sorting unordered training batch");
            entries.sort_by_key(|&(k, _)| k);
        }
        let (keys, positions) = entries.into_iter().unzip();
        self.train_sorted(keys, positions, generation)
    }

    /// Train from keys already in ascending order.
    #[instrument(level = "debug", skip(self, keys, positions), fields(keys = keys.len()))]
    pub fn train_sorted(
        &self,
        keys: Vec<Key>,
        positions: Vec<Position>,
        generation: u64,
    ) -> Result<IndexSnapshot> {
        let started = Instant::now();
        let n = keys.len();
        if n == 0 {
            debug!("no entries to train, publishing empty snapshot");
            return Ok(IndexSnapshot::empty(generation));
        }

        let ranges = self.strategy.partition(&keys);
        let mut segments = Vec::with_capacity(ranges.len());
        for &(start, end) in &ranges {
            let model = self.fit_segment(&keys, start, end)?;
            if model.max_error() > self.warn_error_bound {
                warn!(
                    start,
                    end,
                    max_error = model.max_error(),
                    threshold = self.warn_error_bound,
                    "segment error bound above warning threshold"
                );
            }
            segments.push(model);
        }

        let root = fit_root(&keys, &ranges)?;
        let snapshot = IndexSnapshot::from_parts(root, segments, keys, positions, generation)?;

        info!(
            keys = n,
            segments = snapshot.segment_count(),
            avg_error = snapshot.avg_error_bound(),
            max_error = snapshot.max_error_bound(),
            root_error = snapshot.root().max_error(),
            duration_ms = started.elapsed().as_millis() as u64,
            "learned index training completed"
        );
        Ok(snapshot)
    }

    fn fit_segment(&self, keys: &[Key], start: usize, end: usize) -> Result<LinearModel> {
        let len = end - start + 1;
        let point = |i: usize| (keys[start + i], (start + i) as u64);
        let fitted = LinearModel::fit_by(len, point)?;

        let model = match self.strategy {
            PartitionStrategy::Greedy { epsilon } if fitted.max_error() > epsilon => {
                // Least squares can miss a tolerance the partition proved
                // feasible; the cone's midline cannot.
                let mut cone = Cone::new(keys[start], start);
                for i in 1..len {
                    cone.admit(keys[start + i], start + i, epsilon as f64);
                }
                let slope = cone.slope();
                let intercept = start as f64 - slope * keys[start] as f64;
                let line = LinearModel::from_line(slope, intercept, start as u64, end as u64)?;
                let line = line.with_max_error(line.bound_by(len, point));
                if line.max_error() < fitted.max_error() {
                    line
                } else {
                    fitted
                }
            }
            _ => fitted,
        };

        debug!(
            start,
            end,
            slope = model.slope(),
            max_error = model.max_error(),
            "trained segment"
        );
        Ok(model)
    }
}

/// Root model over `(key, segment_index)` for every entry.
fn fit_root(keys: &[Key], ranges: &[(usize, usize)]) -> Result<RootModel> {
    let mut segment_of = Vec::with_capacity(keys.len());
    for (segment, &(start, end)) in ranges.iter().enumerate() {
        segment_of.extend(std::iter::repeat(segment as u64).take(end - start + 1));
    }
    let model = LinearModel::fit_by(keys.len(), |i| (keys[i], segment_of[i]))?;
    Ok(RootModel::new(model))
}
