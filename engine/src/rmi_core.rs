//! Core RMI components: linear models, the root router, immutable index
//! snapshots and the error-bounded search path.
//!
//! A snapshot is never mutated after construction. Readers hold an
//! `Arc<IndexSnapshot>` and keep a consistent view even while a rebuild
//! publishes its replacement.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::{Key, Position};

/// Affine predictor `target ≈ slope * key + intercept` over a contiguous
/// run of training points.
///
/// `max_error` is the exact worst case of `|round(predict(key)) - target|`
/// over every point the model was fitted on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    slope: f64,
    intercept: f64,
    start: u64,
    end: u64,
    max_error: u64,
}

impl LinearModel {
    /// Least-squares fit over `(key, target)` points.
    ///
    /// Keys are rescaled to `[0, 1]` before regression and the coefficients
    /// mapped back afterwards, so `predict` works on raw keys without the
    /// sum-of-squares terms blowing up for keys around 10^15.
    pub fn fit(points: &[(Key, u64)]) -> Result<Self> {
        Self::fit_by(points.len(), |i| points[i])
    }

    pub(crate) fn fit_by(len: usize, point: impl Fn(usize) -> (Key, u64)) -> Result<Self> {
        if len == 0 {
            return Ok(Self::empty());
        }

        let (first_key, first_target) = point(0);
        let mut min_key = first_key;
        let mut max_key = first_key;
        let mut start = first_target;
        let mut end = first_target;
        for i in 1..len {
            let (key, target) = point(i);
            min_key = min_key.min(key);
            max_key = max_key.max(key);
            start = start.min(target);
            end = end.max(target);
        }

        if len == 1 || min_key == max_key {
            let mut model = Self {
                slope: 0.0,
                intercept: first_target as f64,
                start,
                end,
                max_error: 0,
            };
            model.max_error = model.bound_by(len, &point);
            return Ok(model);
        }

        let range = key_span(min_key, max_key).max(1.0);
        let normalize = |key: Key| key_span(min_key, key) / range;

        let n = len as f64;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        for i in 0..len {
            let (key, target) = point(i);
            sum_x += normalize(key);
            sum_y += target as f64;
        }
        let mean_x = sum_x / n;
        let mean_y = sum_y / n;

        // Centered second pass keeps the cross terms small.
        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for i in 0..len {
            let (key, target) = point(i);
            let dx = normalize(key) - mean_x;
            sxx += dx * dx;
            sxy += dx * (target as f64 - mean_y);
        }

        let normalized_slope = if sxx > f64::EPSILON { sxy / sxx } else { 0.0 };
        let normalized_intercept = mean_y - normalized_slope * mean_x;

        let slope = normalized_slope / range;
        let intercept = normalized_intercept - slope * min_key as f64;

        let mut model = Self::from_line(slope, intercept, start, end)?;
        model.max_error = model.bound_by(len, &point);
        Ok(model)
    }

    /// Model with caller-chosen coefficients; the error bound starts at zero
    /// and must be measured with [`LinearModel::error_bound`].
    pub(crate) fn from_line(slope: f64, intercept: f64, start: u64, end: u64) -> Result<Self> {
        if !slope.is_finite() || !intercept.is_finite() {
            return Err(IndexError::NumericOverflow {
                detail: format!("slope={} intercept={}", slope, intercept),
            });
        }
        Ok(Self {
            slope,
            intercept,
            start,
            end,
            max_error: 0,
        })
    }

    /// Rebuild a model from persisted parameters.
    pub fn from_parts(slope: f64, intercept: f64, start: u64, end: u64, max_error: u64) -> Result<Self> {
        let mut model = Self::from_line(slope, intercept, start, end)?;
        model.max_error = max_error;
        Ok(model)
    }

    fn empty() -> Self {
        Self {
            slope: 0.0,
            intercept: 0.0,
            start: 0,
            end: 0,
            max_error: 0,
        }
    }

    #[inline(always)]
    pub fn predict(&self, key: Key) -> f64 {
        self.slope * key as f64 + self.intercept
    }

    /// Rounded prediction clamped into `[start, end]`.
    #[inline]
    pub fn predict_clamped(&self, key: Key) -> u64 {
        let rounded = self.predict(key).round();
        if rounded <= self.start as f64 {
            self.start
        } else if rounded >= self.end as f64 {
            self.end
        } else {
            rounded as u64
        }
    }

    /// Exact worst-case rounding error over every point.
    pub fn error_bound(&self, points: &[(Key, u64)]) -> u64 {
        self.bound_by(points.len(), |i| points[i])
    }

    pub(crate) fn bound_by(&self, len: usize, point: impl Fn(usize) -> (Key, u64)) -> u64 {
        let mut max_error = 0u64;
        for i in 0..len {
            let (key, target) = point(i);
            max_error = max_error.max(self.error_at(key, target));
        }
        max_error
    }

    #[inline]
    fn error_at(&self, key: Key, target: u64) -> u64 {
        // `as i128` saturates on non-finite input; the fit already rejects those.
        let predicted = self.predict(key).round() as i128;
        let diff = (predicted - target as i128).unsigned_abs();
        diff.min(u64::MAX as u128) as u64
    }

    pub(crate) fn with_max_error(mut self, max_error: u64) -> Self {
        self.max_error = max_error;
        self
    }

    #[inline]
    pub fn slope(&self) -> f64 {
        self.slope
    }

    #[inline]
    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    pub fn max_error(&self) -> u64 {
        self.max_error
    }

    /// Search window `[pred - max_error, pred + max_error]` clamped to the model's range.
    #[inline]
    pub fn window(&self, key: Key) -> (u64, u64) {
        let predicted = self.predict_clamped(key);
        let lo = predicted.saturating_sub(self.max_error).max(self.start);
        let hi = predicted.saturating_add(self.max_error).min(self.end);
        (lo, hi)
    }
}

/// Width of `[min, max]` as f64, computed without i64 overflow.
#[inline]
pub(crate) fn key_span(min: Key, max: Key) -> f64 {
    (max as i128 - min as i128) as f64
}

/// Top-level model mapping a key to a segment index.
///
/// Its own `max_error` is measured in segments, which lets routing
/// binary-search a small neighbourhood of segment first-keys instead of
/// trusting the rounded prediction alone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RootModel {
    model: LinearModel,
}

impl RootModel {
    pub fn new(model: LinearModel) -> Self {
        Self { model }
    }

    pub fn empty() -> Self {
        Self {
            model: LinearModel::empty(),
        }
    }

    /// `clamp(round(predict(key)), 0, segment_count - 1)`
    #[inline]
    pub fn route(&self, key: Key, segment_count: usize) -> usize {
        if segment_count == 0 {
            return 0;
        }
        let rounded = self.model.predict(key).round();
        if rounded <= 0.0 {
            0
        } else {
            (rounded as usize).min(segment_count - 1)
        }
    }

    pub fn model(&self) -> &LinearModel {
        &self.model
    }

    pub fn max_error(&self) -> u64 {
        self.model.max_error()
    }
}

/// Result of an error-bounded lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(Hit),
    /// Proven absent from the snapshot.
    Absent,
    /// The key exists but outside the window its model promised.
    BoundViolated {
        segment: usize,
        window: (u64, u64),
        rank: u64,
        position: Position,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub position: Position,
    pub rank: u64,
    pub segment: usize,
    /// Distance between the clamped prediction and the true rank.
    pub offset: u64,
}

/// Immutable `{root, segments}` model plus the sorted entries it was trained on.
#[derive(Debug)]
pub struct IndexSnapshot {
    root: RootModel,
    segments: Vec<LinearModel>,
    first_keys: Vec<Key>,
    keys: Vec<Key>,
    positions: Vec<Position>,
    generation: u64,
}

impl IndexSnapshot {
    /// Zero-segment snapshot for an empty key set.
    pub fn empty(generation: u64) -> Self {
        Self {
            root: RootModel::empty(),
            segments: Vec::new(),
            first_keys: Vec::new(),
            keys: Vec::new(),
            positions: Vec::new(),
            generation,
        }
    }

    /// Assemble a snapshot, checking that segments are contiguous and cover
    /// every entry.
    pub fn from_parts(
        root: RootModel,
        segments: Vec<LinearModel>,
        keys: Vec<Key>,
        positions: Vec<Position>,
        generation: u64,
    ) -> Result<Self> {
        if keys.len() != positions.len() {
            return Err(IndexError::InvariantViolation {
                key: 0,
                segment: 0,
                detail: format!("{} keys but {} positions", keys.len(), positions.len()),
            });
        }
        check_coverage(&segments, keys.len() as u64)?;

        let first_keys = segments.iter().map(|s| keys[s.start() as usize]).collect();
        Ok(Self {
            root,
            segments,
            first_keys,
            keys,
            positions,
            generation,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn root(&self) -> &RootModel {
        &self.root
    }

    pub fn segments(&self) -> &[LinearModel] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn avg_error_bound(&self) -> f64 {
        if self.segments.is_empty() {
            return 0.0;
        }
        let total: u64 = self.segments.iter().map(|s| s.max_error()).sum();
        total as f64 / self.segments.len() as f64
    }

    pub fn max_error_bound(&self) -> u64 {
        self.segments.iter().map(|s| s.max_error()).max().unwrap_or(0)
    }

    /// Segment owning `key`: root prediction, then a binary search over
    /// first-keys inside the root's error neighbourhood.
    #[inline]
    pub fn locate_segment(&self, key: Key) -> usize {
        let count = self.segments.len();
        if count <= 1 {
            return 0;
        }
        let guess = self.root.route(key, count);
        let spread = self.root.max_error().min(count as u64) as usize;
        let lo = guess.saturating_sub(spread);
        let hi = guess.saturating_add(spread).min(count - 1);

        let idx = self.first_keys[lo..=hi].partition_point(|&k| k <= key);
        lo + idx.saturating_sub(1)
    }

    /// Exact position of `key`, or `None` when absent.
    ///
    /// A key found outside its promised window is reported as an invariant
    /// violation instead of being silently dropped or returned.
    pub fn point_query(&self, key: Key) -> Result<Option<Position>> {
        match self.search(key) {
            SearchOutcome::Found(hit) => Ok(Some(hit.position)),
            SearchOutcome::Absent => Ok(None),
            SearchOutcome::BoundViolated {
                segment,
                window,
                rank,
                ..
            } => Err(IndexError::InvariantViolation {
                key,
                segment,
                detail: format!("rank {} outside window [{}, {}]", rank, window.0, window.1),
            }),
        }
    }

    pub fn search(&self, key: Key) -> SearchOutcome {
        if self.keys.is_empty() {
            return SearchOutcome::Absent;
        }

        let segment = self.locate_segment(key);
        let model = &self.segments[segment];
        let predicted = model.predict_clamped(key);
        let (lo, hi) = model.window(key);
        let (lo_idx, hi_idx) = (lo as usize, hi as usize);

        match self.keys[lo_idx..=hi_idx].binary_search(&key) {
            Ok(idx) => {
                let rank = (lo_idx + idx) as u64;
                SearchOutcome::Found(Hit {
                    position: self.positions[lo_idx + idx],
                    rank,
                    segment,
                    offset: rank.abs_diff(predicted),
                })
            }
            Err(idx) => {
                let insert_at = lo_idx + idx;
                let below_ok = insert_at == 0 || self.keys[insert_at - 1] < key;
                let above_ok = insert_at == self.keys.len() || self.keys[insert_at] > key;
                if below_ok && above_ok {
                    return SearchOutcome::Absent;
                }
                // The window edge does not bracket the key; settle it globally.
                match self.keys.binary_search(&key) {
                    Ok(rank) => SearchOutcome::BoundViolated {
                        segment,
                        window: (lo, hi),
                        rank: rank as u64,
                        position: self.positions[rank],
                    },
                    Err(_) => SearchOutcome::Absent,
                }
            }
        }
    }

    /// Rank of the first key `>= low`, located through the same
    /// segment + window descent as point lookups.
    pub fn lower_bound(&self, low: Key) -> usize {
        let n = self.keys.len();
        if n == 0 {
            return 0;
        }
        let model = &self.segments[self.locate_segment(low)];
        let (lo, hi) = model.window(low);
        let (lo, hi) = (lo as usize, hi as usize);
        let idx = lo + self.keys[lo..=hi].partition_point(|&k| k < low);

        let below_ok = idx == 0 || self.keys[idx - 1] < low;
        let above_ok = idx == n || self.keys[idx] >= low;
        if below_ok && above_ok {
            idx
        } else {
            // Only reachable for keys absent from the trained set.
            self.keys.partition_point(|&k| k < low)
        }
    }

    /// Lazily evaluated `(key, position)` pairs with `low <= key <= high`.
    pub fn range_query(self: &Arc<Self>, low: Key, high: Key) -> RangeIter {
        let start = if low > high {
            self.keys.len()
        } else {
            self.lower_bound(low)
        };
        RangeIter {
            snapshot: Arc::clone(self),
            start,
            cursor: start,
            high,
        }
    }

    /// Exhaustively check every segment's bound and the root's routing bound.
    pub fn verify_error_bounds(&self) -> Result<()> {
        check_coverage(&self.segments, self.keys.len() as u64)?;

        for (segment, model) in self.segments.iter().enumerate() {
            for rank in model.start()..=model.end() {
                let key = self.keys[rank as usize];
                let error = model.error_at(key, rank);
                if error > model.max_error() {
                    return Err(IndexError::InvariantViolation {
                        key,
                        segment,
                        detail: format!(
                            "prediction error {} exceeds bound {}",
                            error,
                            model.max_error()
                        ),
                    });
                }
                if rank == model.start() && self.locate_segment(key) != segment {
                    return Err(IndexError::InvariantViolation {
                        key,
                        segment,
                        detail: "root routed segment start elsewhere".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn check_coverage(segments: &[LinearModel], len: u64) -> Result<()> {
    let mut expected = 0u64;
    for (i, s) in segments.iter().enumerate() {
        if s.start() != expected || s.end() < s.start() || s.end() >= len {
            return Err(IndexError::InvariantViolation {
                key: 0,
                segment: i,
                detail: format!(
                    "segment covers [{}, {}], expected start {} within {} entries",
                    s.start(),
                    s.end(),
                    expected,
                    len
                ),
            });
        }
        expected = s.end() + 1;
    }
    if expected != len {
        return Err(IndexError::InvariantViolation {
            key: 0,
            segment: segments.len(),
            detail: format!("segments cover {} of {} entries", expected, len),
        });
    }
    Ok(())
}

/// Forward scan over a snapshot, crossing segment boundaries freely.
///
/// Cloning or calling [`RangeIter::restart`] replays the range from its
/// first entry against the same snapshot.
#[derive(Debug, Clone)]
pub struct RangeIter {
    snapshot: Arc<IndexSnapshot>,
    start: usize,
    cursor: usize,
    high: Key,
}

impl RangeIter {
    pub fn restart(&mut self) {
        self.cursor = self.start;
    }

    pub fn snapshot(&self) -> &Arc<IndexSnapshot> {
        &self.snapshot
    }
}

impl Iterator for RangeIter {
    type Item = (Key, Position);

    fn next(&mut self) -> Option<Self::Item> {
        let key = *self.snapshot.keys.get(self.cursor)?;
        if key > self.high {
            return None;
        }
        let position = self.snapshot.positions[self.cursor];
        self.cursor += 1;
        Some((key, position))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.snapshot.keys.len().saturating_sub(self.cursor)))
    }
}

impl std::iter::FusedIterator for RangeIter {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(keys: &[Key]) -> Vec<(Key, u64)> {
        keys.iter().enumerate().map(|(i, &k)| (k, i as u64)).collect()
    }

    #[test]
    fn test_linear_model_exact_on_linear_data() {
        let points = ranked(&[10, 20, 30, 40]);
        let model = LinearModel::fit(&points).unwrap();

        assert_eq!(model.predict_clamped(10), 0);
        assert_eq!(model.predict_clamped(40), 3);
        assert_eq!(model.max_error(), 0);
        assert_eq!(model.start(), 0);
        assert_eq!(model.end(), 3);
    }

    #[test]
    fn test_linear_model_single_point() {
        let model = LinearModel::fit(&[(42, 7)]).unwrap();
        assert_eq!(model.slope(), 0.0);
        assert_eq!(model.intercept(), 7.0);
        assert_eq!(model.max_error(), 0);
        assert_eq!(model.predict_clamped(-1_000_000), 7);
    }

    #[test]
    fn test_linear_model_zero_key_range() {
        let model = LinearModel::fit(&[(5, 0), (5, 1), (5, 2)]).unwrap();
        assert_eq!(model.slope(), 0.0);
        assert_eq!(model.intercept(), 0.0);
        assert_eq!(model.max_error(), 2);
    }

    #[test]
    fn test_linear_model_large_magnitude_keys() {
        let points = vec![(5, 0), (1_600_000_000_000_000, 1)];
        let model = LinearModel::fit(&points).unwrap();
        assert_eq!(model.predict_clamped(5), 0);
        assert_eq!(model.predict_clamped(1_600_000_000_000_000), 1);
        assert_eq!(model.error_bound(&points), model.max_error());
    }

    #[test]
    fn test_error_bound_is_exhaustive_not_sampled() {
        // One far outlier in the middle of 500 evenly spaced keys.
        let mut keys: Vec<Key> = (0..500).map(|i| i * 10).collect();
        keys[250] = 2_495;
        for k in keys.iter_mut().skip(251) {
            *k += 1_000_000;
        }
        let points = ranked(&keys);
        let model = LinearModel::fit(&points).unwrap();

        let worst = points
            .iter()
            .map(|&(k, pos)| ((model.predict(k).round() as i64) - pos as i64).unsigned_abs())
            .max()
            .unwrap();
        assert_eq!(model.max_error(), worst);
    }

    #[test]
    fn test_non_finite_line_rejected() {
        assert!(matches!(
            LinearModel::from_line(f64::NAN, 0.0, 0, 0),
            Err(IndexError::NumericOverflow { .. })
        ));
    }

    #[test]
    fn test_window_clamped_to_segment() {
        let model = LinearModel::from_parts(1.0, 0.0, 10, 19, 4).unwrap();
        assert_eq!(model.window(10), (10, 14));
        assert_eq!(model.window(19), (15, 19));
        assert_eq!(model.window(1_000), (15, 19));
    }

    #[test]
    fn test_root_route_clamps() {
        let root = RootModel::new(LinearModel::from_parts(0.1, 0.0, 0, 3, 0).unwrap());
        assert_eq!(root.route(-100, 4), 0);
        assert_eq!(root.route(20, 4), 2);
        assert_eq!(root.route(1_000, 4), 3);
        assert_eq!(root.route(1_000, 0), 0);
    }

    #[test]
    fn test_snapshot_rejects_gaps() {
        let a = LinearModel::from_parts(0.0, 0.0, 0, 1, 1).unwrap();
        let b = LinearModel::from_parts(0.0, 3.0, 3, 4, 1).unwrap();
        let result = IndexSnapshot::from_parts(
            RootModel::empty(),
            vec![a, b],
            vec![1, 2, 3, 4, 5],
            vec![0, 1, 2, 3, 4],
            1,
        );
        assert!(matches!(result, Err(IndexError::InvariantViolation { .. })));
    }

    #[test]
    fn test_understated_bound_fails_loudly() {
        // Bound of zero on a model that is off by two for key 30.
        let model = LinearModel::from_parts(0.0, 0.0, 0, 3, 0).unwrap();
        let snapshot = IndexSnapshot::from_parts(
            RootModel::empty(),
            vec![model],
            vec![10, 20, 30, 40],
            vec![0, 1, 2, 3],
            1,
        )
        .unwrap();

        assert!(matches!(
            snapshot.search(30),
            SearchOutcome::BoundViolated { rank: 2, .. }
        ));
        assert!(snapshot.point_query(30).is_err());
        assert_eq!(snapshot.point_query(10).unwrap(), Some(0));
        assert_eq!(snapshot.point_query(25).unwrap(), None);
        assert!(snapshot.verify_error_bounds().is_err());
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = Arc::new(IndexSnapshot::empty(0));
        assert_eq!(snapshot.point_query(1).unwrap(), None);
        assert_eq!(snapshot.range_query(i64::MIN, i64::MAX).count(), 0);
        assert_eq!(snapshot.avg_error_bound(), 0.0);
        assert!(snapshot.verify_error_bounds().is_ok());
    }
}
