/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::{debug, info, trace};

use crate::{
    config::MetaspaceConfig,
    constants::COMMIT_GRANULE_BYTES,
    util::{align_down, align_up},
};

/// Outcome of one threshold recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdAdjustment {
    /// Threshold raised by the given number of bytes.
    Expanded(usize),
    /// Threshold lowered by the given number of bytes.
    Shrunk(usize),
    /// An adjustment was due but smaller than the minimum expansion.
    BelowMinimum,
    Unchanged,
}

/// Result of raising the threshold on behalf of a pending allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdRaise {
    Raised { old: usize, new: usize },
    /// Raising would pass `max_metaspace_size`; retrying cannot help.
    LimitReached,
}

/// Soft limit on committed metaspace memory, adjusted after every collection.
pub struct MetaspaceGc {
    gc_threshold: AtomicUsize,
    shrink_factor: AtomicU32,
    metaspace_size: usize,
    max_metaspace_size: usize,
    min_free_ratio: usize,
    max_free_ratio: usize,
    min_expansion: usize,
    max_expansion: usize,
}

impl MetaspaceGc {
    /// Starts with the threshold at the hard limit; see [`MetaspaceGc::post_initialize`].
    pub fn new(config: &MetaspaceConfig) -> Self {
        Self {
            gc_threshold: AtomicUsize::new(config.max_metaspace_size),
            shrink_factor: AtomicU32::new(0),
            metaspace_size: config.metaspace_size,
            max_metaspace_size: config.max_metaspace_size,
            min_free_ratio: config.min_metaspace_free_ratio,
            max_free_ratio: config.max_metaspace_free_ratio,
            min_expansion: config.min_metaspace_expansion,
            max_expansion: config.max_metaspace_expansion,
        }
    }

    /// Lowers the threshold to its working value once bootstrapping is done.
    pub fn post_initialize(&self, committed: usize) {
        let threshold = self.metaspace_size.max(committed);
        self.gc_threshold.store(threshold, Ordering::Release);
        debug!("gc threshold initialized to {}", threshold);
    }

    #[inline]
    pub fn capacity_until_gc(&self) -> usize {
        self.gc_threshold.load(Ordering::Acquire)
    }

    pub fn shrink_factor(&self) -> u32 {
        self.shrink_factor.load(Ordering::Relaxed)
    }

    /// Bytes that may be committed before the next collection is due.
    pub fn allowed_expansion(&self, committed: usize) -> usize {
        let threshold = self.capacity_until_gc();
        if committed > threshold {
            trace!("committed {} already above gc threshold {}", committed, threshold);
        }
        threshold.saturating_sub(committed)
    }

    /// Raises the threshold far enough to absorb an allocation of `bytes`.
    pub fn threshold_with_gc(&self, bytes: usize) -> ThresholdRaise {
        let wanted = align_up(bytes, COMMIT_GRANULE_BYTES).saturating_add(self.min_expansion);
        let delta = wanted.clamp(self.min_expansion, self.max_expansion);

        let mut old = self.capacity_until_gc();
        loop {
            let new = match old.checked_add(delta) {
                Some(new) if new <= self.max_metaspace_size => new,
                _ => {
                    debug!("gc threshold {} cannot grow by {}", old, delta);
                    return ThresholdRaise::LimitReached;
                }
            };
            match self
                .gc_threshold
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    debug!("gc threshold raised {} -> {}", old, new);
                    return ThresholdRaise::Raised { old, new };
                }
                Err(current) => old = current,
            }
        }
    }

    /// Recomputes the threshold from the committed size after a collection.
    ///
    /// Expands when less than `min_free_ratio` of the threshold would be free.
    /// Otherwise shrinks, damped by a factor ramping 0, 10, 40, 100 percent over
    /// consecutive shrinking cycles, when more than `max_free_ratio` would be free.
    pub fn compute_new_gc_threshold(&self, used_after_gc: usize) -> ThresholdAdjustment {
        let threshold = self.capacity_until_gc();
        let current_shrink_factor = self.shrink_factor.swap(0, Ordering::Relaxed);

        let min_desired = self.desired_capacity(used_after_gc, self.min_free_ratio);
        if threshold < min_desired {
            let expand_bytes = align_up(min_desired - threshold, COMMIT_GRANULE_BYTES);
            if expand_bytes < self.min_expansion {
                trace!("expansion by {} below minimum", expand_bytes);
                return ThresholdAdjustment::BelowMinimum;
            }
            let new = threshold.saturating_add(expand_bytes).min(self.max_metaspace_size);
            self.gc_threshold.store(new, Ordering::Release);
            info!(
                "gc threshold expanded {} -> {} (used after gc {})",
                threshold, new, used_after_gc
            );
            return ThresholdAdjustment::Expanded(new - threshold);
        }

        if self.max_free_ratio >= 100 {
            return ThresholdAdjustment::Unchanged;
        }

        let max_desired = self.desired_capacity(used_after_gc, self.max_free_ratio);
        if threshold <= max_desired {
            return ThresholdAdjustment::Unchanged;
        }

        let shrink_bytes = (threshold - max_desired) / 100 * current_shrink_factor as usize;
        let shrink_bytes = align_down(shrink_bytes, COMMIT_GRANULE_BYTES);
        let next_factor = if current_shrink_factor == 0 {
            10
        } else {
            (current_shrink_factor * 4).min(100)
        };
        self.shrink_factor.store(next_factor, Ordering::Relaxed);

        if shrink_bytes < self.min_expansion {
            trace!("shrink by {} below minimum, factor now {}", shrink_bytes, next_factor);
            return ThresholdAdjustment::BelowMinimum;
        }
        let new = threshold - shrink_bytes;
        self.gc_threshold.store(new, Ordering::Release);
        info!(
            "gc threshold shrunk {} -> {} (used after gc {}, factor {})",
            threshold, new, used_after_gc, current_shrink_factor
        );
        ThresholdAdjustment::Shrunk(shrink_bytes)
    }

    /// `used / (1 - free_ratio)` clamped to `[metaspace_size, max_metaspace_size]`.
    fn desired_capacity(&self, used: usize, free_ratio: usize) -> usize {
        let max_used_fraction = 1.0 - (free_ratio as f64 / 100.0);
        let desired = if max_used_fraction <= 0.0 {
            f64::INFINITY
        } else {
            used as f64 / max_used_fraction
        };
        // float to int casts saturate
        (desired as usize).clamp(self.metaspace_size, self.max_metaspace_size)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::{K, M};

    fn gc(metaspace_size: usize, max: usize) -> MetaspaceGc {
        let mut config = MetaspaceConfig {
            metaspace_size,
            max_metaspace_size: max,
            ..Default::default()
        };
        config.ergo_initialize();
        let gc = MetaspaceGc::new(&config);
        gc.post_initialize(0);
        gc
    }

    fn assert_in_bounds(gc: &MetaspaceGc) {
        let t = gc.capacity_until_gc();
        assert!(t >= gc.metaspace_size && t <= gc.max_metaspace_size, "threshold {}", t);
    }

    #[test]
    fn test_initial_threshold() {
        let mut config = MetaspaceConfig::default();
        config.ergo_initialize();
        let gc = MetaspaceGc::new(&config);
        assert_eq!(gc.capacity_until_gc(), config.max_metaspace_size);
        gc.post_initialize(30 * M);
        assert_eq!(gc.capacity_until_gc(), 30 * M);
        gc.post_initialize(M);
        assert_eq!(gc.capacity_until_gc(), 21 * M);
    }

    #[test]
    fn test_expand() {
        let gc = gc(16 * M, 256 * M);
        // 60 MiB used with 40% minimum free needs a threshold of 100 MiB
        assert_eq!(
            gc.compute_new_gc_threshold(60 * M),
            ThresholdAdjustment::Expanded(84 * M)
        );
        assert_eq!(gc.capacity_until_gc(), 100 * M);
        assert_in_bounds(&gc);
    }

    #[test]
    fn test_expand_capped_at_max() {
        let gc = gc(16 * M, 64 * M);
        gc.compute_new_gc_threshold(60 * M);
        assert_eq!(gc.capacity_until_gc(), 64 * M);
        assert_in_bounds(&gc);
    }

    #[test]
    fn test_expand_below_minimum() {
        let gc = gc(16 * M, 256 * M);
        // needs 16 MiB + 64 KiB, but 64 KiB is below the 256 KiB minimum
        let used = (16 * M + 64 * K) / 10 * 6;
        assert_eq!(
            gc.compute_new_gc_threshold(used),
            ThresholdAdjustment::BelowMinimum
        );
        assert_eq!(gc.capacity_until_gc(), 16 * M);
    }

    #[test]
    fn test_shrink_factor_ramp() {
        let gc = gc(16 * M, 1024 * M);
        gc.compute_new_gc_threshold(300 * M);
        assert_eq!(gc.capacity_until_gc(), 500 * M);

        // nothing in use anymore: max_desired collapses to metaspace_size
        let mut factors = Vec::new();
        let mut thresholds = Vec::new();
        for _ in 0..4 {
            gc.compute_new_gc_threshold(0);
            factors.push(gc.shrink_factor());
            thresholds.push(gc.capacity_until_gc());
            assert_in_bounds(&gc);
        }
        assert_eq!(factors, vec![10, 40, 100, 100]);
        // the first shrinking cycle runs with factor 0 and changes nothing
        assert_eq!(thresholds[0], 500 * M);
        assert!(thresholds[1] < thresholds[0]);
        assert!(thresholds[2] < thresholds[1]);
        // full damping lands within one granule of the floor
        assert!(thresholds[3] < thresholds[2]);
        assert!(thresholds[3] <= 16 * M + COMMIT_GRANULE_BYTES);
    }

    #[test]
    fn test_shrink_factor_resets_between_shrinking_phases() {
        let gc = gc(16 * M, 1024 * M);
        gc.compute_new_gc_threshold(300 * M);
        gc.compute_new_gc_threshold(0);
        gc.compute_new_gc_threshold(0);
        assert_eq!(gc.shrink_factor(), 40);

        // a cycle inside the desired band ends the ramp
        let used = gc.capacity_until_gc() / 2;
        assert_eq!(gc.compute_new_gc_threshold(used), ThresholdAdjustment::Unchanged);
        assert_eq!(gc.shrink_factor(), 0);
    }

    #[test]
    fn test_threshold_with_gc() {
        let gc = gc(16 * M, 18 * M);
        // 100 bytes round up to one granule plus the 256 KiB minimum
        assert_eq!(
            gc.threshold_with_gc(100),
            ThresholdRaise::Raised { old: 16 * M, new: 16 * M + 320 * K }
        );
        // large requests are clamped to the 4 MiB maximum, which passes the limit
        assert_eq!(gc.threshold_with_gc(8 * M), ThresholdRaise::LimitReached);
        assert_eq!(gc.capacity_until_gc(), 16 * M + 320 * K);
    }

    #[test]
    fn test_allowed_expansion() {
        let gc = gc(16 * M, 64 * M);
        assert_eq!(gc.allowed_expansion(10 * M), 6 * M);
        assert_eq!(gc.allowed_expansion(20 * M), 0);
    }
}
