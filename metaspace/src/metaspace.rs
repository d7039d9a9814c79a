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

use core::ptr::NonNull;
use std::sync::Arc;

use log::{debug, info};

use crate::{
    committed_limiter::CommittedLimiter,
    config::MetaspaceConfig,
    constants::COMMIT_GRANULE_BYTES,
    context_holder::{ContextHolder, ContextReport},
    error::MetaspaceError,
    internal_stats::{InternalStats, InternalStatsSnapshot},
    metaspace_arena::MetaspaceArena,
    metaspace_gc::{MetaspaceGc, ThresholdAdjustment, ThresholdRaise},
    modules::os_memory::OsMemoryModule,
    util::align_up,
};

/// One metaspace: the shared segment state plus its budget.
///
/// Arenas keep the shared state alive, so the reserved volumes go back to the
/// OS once the runtime and all of its arenas are dropped.
pub struct Metaspace {
    config: MetaspaceConfig,
    limiter: Arc<CommittedLimiter>,
    gc: Arc<MetaspaceGc>,
    context: Arc<ContextHolder>,
    stats: Arc<InternalStats>,
}

impl Metaspace {
    /// Sets up a metaspace on top of `os`.
    ///
    /// The GC threshold starts at `max_metaspace_size` until
    /// [`Metaspace::post_initialize`] is called.
    pub fn global_initialize(
        mut config: MetaspaceConfig,
        os: Arc<dyn OsMemoryModule>,
    ) -> Result<Arc<Self>, MetaspaceError> {
        config.ergo_initialize();
        config.validate()?;

        let stats = Arc::new(InternalStats::new());
        let limiter = Arc::new(CommittedLimiter::new(config.max_metaspace_size));
        let gc = Arc::new(MetaspaceGc::new(&config));

        let policy_gc = gc.clone();
        limiter.register_policy(Box::new(move |committed| policy_gc.allowed_expansion(committed)));

        let context = Arc::new(ContextHolder::new(
            os,
            limiter.clone(),
            stats.clone(),
            config.always_pre_touch,
            config.max_reserved_bytes,
        ));

        info!(
            "metaspace initialized: max {} bytes, threshold {} bytes",
            config.max_metaspace_size,
            gc.capacity_until_gc()
        );

        Ok(Arc::new(Self {
            config,
            limiter,
            gc,
            context,
            stats,
        }))
    }

    pub fn post_initialize(&self) {
        self.gc.post_initialize(self.limiter.committed_bytes());
    }

    #[inline]
    pub fn config(&self) -> &MetaspaceConfig {
        &self.config
    }

    #[inline]
    pub fn context(&self) -> &Arc<ContextHolder> {
        &self.context
    }

    #[inline]
    pub fn stats(&self) -> &Arc<InternalStats> {
        &self.stats
    }

    #[inline]
    pub fn gc(&self) -> &MetaspaceGc {
        &self.gc
    }

    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.limiter.committed_bytes()
    }

    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.context.reserved_bytes()
    }

    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.context.used_bytes()
    }

    /// Uncommits the memory of free segments.
    pub fn purge(&self) {
        self.context.purge()
    }

    /// Adjusts the GC threshold to what is committed after a collection.
    pub fn compute_new_gc_threshold(&self) -> ThresholdAdjustment {
        self.gc.compute_new_gc_threshold(self.committed_bytes())
    }

    /// Like [`MetaspaceArena::allocate`], but raises the GC threshold and
    /// retries as long as the threshold is what stands in the way.
    pub fn allocate_with_gc(&self, arena: &MetaspaceArena, bytes: usize) -> Option<NonNull<u8>> {
        // a fresh segment may need one granule more than the block itself
        let needed = align_up(bytes, COMMIT_GRANULE_BYTES) + COMMIT_GRANULE_BYTES;
        let limit_hits = self.context.reservation_limit_hits();
        loop {
            if let Some(p) = arena.allocate(bytes) {
                return Some(p);
            }
            // a larger threshold does not buy address space
            if self.context.reservation_limit_hits() != limit_hits {
                debug!("allocation of {} bytes failed at the reservation cap", bytes);
                return None;
            }
            if self.gc.allowed_expansion(self.committed_bytes()) >= needed {
                debug!("allocation of {} bytes failed below the gc threshold", bytes);
                return None;
            }
            if let ThresholdRaise::LimitReached = self.gc.threshold_with_gc(bytes) {
                return None;
            }
        }
    }

    pub fn report(&self) -> ContextReport {
        self.context.report()
    }

    pub fn stats_snapshot(&self) -> InternalStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn verify(&self) {
        self.context.verify()
    }
}
