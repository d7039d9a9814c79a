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

use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::sync::Arc;

use log::{debug, info, trace};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    committed_limiter::CommittedLimiter,
    constants::{bytes_to_level, SegmentLevel, COMMIT_GRANULE_BYTES},
    internal_stats::InternalStats,
    modules::os_memory::OsMemoryModule,
    segment::{SegmentId, SegmentPool, SegmentState},
    segment_manager::SegmentManager,
    util::{align_down, align_up},
    volume_list::VolumeList,
};

/// Everything the context lock protects.
///
/// A `&mut Context` can only be obtained through [`ContextHolder::lock`], so
/// holding one proves the lock is held.
pub struct Context {
    pub(crate) pool: SegmentPool,
    pub(crate) manager: SegmentManager,
    pub(crate) volumes: VolumeList,
    stats: Arc<InternalStats>,
}

/// Held context lock.
pub type ContextGuard<'a> = MutexGuard<'a, Context>;

impl Context {
    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    pub fn manager(&self) -> &SegmentManager {
        &self.manager
    }

    pub fn volumes(&self) -> &VolumeList {
        &self.volumes
    }

    /// Finds, prepares and hands out a segment.
    ///
    /// The segment is at `preferred_level` if possible and never smaller than
    /// `max_level` allows; at least `min_committed` bytes of it are committed.
    /// `None` if the commit limit or the reservation cap is reached.
    pub fn get_segment(
        &mut self,
        preferred_level: SegmentLevel,
        max_level: SegmentLevel,
        min_committed: usize,
    ) -> Option<SegmentId> {
        assert!(preferred_level <= max_level, "preferred level {} above {}", preferred_level, max_level);
        assert!(
            bytes_to_level(min_committed) >= max_level,
            "{} committed bytes do not fit {}",
            min_committed,
            max_level
        );

        let id = match self.search_free_segment(preferred_level, max_level, min_committed) {
            Some(id) => {
                self.stats.num_segments_taken_from_manager();
                id
            }
            None => self.volumes.allocate_root_segment(&mut self.pool)?,
        };

        if self.pool.get(id).level() < preferred_level {
            let from = self.pool.get(id).level();
            let region = self.volumes.region_of(self.pool.get(id));
            region.split(&mut self.pool, &mut self.manager, id, preferred_level);
            for _ in from.raw()..preferred_level.raw() {
                self.stats.num_segments_split();
            }
        }

        if self.pool.get(id).committed_bytes() < min_committed
            && !self.ensure_committed_enough(id, min_committed)
        {
            debug!("get_segment: could not commit {} bytes", min_committed);
            self.return_free_segment(id);
            return None;
        }

        self.pool.get_mut(id).state = SegmentState::InUse;
        trace!("handed out {} {}", id, self.pool.get(id));
        Some(id)
    }

    fn search_free_segment(
        &mut self,
        preferred_level: SegmentLevel,
        max_level: SegmentLevel,
        min_committed: usize,
    ) -> Option<SegmentId> {
        let pool = &mut self.pool;
        let manager = &mut self.manager;
        // a little larger than preferred, but only if already committed
        let near_level = SegmentLevel::new(
            (preferred_level.raw() + 2).min(max_level.raw()),
        );
        manager
            .search_ascending(pool, preferred_level, near_level, min_committed)
            // a larger segment that is committed beats committing new memory
            .or_else(|| manager.search_descending(pool, preferred_level, min_committed))
            .or_else(|| manager.search_ascending(pool, preferred_level, max_level, min_committed))
            // take anything and commit afterwards
            .or_else(|| manager.search_ascending(pool, preferred_level, max_level, 0))
            .or_else(|| manager.search_descending(pool, preferred_level, 0))
    }

    /// Gives an in-use segment back, merging it with free buddies.
    pub fn return_segment(&mut self, id: SegmentId) {
        let seg = self.pool.get_mut(id);
        assert!(seg.is_in_use(), "returning {} which is not in use", id);
        seg.state = SegmentState::Free;
        self.return_free_segment(id);
    }

    fn return_free_segment(&mut self, id: SegmentId) {
        let from = {
            let seg = self.pool.get_mut(id);
            seg.used_bytes = 0;
            seg.level()
        };
        let region = self.volumes.region_of(self.pool.get(id));
        let merged = region.merge(&mut self.pool, &mut self.manager, id);
        for _ in self.pool.get(merged).level().raw()..from.raw() {
            self.stats.num_segments_merged();
        }
        self.manager.add(&mut self.pool, merged);
        self.stats.num_segments_returned_to_manager();
        trace!("returned {} as {}", id, merged);
    }

    /// Doubles the in-use segment `id` in place if its buddy is free.
    pub fn attempt_enlarge_segment(&mut self, id: SegmentId) -> bool {
        let region = self.volumes.region_of(self.pool.get(id));
        let enlarged = region.attempt_enlarge_segment(&mut self.pool, &mut self.manager, id);
        if enlarged {
            self.stats.num_segments_enlarged();
        }
        enlarged
    }

    /// Records `used` as the bump pointer of the in-use segment `id`.
    pub(crate) fn set_used_bytes(&mut self, id: SegmentId, used: usize) {
        let seg = self.pool.get_mut(id);
        debug_assert!(seg.is_in_use());
        seg.used_bytes = used;
        seg.check_bounds();
    }

    /// Makes sure `bytes` more can be allocated from `id` without touching
    /// uncommitted memory.
    pub fn ensure_committed_enough(&mut self, id: SegmentId, bytes: usize) -> bool {
        let seg = self.pool.get(id);
        assert!(seg.free_bytes() >= bytes, "{} cannot hold {} more bytes", id, bytes);
        if seg.free_below_committed() >= bytes {
            return true;
        }
        let target = seg.used_bytes() + bytes;
        self.commit_up_to(id, target)
    }

    /// Commits the first `new_committed` bytes of `id`, rounded up to the granule.
    fn commit_up_to(&mut self, id: SegmentId, new_committed: usize) -> bool {
        let seg = self.pool.get(id);
        if new_committed <= seg.committed_bytes() {
            return true;
        }
        let commit_to = align_up(new_committed, COMMIT_GRANULE_BYTES).min(seg.total_bytes());
        let from = align_down(seg.base() + seg.committed_bytes(), COMMIT_GRANULE_BYTES);
        let to = align_up(seg.base() + commit_to, COMMIT_GRANULE_BYTES);
        let Some(volume) = seg.volume else {
            panic!("segment {} belongs to no volume", id);
        };

        if !self.volumes.commit_range(volume, from, to - from) {
            return false;
        }
        self.pool.get_mut(id).committed_bytes = commit_to;
        true
    }

    /// Returns the memory of a free segment spanning whole granules to the OS.
    fn uncommit_segment(&mut self, id: SegmentId) {
        let seg = self.pool.get(id);
        debug_assert!(seg.is_free() && seg.used_bytes() == 0);
        if seg.total_bytes() < COMMIT_GRANULE_BYTES {
            return;
        }
        let Some(volume) = seg.volume else {
            return;
        };
        let (base, total) = (seg.base(), seg.total_bytes());
        self.volumes.uncommit_range(volume, base, total);
        self.pool.get_mut(id).committed_bytes = 0;
    }

    /// Uncommits every free segment of at least one granule.
    pub fn purge(&mut self) {
        let reserved_before = self.volumes.reserved_bytes();
        let committed_before = self.volumes.committed_bytes();

        for level in SegmentLevel::range(SegmentLevel::ROOT, bytes_to_level(COMMIT_GRANULE_BYTES)) {
            let free: Vec<SegmentId> = self.manager.iter_level(&self.pool, level).collect();
            for id in free {
                self.uncommit_segment(id);
            }
        }
        self.stats.num_purges();

        info!(
            "purge: reserved {} -> {}, committed {} -> {}",
            reserved_before,
            self.volumes.reserved_bytes(),
            committed_before,
            self.volumes.committed_bytes()
        );
    }

    /// Panics on any broken structural invariant.
    pub fn verify(&self) {
        let mut free = 0;
        for (id, seg) in self.pool.iter() {
            seg.check_bounds();
            assert!(seg.volume.is_some(), "{} has no volume", id);
            if seg.is_free() {
                free += 1;
            }
        }
        assert_eq!(free, self.manager.num_segments(), "free segments missing from free lists");
        self.manager.verify(&self.pool);
        self.volumes.verify(&self.pool);
    }

    pub fn report(&self) -> ContextReport {
        let levels = SegmentLevel::all()
            .map(|level| LevelReport {
                level,
                free_segments: self.manager.num_segments_at_level(level),
                free_committed_bytes: self.manager.committed_bytes_at_level(&self.pool, level),
            })
            .filter(|l| l.free_segments > 0)
            .collect();
        ContextReport {
            reserved_bytes: self.volumes.reserved_bytes(),
            committed_bytes: self.volumes.committed_bytes(),
            num_volumes: self.volumes.num_volumes(),
            free_bytes: self.manager.total_bytes(),
            used_headers: self.pool.used_headers(),
            dead_headers: self.pool.dead_headers(),
            levels,
        }
    }
}

/// Free list statistics of one level.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LevelReport {
    pub level: SegmentLevel,
    pub free_segments: usize,
    pub free_committed_bytes: usize,
}

/// Snapshot of the shared segment state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextReport {
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
    pub num_volumes: usize,
    pub free_bytes: usize,
    pub used_headers: usize,
    pub dead_headers: usize,
    pub levels: Vec<LevelReport>,
}

impl fmt::Display for ContextReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} volumes, reserved {} bytes, committed {} bytes, {} bytes free",
            self.num_volumes, self.reserved_bytes, self.committed_bytes, self.free_bytes
        )?;
        writeln!(f, "headers: {} used, {} dead", self.used_headers, self.dead_headers)?;
        for level in &self.levels {
            writeln!(
                f,
                "  {}: {} free, {} bytes committed",
                level.level, level.free_segments, level.free_committed_bytes
            )?;
        }
        Ok(())
    }
}

/// Shared owner of the segment state of one metaspace.
pub struct ContextHolder {
    context: Mutex<Context>,
    used_bytes: AtomicUsize,
}

impl ContextHolder {
    pub(crate) fn new(
        os: Arc<dyn OsMemoryModule>,
        limiter: Arc<CommittedLimiter>,
        stats: Arc<InternalStats>,
        always_pre_touch: bool,
        max_reserved_bytes: Option<usize>,
    ) -> Self {
        let volumes = VolumeList::new(os, limiter, stats.clone(), always_pre_touch, max_reserved_bytes);
        Self {
            context: Mutex::new(Context {
                pool: SegmentPool::new(),
                manager: SegmentManager::new(),
                volumes,
                stats,
            }),
            used_bytes: AtomicUsize::new(0),
        }
    }

    /// Takes the global lock.
    pub fn lock(&self) -> ContextGuard<'_> {
        self.context.lock()
    }

    pub fn get_segment(
        &self,
        preferred_level: SegmentLevel,
        max_level: SegmentLevel,
        min_committed: usize,
    ) -> Option<SegmentId> {
        self.lock().get_segment(preferred_level, max_level, min_committed)
    }

    pub fn return_segment(&self, id: SegmentId) {
        self.lock().return_segment(id)
    }

    pub fn purge(&self) {
        self.lock().purge()
    }

    pub fn reserved_bytes(&self) -> usize {
        self.lock().volumes.reserved_bytes()
    }

    pub fn committed_bytes(&self) -> usize {
        self.lock().volumes.committed_bytes()
    }

    pub fn reservation_limit_hits(&self) -> usize {
        self.lock().volumes.reservation_limit_hits()
    }

    /// Bytes handed out by all arenas.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_used_bytes(&self, bytes: usize) {
        self.used_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_used_bytes(&self, bytes: usize) {
        let before = self.used_bytes.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(before >= bytes, "used bytes underflow");
    }

    pub fn report(&self) -> ContextReport {
        self.lock().report()
    }

    pub fn verify(&self) {
        self.lock().verify()
    }
}
