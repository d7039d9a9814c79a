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

use std::sync::Arc;

use log::{debug, trace};

use crate::{
    block_manager::BlockManager,
    constants::{bytes_to_level, raw_bytes_for_requested, SegmentLevel, ENLARGE_SEGMENT_IN_PLACE, REGION_BYTES},
    context_holder::{ContextGuard, ContextHolder},
    growth_policy::ArenaGrowthPolicy,
    internal_stats::InternalStats,
    segment::SegmentId,
    util::is_aligned,
};

/// Arena-side copy of an in-use segment.
///
/// Bump allocation only touches this copy, the shared header is brought up
/// to date whenever the context lock is taken for this segment anyway.
#[derive(Debug, Clone, Copy)]
struct ArenaSegment {
    id: SegmentId,
    base: usize,
    level: SegmentLevel,
    committed: usize,
    used: usize,
}

impl ArenaSegment {
    fn load(ctx: &ContextGuard<'_>, id: SegmentId) -> Self {
        let seg = ctx.pool().get(id);
        Self {
            id,
            base: seg.base(),
            level: seg.level(),
            committed: seg.committed_bytes(),
            used: seg.used_bytes(),
        }
    }

    #[inline]
    fn total_bytes(&self) -> usize {
        self.level.bytes()
    }

    #[inline]
    fn free_bytes(&self) -> usize {
        self.total_bytes() - self.used
    }

    #[inline]
    fn free_below_committed(&self) -> usize {
        self.committed - self.used
    }

    #[inline]
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.total_bytes()
    }

    fn allocate(&mut self, bytes: usize) -> usize {
        debug_assert!(self.free_below_committed() >= bytes);
        let p = self.base + self.used;
        self.used += bytes;
        p
    }

    /// Writes the cached bump pointer back into the shared header.
    fn sync(&self, ctx: &mut ContextGuard<'_>) {
        ctx.set_used_bytes(self.id, self.used);
    }
}

/// Usage numbers of one arena, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArenaUsage {
    /// Bumped out of the arena's segments, including blocks waiting for reuse.
    pub used: usize,
    pub committed: usize,
    /// Total size of the arena's segments.
    pub capacity: usize,
    /// Freed blocks waiting for reuse.
    pub free_blocks: usize,
}

/// Unsynchronized allocator over a chain of segments.
///
/// Segments are never handed back one by one, all of them go back when the
/// arena is dropped.
pub struct Arena {
    context: Arc<ContextHolder>,
    stats: Arc<InternalStats>,
    policy: &'static ArenaGrowthPolicy,
    /// Oldest first, the last one is the current segment.
    segments: Vec<ArenaSegment>,
    block_manager: Option<BlockManager>,
}

impl Arena {
    pub fn new(context: Arc<ContextHolder>, stats: Arc<InternalStats>, policy: &'static ArenaGrowthPolicy) -> Self {
        stats.num_arena_births();
        Self {
            context,
            stats,
            policy,
            segments: Vec::new(),
            block_manager: None,
        }
    }

    /// Allocates `requested` bytes aligned to the metaspace alignment.
    ///
    /// Returns `None` if the commit limit is reached, nothing changes in that case.
    pub fn allocate(&mut self, requested: usize) -> Option<usize> {
        let raw = raw_bytes_for_requested(requested);
        assert!(raw <= REGION_BYTES, "{} bytes exceed a whole region", requested);

        if let Some(p) = self.allocate_from_block_manager(raw) {
            self.stats.num_allocs_from_block_manager();
            self.stats.num_allocs();
            return Some(p);
        }

        let p = match self.allocate_from_current_segment(raw) {
            Some(p) => Some(p),
            None => self.allocate_from_new_segment(raw),
        };

        match p {
            Some(p) => {
                self.context.add_used_bytes(raw);
                self.stats.num_allocs();
                trace!("allocated {} bytes at {:#x}", raw, p);
                Some(p)
            }
            None => {
                self.stats.num_allocs_failed_limit();
                debug!("allocation of {} bytes failed", raw);
                None
            }
        }
    }

    fn allocate_from_block_manager(&mut self, raw: usize) -> Option<usize> {
        self.block_manager.as_mut()?.allocate(raw)
    }

    fn allocate_from_current_segment(&mut self, raw: usize) -> Option<usize> {
        let fits = self.segments.last()?.free_bytes() >= raw;
        if !fits && !self.attempt_enlarge_current(raw) {
            return None;
        }

        let current = self.segments.last_mut()?;
        if current.free_below_committed() < raw {
            let mut ctx = self.context.lock();
            current.sync(&mut ctx);
            if !ctx.ensure_committed_enough(current.id, raw) {
                return None;
            }
            current.committed = ctx.pool().get(current.id).committed_bytes();
        }
        Some(current.allocate(raw))
    }

    /// Doubles the current segment in place if that is the cheaper way to fit `raw` more bytes.
    fn attempt_enlarge_current(&mut self, raw: usize) -> bool {
        if !ENLARGE_SEGMENT_IN_PLACE {
            return false;
        }
        let step = self.segments.len();
        let Some(current) = self.segments.last_mut() else {
            return false;
        };
        if current.level.is_root() {
            return false;
        }
        let needed = current.used + raw;
        if needed > REGION_BYTES {
            return false;
        }
        // only doubling is possible
        if bytes_to_level(needed).raw() + 1 < current.level.raw() {
            return false;
        }
        // the follower half cannot grow
        if !is_aligned(current.base, current.total_bytes() * 2) {
            return false;
        }
        // the arena is supposed to move on to smaller segments
        if self.policy.level_at_step(step) > current.level {
            return false;
        }

        let mut ctx = self.context.lock();
        current.sync(&mut ctx);
        if !ctx.attempt_enlarge_segment(current.id) {
            return false;
        }
        *current = ArenaSegment::load(&ctx, current.id);
        trace!("enlarged current segment to {}", current.level);
        true
    }

    fn allocate_from_new_segment(&mut self, raw: usize) -> Option<usize> {
        let max_level = bytes_to_level(raw);
        let preferred_level = self.policy.level_at_step(self.segments.len()).min(max_level);

        let new = {
            let mut ctx = self.context.lock();
            if let Some(current) = self.segments.last() {
                current.sync(&mut ctx);
            }
            let id = ctx.get_segment(preferred_level, max_level, raw)?;
            ArenaSegment::load(&ctx, id)
        };

        self.retire_current_segment();
        self.segments.push(new);
        let current = self.segments.last_mut()?;
        Some(current.allocate(raw))
    }

    /// Hands the committed rest of the current segment to the block manager.
    fn retire_current_segment(&mut self) {
        let Some(current) = self.segments.last_mut() else {
            return;
        };
        let remaining = current.free_below_committed();
        if remaining >= BlockManager::MIN_BYTES {
            let p = current.allocate(remaining);
            self.context.add_used_bytes(remaining);
            self.block_manager.get_or_insert_with(BlockManager::new).deallocate(p, remaining);
        }
        self.stats.num_segments_retired();
    }

    /// Makes `requested` bytes at `p` available for reuse by this arena.
    pub fn deallocate(&mut self, p: usize, requested: usize) {
        let raw = raw_bytes_for_requested(requested);
        debug_assert!(self.contains(p), "{:#x} was not allocated from this arena", p);
        self.block_manager.get_or_insert_with(BlockManager::new).deallocate(p, raw);
        self.stats.num_deallocs();
    }

    pub fn contains(&self, p: usize) -> bool {
        self.segments.iter().any(|s| s.contains(p))
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Level of every segment, oldest first.
    pub fn segment_levels(&self) -> Vec<SegmentLevel> {
        self.segments.iter().map(|s| s.level).collect()
    }

    pub fn usage_numbers(&self) -> ArenaUsage {
        let mut usage = self.segments.iter().fold(ArenaUsage::default(), |mut u, s| {
            u.used += s.used;
            u.committed += s.committed;
            u.capacity += s.total_bytes();
            u
        });
        usage.free_blocks = self.block_manager.as_ref().map_or(0, |bm| bm.total_bytes());
        usage
    }

    /// Panics if the arena's bookkeeping is broken.
    pub fn verify(&self) {
        for s in &self.segments {
            assert!(
                s.used <= s.committed && s.committed <= s.total_bytes(),
                "arena segment {} broken: used {} committed {} total {}",
                s.id,
                s.used,
                s.committed,
                s.total_bytes()
            );
        }
        if let Some(bm) = &self.block_manager {
            bm.verify();
            for (p, bytes) in bm.blocks() {
                let owner = self.segments.iter().find(|s| s.contains(p));
                assert!(
                    owner.is_some_and(|s| p + bytes <= s.base + s.used),
                    "free block {:#x}+{} outside of the arena",
                    p,
                    bytes
                );
            }
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let used: usize = self.segments.iter().map(|s| s.used).sum();
        {
            let mut ctx = self.context.lock();
            for s in self.segments.drain(..) {
                ctx.return_segment(s.id);
            }
        }
        self.context.sub_used_bytes(used);
        self.stats.num_arena_deaths();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        constants::{COMMIT_GRANULE_BYTES, K, M},
        context_holder::test::holder,
        metaspace_arena::MetaspaceType,
    };

    fn arena(context: &Arc<ContextHolder>, ty: MetaspaceType) -> Arena {
        Arena::new(context.clone(), Arc::new(InternalStats::new()), ArenaGrowthPolicy::for_type(ty))
    }

    #[test]
    fn test_first_segment_follows_policy() {
        let (holder, _os) = holder(usize::MAX);
        let context = Arc::new(holder);
        let mut a = arena(&context, MetaspaceType::Standard);

        let p = a.allocate(10).unwrap();
        assert!(is_aligned(p, crate::constants::META_ALIGNED_BYTES));
        assert_eq!(a.segment_levels(), vec![SegmentLevel::LV_4K]);
        assert_eq!(a.usage_numbers().used, 16);
        assert_eq!(context.used_bytes(), 16);
        a.verify();
    }

    #[test]
    fn test_enlarges_leader_in_place() {
        let (holder, _os) = holder(usize::MAX);
        let context = Arc::new(holder);
        let mut a = arena(&context, MetaspaceType::Standard);

        a.allocate(4 * K).unwrap();
        // the free buddy of the first 4K segment gets merged in
        a.allocate(2 * K).unwrap();
        assert_eq!(a.segment_levels(), vec![SegmentLevel::LV_8K]);
        a.verify();
        context.verify();
    }

    #[test]
    fn test_new_segment_when_buddy_busy() {
        let (holder, _os) = holder(usize::MAX);
        let context = Arc::new(holder);
        let mut a = arena(&context, MetaspaceType::Standard);
        let mut b = arena(&context, MetaspaceType::Standard);

        a.allocate(4 * K - 64).unwrap();
        // takes the buddy of a's segment
        b.allocate(8).unwrap();
        a.allocate(128).unwrap();

        assert_eq!(a.num_segments(), 2);
        // the 64 bytes left in the retired segment are kept for reuse
        assert_eq!(a.usage_numbers().free_blocks, 64);
        assert_eq!(a.allocate(64).map(|p| a.segments[0].contains(p)), Some(true));
        a.verify();
        b.verify();
    }

    #[test]
    fn test_boot_arena_does_not_enlarge() {
        let (holder, _os) = holder(usize::MAX);
        let context = Arc::new(holder);
        let mut a = arena(&context, MetaspaceType::Boot);

        a.allocate(4 * M).unwrap();
        a.allocate(M).unwrap();
        assert_eq!(a.segment_levels(), vec![SegmentLevel::LV_4M, SegmentLevel::LV_1M]);
    }

    #[test]
    fn test_deallocated_block_is_reused() {
        let (holder, _os) = holder(usize::MAX);
        let context = Arc::new(holder);
        let mut a = arena(&context, MetaspaceType::Standard);

        let p = a.allocate(1000).unwrap();
        a.allocate(1000).unwrap();
        a.deallocate(p, 1000);
        let q = a.allocate(900).unwrap();
        assert!(q >= p && q + 900 <= p + 1000);
        a.verify();
    }

    #[test]
    fn test_commit_limit_fails_cleanly() {
        let (holder, _os) = holder(COMMIT_GRANULE_BYTES);
        let context = Arc::new(holder);
        let mut a = arena(&context, MetaspaceType::Standard);

        a.allocate(8).unwrap();
        let before = (a.usage_numbers(), context.used_bytes(), context.committed_bytes());
        assert_eq!(a.allocate(64 * K), None);
        assert_eq!(before, (a.usage_numbers(), context.used_bytes(), context.committed_bytes()));
    }

    #[test]
    fn test_drop_returns_everything() {
        let (holder, _os) = holder(usize::MAX);
        let context = Arc::new(holder);
        {
            let mut a = arena(&context, MetaspaceType::Standard);
            let mut b = arena(&context, MetaspaceType::Boot);
            for _ in 0..100 {
                a.allocate(300).unwrap();
                b.allocate(5000).unwrap();
            }
        }
        assert_eq!(context.used_bytes(), 0);
        let report = context.report();
        assert_eq!(report.free_bytes, REGION_BYTES);
        assert_eq!(report.levels.len(), 1);
        assert_eq!(report.levels[0].level, SegmentLevel::ROOT);
        context.verify();
    }
}
