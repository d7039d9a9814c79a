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

use log::trace;

use crate::{
    constants::{SegmentLevel, REGION_BYTES},
    segment::{SegmentId, SegmentPool},
    segment_manager::SegmentManager,
    volume::VolumeId,
};

/// A 16 MiB span of a volume; the universe of one buddy tree.
///
/// The segments of a region form a chain in address order starting at the
/// root segment's header, which stays at the region base for the lifetime
/// of the region.
pub struct Region {
    base: usize,
    first: Option<SegmentId>,
}

impl Region {
    pub(crate) fn new(base: usize) -> Self {
        Self { base, first: None }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.base + REGION_BYTES
    }

    /// `[base, end)`
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Whether the region has never been used or has merged back into one free root.
    pub fn is_free(&self, pool: &SegmentPool) -> bool {
        match self.first {
            None => true,
            Some(first) => {
                let seg = pool.get(first);
                seg.is_root() && seg.is_free()
            }
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.first.is_some()
    }

    /// Creates the root segment covering the whole region.
    pub(crate) fn alloc_root_segment(&mut self, pool: &mut SegmentPool, volume: VolumeId) -> SegmentId {
        assert!(self.first.is_none(), "region {:#x} already has a root segment", self.base);
        let id = pool.allocate(volume, self.base, SegmentLevel::ROOT);
        self.first = Some(id);
        trace!("region {:#x}: root segment {}", self.base, id);
        id
    }

    /// Iterates the buddy chain in address order.
    pub fn segments<'a>(&self, pool: &'a SegmentPool) -> impl Iterator<Item = SegmentId> + 'a {
        let mut curr = self.first;
        core::iter::from_fn(move || {
            let c = curr?;
            curr = pool.get(c).next_buddy;
            Some(c)
        })
    }

    /// Halves the free segment `source` until it reaches `target`.
    ///
    /// `source` keeps the lowest part and stays out of the free lists, every
    /// split-off half is registered with `manager`.
    pub(crate) fn split(
        &self,
        pool: &mut SegmentPool,
        manager: &mut SegmentManager,
        source: SegmentId,
        target: SegmentLevel,
    ) {
        debug_assert!(self.contains(pool.get(source).base()));
        debug_assert!(pool.get(source).is_free());
        debug_assert!(pool.get(source).level() <= target);

        while pool.get(source).level() < target {
            let (volume, old_committed, splinter_base, level, old_next) = {
                let seg = pool.get_mut(source);
                let old_committed = seg.committed_bytes;
                seg.level = seg.level.finer();
                (seg.volume, old_committed, seg.end(), seg.level, seg.next_buddy)
            };
            let Some(volume) = volume else {
                panic!("segment {} has no volume", source);
            };

            let splinter = pool.allocate(volume, splinter_base, level);
            let half = level.bytes();
            if old_committed >= half {
                pool.get_mut(source).committed_bytes = half;
                pool.get_mut(splinter).committed_bytes = old_committed - half;
            } else {
                pool.get_mut(splinter).committed_bytes = 0;
            }

            {
                let s = pool.get_mut(splinter);
                s.prev_buddy = Some(source);
                s.next_buddy = old_next;
            }
            if let Some(next) = old_next {
                pool.get_mut(next).prev_buddy = Some(splinter);
            }
            pool.get_mut(source).next_buddy = Some(splinter);

            trace!("split {} -> {} at {:#x} {}", source, splinter, splinter_base, level);
            manager.add(pool, splinter);
        }
    }

    /// Merges the free segment `id` with free buddies as far as possible.
    ///
    /// Absorbed buddies leave `manager` and their headers return to the pool.
    /// Returns the resulting segment, which is `id` itself when nothing merged.
    /// The result is not registered with `manager`.
    pub(crate) fn merge(
        &self,
        pool: &mut SegmentPool,
        manager: &mut SegmentManager,
        id: SegmentId,
    ) -> SegmentId {
        debug_assert!(self.contains(pool.get(id).base()));
        let mut current = id;

        loop {
            let seg = pool.get(current);
            debug_assert!(seg.is_free());
            debug_assert_eq!(seg.used_bytes(), 0);
            if seg.is_root() {
                break;
            }

            let is_leader = seg.is_leader();
            let Some(buddy) = (if is_leader { seg.next_buddy } else { seg.prev_buddy }) else {
                break;
            };
            let b = pool.get(buddy);
            debug_assert!(b.level() >= seg.level());
            if b.level() != seg.level() || !b.is_free() {
                break;
            }

            manager.remove(pool, buddy);
            let (leader, follower) = if is_leader {
                (current, buddy)
            } else {
                (buddy, current)
            };

            let merged_committed = {
                let l = pool.get(leader);
                // a follower's commit only counts when it continues the leader's
                if l.is_fully_committed() {
                    l.committed_bytes() + pool.get(follower).committed_bytes()
                } else {
                    l.committed_bytes()
                }
            };

            let after = pool.get(follower).next_buddy;
            if let Some(a) = after {
                pool.get_mut(a).prev_buddy = Some(leader);
            }
            {
                let l = pool.get_mut(leader);
                l.next_buddy = after;
                l.level = l.level.coarser();
                l.committed_bytes = merged_committed;
            }
            pool.release(follower);

            trace!("merged {} into {} -> {}", follower, leader, pool.get(leader).level());
            current = leader;
        }

        current
    }

    /// Grows the in-use leader `id` by absorbing its free buddy, keeping its data.
    pub(crate) fn attempt_enlarge_segment(
        &self,
        pool: &mut SegmentPool,
        manager: &mut SegmentManager,
        id: SegmentId,
    ) -> bool {
        let seg = pool.get(id);
        debug_assert!(seg.is_in_use());
        if seg.is_root() || !seg.is_leader() {
            return false;
        }
        let Some(buddy) = seg.next_buddy else {
            return false;
        };
        let b = pool.get(buddy);
        if b.level() != seg.level() || !b.is_free() {
            return false;
        }

        let merged_committed = if seg.is_fully_committed() {
            seg.committed_bytes() + b.committed_bytes()
        } else {
            seg.committed_bytes()
        };

        manager.remove(pool, buddy);
        let after = pool.get(buddy).next_buddy;
        if let Some(a) = after {
            pool.get_mut(a).prev_buddy = Some(id);
        }
        pool.release(buddy);

        let seg = pool.get_mut(id);
        seg.next_buddy = after;
        seg.level = seg.level.coarser();
        seg.committed_bytes = merged_committed;
        trace!("enlarged {} in place -> {}", id, seg.level());
        true
    }

    /// Panics if the buddy chain does not tile the used part of the region.
    pub(crate) fn verify(&self, pool: &SegmentPool) {
        let Some(first) = self.first else {
            return;
        };
        assert_eq!(pool.get(first).base(), self.base, "first segment not at region base");
        let mut expected_base = self.base;
        let mut prev = None;
        for id in self.segments(pool) {
            let seg = pool.get(id);
            assert_eq!(seg.base(), expected_base, "gap in buddy chain at {}", id);
            assert_eq!(seg.prev_buddy, prev, "broken back link at {}", id);
            assert!(
                seg.base() % seg.total_bytes() == 0,
                "segment {} misaligned for {}",
                id,
                seg.level()
            );
            seg.check_bounds();
            expected_base = seg.end();
            prev = Some(id);
        }
        assert_eq!(expected_base, self.end(), "buddy chain does not cover region {:#x}", self.base);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        constants::{COMMIT_GRANULE_BYTES, M},
        segment::SegmentState,
    };

    fn setup() -> (Region, SegmentPool, SegmentManager, SegmentId) {
        let mut region = Region::new(REGION_BYTES);
        let mut pool = SegmentPool::new();
        let root = region.alloc_root_segment(&mut pool, VolumeId::new(0));
        (region, pool, SegmentManager::new(), root)
    }

    #[test]
    fn test_split_to_level() {
        let (region, mut pool, mut manager, root) = setup();
        region.split(&mut pool, &mut manager, root, SegmentLevel::LV_4M);

        assert_eq!(pool.get(root).level(), SegmentLevel::LV_4M);
        assert_eq!(pool.get(root).base(), REGION_BYTES);
        // one 8M and one 4M splinter
        assert_eq!(manager.num_segments(), 2);
        assert_eq!(manager.num_segments_at_level(SegmentLevel::new(1)), 1);
        assert_eq!(manager.num_segments_at_level(SegmentLevel::LV_4M), 1);
        region.verify(&pool);
        assert!(!region.is_free(&pool));
    }

    #[test]
    fn test_split_distributes_commit() {
        let (region, mut pool, mut manager, root) = setup();
        pool.get_mut(root).committed_bytes = 9 * M;
        region.split(&mut pool, &mut manager, root, SegmentLevel::new(1));
        let follower = pool.get(root).next_buddy.unwrap();
        assert_eq!(pool.get(root).committed_bytes(), 8 * M);
        assert_eq!(pool.get(follower).committed_bytes(), M);

        let (region, mut pool, mut manager, root) = setup();
        pool.get_mut(root).committed_bytes = 3 * M;
        region.split(&mut pool, &mut manager, root, SegmentLevel::new(1));
        let follower = pool.get(root).next_buddy.unwrap();
        assert_eq!(pool.get(root).committed_bytes(), 3 * M);
        assert_eq!(pool.get(follower).committed_bytes(), 0);
    }

    #[test]
    fn test_split_merge_inverse() {
        for committed in [0, COMMIT_GRANULE_BYTES, 8 * M, 9 * M, REGION_BYTES] {
            let (region, mut pool, mut manager, root) = setup();
            pool.get_mut(root).committed_bytes = committed;
            region.split(&mut pool, &mut manager, root, SegmentLevel::new(1));

            let merged = region.merge(&mut pool, &mut manager, root);
            assert_eq!(merged, root);
            let seg = pool.get(merged);
            assert_eq!(seg.level(), SegmentLevel::ROOT);
            assert_eq!(seg.base(), REGION_BYTES);
            assert_eq!(seg.committed_bytes(), committed);
            assert_eq!(manager.num_segments(), 0);
            assert_eq!(pool.used_headers(), 1);
        }
    }

    #[test]
    fn test_merge_from_follower() {
        let (region, mut pool, mut manager, root) = setup();
        region.split(&mut pool, &mut manager, root, SegmentLevel::LV_1M);
        manager.add(&mut pool, root);
        let follower = pool.get(root).next_buddy.unwrap();
        manager.remove(&mut pool, follower);

        let merged = region.merge(&mut pool, &mut manager, follower);
        assert_eq!(merged, root);
        assert!(region.is_free(&pool));
        region.verify(&pool);
    }

    #[test]
    fn test_merge_stops_at_busy_buddy() {
        let (region, mut pool, mut manager, root) = setup();
        region.split(&mut pool, &mut manager, root, SegmentLevel::new(1));
        let follower = pool.get(root).next_buddy.unwrap();
        manager.remove(&mut pool, follower);
        pool.get_mut(follower).state = SegmentState::InUse;

        assert_eq!(region.merge(&mut pool, &mut manager, root), root);
        assert_eq!(pool.get(root).level(), SegmentLevel::new(1));
    }

    #[test]
    fn test_merge_keeps_commit_contiguous() {
        let (region, mut pool, mut manager, root) = setup();
        region.split(&mut pool, &mut manager, root, SegmentLevel::new(1));
        let follower = pool.get(root).next_buddy.unwrap();
        // leader partially committed, follower fully: the follower's commit is dropped
        pool.get_mut(root).committed_bytes = M;
        manager.remove(&mut pool, follower);
        pool.get_mut(follower).committed_bytes = 8 * M;
        manager.add(&mut pool, follower);

        region.merge(&mut pool, &mut manager, root);
        assert_eq!(pool.get(root).committed_bytes(), M);
    }

    #[test]
    fn test_enlarge_in_place() {
        let (region, mut pool, mut manager, root) = setup();
        region.split(&mut pool, &mut manager, root, SegmentLevel::new(1));
        {
            let seg = pool.get_mut(root);
            seg.state = SegmentState::InUse;
            seg.committed_bytes = 8 * M;
            seg.used_bytes = 5 * M;
        }
        assert!(region.attempt_enlarge_segment(&mut pool, &mut manager, root));
        let seg = pool.get(root);
        assert!(seg.is_root());
        assert_eq!(seg.used_bytes(), 5 * M);
        assert_eq!(seg.committed_bytes(), 8 * M);
        assert_eq!(manager.num_segments(), 0);
        // root segments cannot grow any further
        assert!(!region.attempt_enlarge_segment(&mut pool, &mut manager, root));
    }

    #[test]
    fn test_enlarge_rejects_follower() {
        let (region, mut pool, mut manager, root) = setup();
        region.split(&mut pool, &mut manager, root, SegmentLevel::new(1));
        let follower = pool.get(root).next_buddy.unwrap();
        manager.remove(&mut pool, follower);
        pool.get_mut(follower).state = SegmentState::InUse;
        assert!(!region.attempt_enlarge_segment(&mut pool, &mut manager, follower));
    }

    #[test]
    fn test_containment_is_half_open() {
        let region = Region::new(REGION_BYTES);
        assert!(region.contains(REGION_BYTES));
        assert!(region.contains(2 * REGION_BYTES - 1));
        assert!(!region.contains(2 * REGION_BYTES));
        assert!(!region.contains(REGION_BYTES - 1));
    }
}
