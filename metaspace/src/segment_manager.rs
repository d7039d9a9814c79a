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
    constants::SegmentLevel,
    segment::{SegmentId, SegmentPool, SegmentState},
};

#[derive(Default, Clone, Copy)]
struct FreeList {
    head: Option<SegmentId>,
    count: usize,
}

/// Free segments, one list per level.
///
/// Each list is sorted ascending by committed bytes, so the first match of a
/// search wastes the least already committed memory.
pub struct SegmentManager {
    lists: [FreeList; SegmentLevel::NUM_LEVELS],
}

impl SegmentManager {
    pub fn new() -> Self {
        Self {
            lists: [FreeList::default(); SegmentLevel::NUM_LEVELS],
        }
    }

    /// Inserts a free segment before the first one with at least as many committed bytes.
    pub(crate) fn add(&mut self, pool: &mut SegmentPool, id: SegmentId) {
        let (level, committed) = {
            let seg = pool.get(id);
            debug_assert_eq!(seg.state(), SegmentState::Free);
            debug_assert!(seg.prev.is_none() && seg.next.is_none());
            (seg.level(), seg.committed_bytes())
        };

        let list = &mut self.lists[level.index()];
        let mut prev: Option<SegmentId> = None;
        let mut curr = list.head;
        while let Some(c) = curr {
            if pool.get(c).committed_bytes() >= committed {
                break;
            }
            prev = curr;
            curr = pool.get(c).next;
        }

        {
            let seg = pool.get_mut(id);
            seg.prev = prev;
            seg.next = curr;
        }
        match prev {
            Some(p) => pool.get_mut(p).next = Some(id),
            None => list.head = Some(id),
        }
        if let Some(c) = curr {
            pool.get_mut(c).prev = Some(id);
        }
        list.count += 1;
        trace!("free list {}: added {}", level, id);
    }

    /// Unlinks `id` from its free list.
    pub(crate) fn remove(&mut self, pool: &mut SegmentPool, id: SegmentId) {
        let (level, prev, next) = {
            let seg = pool.get(id);
            (seg.level(), seg.prev, seg.next)
        };
        let list = &mut self.lists[level.index()];
        debug_assert!(list.count > 0);

        match prev {
            Some(p) => pool.get_mut(p).next = next,
            None => {
                debug_assert_eq!(list.head, Some(id));
                list.head = next;
            }
        }
        if let Some(n) = next {
            pool.get_mut(n).prev = prev;
        }
        let seg = pool.get_mut(id);
        seg.prev = None;
        seg.next = None;
        list.count -= 1;
    }

    /// First free segment at `level` with at least `min_committed` committed bytes.
    fn find_at_level(
        &self,
        pool: &SegmentPool,
        level: SegmentLevel,
        min_committed: usize,
    ) -> Option<SegmentId> {
        let mut curr = self.lists[level.index()].head;
        while let Some(c) = curr {
            let seg = pool.get(c);
            if seg.committed_bytes() >= min_committed {
                return Some(c);
            }
            curr = seg.next;
        }
        None
    }

    /// Takes the first sufficiently committed segment from `level` up to
    /// `max_level` (towards smaller segments).
    pub(crate) fn search_ascending(
        &mut self,
        pool: &mut SegmentPool,
        level: SegmentLevel,
        max_level: SegmentLevel,
        min_committed: usize,
    ) -> Option<SegmentId> {
        if level > max_level {
            return None;
        }
        for l in SegmentLevel::range(level, max_level) {
            if let Some(id) = self.find_at_level(pool, l, min_committed) {
                self.remove(pool, id);
                return Some(id);
            }
        }
        None
    }

    /// Takes the first sufficiently committed segment from `level` down to
    /// the root level (towards larger segments).
    pub(crate) fn search_descending(
        &mut self,
        pool: &mut SegmentPool,
        level: SegmentLevel,
        min_committed: usize,
    ) -> Option<SegmentId> {
        for l in SegmentLevel::range(SegmentLevel::ROOT, level).rev() {
            if let Some(id) = self.find_at_level(pool, l, min_committed) {
                self.remove(pool, id);
                return Some(id);
            }
        }
        None
    }

    pub fn num_segments_at_level(&self, level: SegmentLevel) -> usize {
        self.lists[level.index()].count
    }

    pub fn num_segments(&self) -> usize {
        self.lists.iter().map(|l| l.count).sum()
    }

    /// Total size of all free segments.
    pub fn total_bytes(&self) -> usize {
        SegmentLevel::all()
            .map(|l| self.lists[l.index()].count * l.bytes())
            .sum()
    }

    pub fn committed_bytes_at_level(&self, pool: &SegmentPool, level: SegmentLevel) -> usize {
        self.iter_level(pool, level)
            .map(|id| pool.get(id).committed_bytes())
            .sum()
    }

    pub fn committed_bytes(&self, pool: &SegmentPool) -> usize {
        SegmentLevel::all()
            .map(|l| self.committed_bytes_at_level(pool, l))
            .sum()
    }

    pub fn contains(&self, pool: &SegmentPool, id: SegmentId) -> bool {
        let level = pool.get(id).level();
        self.iter_level(pool, level).any(|c| c == id)
    }

    /// Iterates the free list of `level` in list order.
    pub fn iter_level<'a>(
        &self,
        pool: &'a SegmentPool,
        level: SegmentLevel,
    ) -> impl Iterator<Item = SegmentId> + 'a {
        let mut curr = self.lists[level.index()].head;
        core::iter::from_fn(move || {
            let c = curr?;
            curr = pool.get(c).next;
            Some(c)
        })
    }

    /// Panics if a list is unsorted, miscounted or holds a non-free segment.
    pub(crate) fn verify(&self, pool: &SegmentPool) {
        for level in SegmentLevel::all() {
            let mut count = 0;
            let mut last_committed = 0;
            let mut prev = None;
            for id in self.iter_level(pool, level) {
                let seg = pool.get(id);
                assert!(seg.is_free(), "{} in free list {} is not free", id, level);
                assert_eq!(seg.level(), level, "{} in wrong free list", id);
                assert_eq!(seg.prev, prev, "broken back link at {}", id);
                assert!(
                    seg.committed_bytes() >= last_committed,
                    "free list {} not sorted at {}",
                    level,
                    id
                );
                last_committed = seg.committed_bytes();
                prev = Some(id);
                count += 1;
            }
            assert_eq!(count, self.lists[level.index()].count, "free list {} miscounted", level);
        }
    }
}

impl Default for SegmentManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{constants::K, volume::VolumeId};

    fn free_segment(pool: &mut SegmentPool, base: usize, level: SegmentLevel, committed: usize) -> SegmentId {
        let id = pool.allocate(VolumeId::new(0), base, level);
        pool.get_mut(id).committed_bytes = committed;
        id
    }

    #[test]
    fn test_sorted_by_committed() {
        let mut pool = SegmentPool::new();
        let mut manager = SegmentManager::new();
        let level = SegmentLevel::LV_4K;
        let a = free_segment(&mut pool, 0, level, 2 * K);
        let b = free_segment(&mut pool, 4 * K, level, 0);
        let c = free_segment(&mut pool, 8 * K, level, 4 * K);
        let d = free_segment(&mut pool, 12 * K, level, 2 * K);
        for id in [a, b, c, d] {
            manager.add(&mut pool, id);
        }
        manager.verify(&pool);

        let order: Vec<_> = manager.iter_level(&pool, level).collect();
        // equal committed sizes: the newer one goes first
        assert_eq!(order, vec![b, d, a, c]);
        assert_eq!(manager.num_segments(), 4);
        assert_eq!(manager.total_bytes(), 16 * K);
        assert_eq!(manager.committed_bytes_at_level(&pool, level), 8 * K);
    }

    #[test]
    fn test_search_takes_first_sufficient() {
        let mut pool = SegmentPool::new();
        let mut manager = SegmentManager::new();
        let small = free_segment(&mut pool, 0, SegmentLevel::LV_4K, 0);
        let big = free_segment(&mut pool, 64 * K, SegmentLevel::LV_64K, 64 * K);
        manager.add(&mut pool, small);
        manager.add(&mut pool, big);

        // nothing at 4K is committed enough, and ascending never looks at larger segments
        assert_eq!(
            manager.search_ascending(&mut pool, SegmentLevel::LV_4K, SegmentLevel::LV_1K, 1),
            None
        );
        assert_eq!(
            manager.search_descending(&mut pool, SegmentLevel::LV_4K, 1),
            Some(big)
        );
        assert!(!manager.contains(&pool, big));
        assert_eq!(
            manager.search_ascending(&mut pool, SegmentLevel::LV_4K, SegmentLevel::LV_1K, 0),
            Some(small)
        );
        assert_eq!(manager.num_segments(), 0);
        manager.verify(&pool);
    }

    #[test]
    fn test_remove_middle() {
        let mut pool = SegmentPool::new();
        let mut manager = SegmentManager::new();
        let level = SegmentLevel::LV_8K;
        let ids: Vec<_> = (0..3)
            .map(|i| free_segment(&mut pool, i * 8 * K, level, i * K))
            .collect();
        for id in &ids {
            manager.add(&mut pool, *id);
        }
        manager.remove(&mut pool, ids[1]);
        manager.verify(&pool);
        assert_eq!(
            manager.iter_level(&pool, level).collect::<Vec<_>>(),
            vec![ids[0], ids[2]]
        );
    }
}
