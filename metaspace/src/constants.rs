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

use core::fmt;

use static_assertions::const_assert;

use crate::util::{align_up, is_power_of_two};

pub const K: usize = 1024;
pub const M: usize = 1024 * K;

/// Size of one buddy universe. Segments never cross a region boundary.
pub const REGION_BYTES: usize = 16 * M;

/// Number of regions reserved per volume.
pub const REGIONS_PER_VOLUME: usize = 4;

pub const VOLUME_DEFAULT_BYTES: usize = REGIONS_PER_VOLUME * REGION_BYTES;

/// Smallest unit at which memory is committed or uncommitted.
pub const COMMIT_GRANULE_BYTES: usize = 64 * K;

/// Alignment of every block handed out by an arena.
pub const META_ALIGNED_BYTES: usize = core::mem::size_of::<usize>();

/// Whether an arena may grow its current segment in place by absorbing a free buddy.
pub const ENLARGE_SEGMENT_IN_PLACE: bool = true;

const_assert!(REGION_BYTES % COMMIT_GRANULE_BYTES == 0);
const_assert!(VOLUME_DEFAULT_BYTES % REGION_BYTES == 0);
const_assert!(REGION_BYTES >> (SegmentLevel::NUM_LEVELS - 1) == K);
const_assert!(META_ALIGNED_BYTES.is_power_of_two());

/// Size class of a segment: level 0 is a whole region (16 MiB), level 15 is 1 KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentLevel(u8);

impl SegmentLevel {
    pub const NUM_LEVELS: usize = 16;

    pub const ROOT: SegmentLevel = SegmentLevel(0);
    pub const HIGHEST: SegmentLevel = SegmentLevel(Self::NUM_LEVELS as u8 - 1);

    pub const LV_16M: SegmentLevel = SegmentLevel(0);
    pub const LV_4M: SegmentLevel = SegmentLevel(2);
    pub const LV_1M: SegmentLevel = SegmentLevel(4);
    pub const LV_64K: SegmentLevel = SegmentLevel(8);
    pub const LV_16K: SegmentLevel = SegmentLevel(10);
    pub const LV_8K: SegmentLevel = SegmentLevel(11);
    pub const LV_4K: SegmentLevel = SegmentLevel(12);
    pub const LV_1K: SegmentLevel = SegmentLevel(15);

    /// Panics if `raw` is not a valid level.
    pub const fn new(raw: u8) -> Self {
        assert!((raw as usize) < Self::NUM_LEVELS, "invalid segment level");
        SegmentLevel(raw)
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }

    /// Size in bytes of a segment at this level.
    #[inline]
    pub const fn bytes(self) -> usize {
        REGION_BYTES >> self.0
    }

    /// The next smaller size class (one split step).
    #[inline]
    pub fn finer(self) -> SegmentLevel {
        debug_assert!(self < Self::HIGHEST);
        SegmentLevel(self.0 + 1)
    }

    /// The next larger size class (one merge step).
    #[inline]
    pub fn coarser(self) -> SegmentLevel {
        debug_assert!(!self.is_root());
        SegmentLevel(self.0 - 1)
    }

    /// Iterates all levels from `ROOT` to `HIGHEST`.
    pub fn all() -> impl DoubleEndedIterator<Item = SegmentLevel> {
        (0..Self::NUM_LEVELS as u8).map(SegmentLevel)
    }

    /// Iterates the inclusive range `[from, to]` in ascending level order.
    pub fn range(from: SegmentLevel, to: SegmentLevel) -> impl DoubleEndedIterator<Item = SegmentLevel> {
        (from.0..=to.0).map(SegmentLevel)
    }
}

impl fmt::Display for SegmentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.bytes();
        if bytes >= M {
            write!(f, "lv{:02}({}M)", self.0, bytes / M)
        } else {
            write!(f, "lv{:02}({}K)", self.0, bytes / K)
        }
    }
}

#[inline]
pub const fn level_to_bytes(level: SegmentLevel) -> usize {
    level.bytes()
}

/// Returns the level of the smallest segment that can hold `bytes`.
///
/// `bytes` must not exceed one region.
pub fn bytes_to_level(bytes: usize) -> SegmentLevel {
    assert!(bytes <= REGION_BYTES, "request of {} bytes exceeds a region", bytes);
    if bytes <= SegmentLevel::HIGHEST.bytes() {
        return SegmentLevel::HIGHEST;
    }
    let rounded = bytes.next_power_of_two();
    debug_assert!(is_power_of_two(rounded));
    let shift = REGION_BYTES.trailing_zeros() - rounded.trailing_zeros();
    SegmentLevel(shift as u8)
}

/// Bytes actually consumed for a request of `requested` bytes.
#[inline]
pub fn raw_bytes_for_requested(requested: usize) -> usize {
    align_up(
        requested.max(crate::block_manager::BlockManager::MIN_BYTES),
        META_ALIGNED_BYTES,
    )
}
