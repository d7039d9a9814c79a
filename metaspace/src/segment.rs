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

use log::trace;

use crate::{constants::SegmentLevel, util::is_aligned, volume::VolumeId};

/// Stable handle of a segment header inside a [`SegmentPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentId(u32);

impl SegmentId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SegmentState {
    /// Header sits in the pool and describes no memory.
    Dead,
    Free,
    InUse,
}

/// Header describing one buddy block.
///
/// Buddy links chain the segments of a region in address order, free-list
/// links chain free segments of equal level inside the segment manager.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Segment {
    pub(crate) base: usize,
    pub(crate) level: SegmentLevel,
    pub(crate) committed_bytes: usize,
    pub(crate) used_bytes: usize,
    pub(crate) state: SegmentState,
    pub(crate) prev_buddy: Option<SegmentId>,
    pub(crate) next_buddy: Option<SegmentId>,
    pub(crate) prev: Option<SegmentId>,
    pub(crate) next: Option<SegmentId>,
    pub(crate) volume: Option<VolumeId>,
}

impl Segment {
    fn dead() -> Self {
        Segment {
            base: 0,
            level: SegmentLevel::ROOT,
            committed_bytes: 0,
            used_bytes: 0,
            state: SegmentState::Dead,
            prev_buddy: None,
            next_buddy: None,
            prev: None,
            next: None,
            volume: None,
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn level(&self) -> SegmentLevel {
        self.level
    }

    #[inline]
    pub fn state(&self) -> SegmentState {
        self.state
    }

    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.level.bytes()
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.total_bytes()
    }

    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes
    }

    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.total_bytes() - self.used_bytes
    }

    /// Bytes that can be handed out without committing more memory.
    #[inline]
    pub fn free_below_committed(&self) -> usize {
        self.committed_bytes - self.used_bytes
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == SegmentState::Free
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.state == SegmentState::InUse
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.level.is_root()
    }

    #[inline]
    pub fn is_fully_committed(&self) -> bool {
        self.committed_bytes == self.total_bytes()
    }

    /// A segment leads its buddy pair if its base is aligned to the size of
    /// the pair. Meaningless for root segments.
    #[inline]
    pub fn is_leader(&self) -> bool {
        debug_assert!(!self.is_root());
        is_aligned(self.base, self.total_bytes() * 2)
    }

    /// `[base, end)`
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub(crate) fn check_bounds(&self) {
        assert!(
            self.used_bytes <= self.committed_bytes && self.committed_bytes <= self.total_bytes(),
            "segment at {:#x} broken: used {} committed {} total {}",
            self.base,
            self.used_bytes,
            self.committed_bytes,
            self.total_bytes()
        );
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x}) {} {:?} used {} committed {}",
            self.base,
            self.end(),
            self.level,
            self.state,
            self.used_bytes,
            self.committed_bytes
        )
    }
}

/// Flat storage of all segment headers.
///
/// Headers of merged segments are marked dead and reused LIFO.
#[derive(Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SegmentPool {
    headers: Vec<Segment>,
    dead: Vec<SegmentId>,
}

impl SegmentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a header in `Free` state describing `[base, base + level.bytes())`.
    pub(crate) fn allocate(
        &mut self,
        volume: VolumeId,
        base: usize,
        level: SegmentLevel,
    ) -> SegmentId {
        let id = match self.dead.pop() {
            Some(id) => id,
            None => {
                let index = u32::try_from(self.headers.len()).unwrap_or_else(|_| {
                    panic!("segment header pool exhausted")
                });
                self.headers.push(Segment::dead());
                SegmentId(index)
            }
        };

        let header = &mut self.headers[id.index()];
        debug_assert_eq!(header.state, SegmentState::Dead);
        *header = Segment {
            base,
            level,
            state: SegmentState::Free,
            volume: Some(volume),
            ..Segment::dead()
        };
        trace!("header {} initialized for {:#x} {}", id, base, level);
        id
    }

    /// Marks `id` dead and keeps it for reuse.
    pub(crate) fn release(&mut self, id: SegmentId) {
        let header = &mut self.headers[id.index()];
        debug_assert!(header.prev.is_none() && header.next.is_none());
        *header = Segment::dead();
        self.dead.push(id);
    }

    #[inline]
    pub fn get(&self, id: SegmentId) -> &Segment {
        &self.headers[id.index()]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: SegmentId) -> &mut Segment {
        &mut self.headers[id.index()]
    }

    /// Headers currently describing memory.
    pub fn used_headers(&self) -> usize {
        self.headers.len() - self.dead.len()
    }

    pub fn dead_headers(&self) -> usize {
        self.dead.len()
    }

    /// Iterates all live headers.
    pub fn iter(&self) -> impl Iterator<Item = (SegmentId, &Segment)> {
        self.headers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state != SegmentState::Dead)
            .map(|(i, s)| (SegmentId(i as u32), s))
    }
}
