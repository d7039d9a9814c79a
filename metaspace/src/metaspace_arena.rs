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

use core::ptr::{self, NonNull};

use parking_lot::Mutex;

use crate::{
    arena::{Arena, ArenaUsage},
    constants::SegmentLevel,
    growth_policy::ArenaGrowthPolicy,
    metaspace::Metaspace,
};

/// Selects the growth policy of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MetaspaceType {
    /// Few large allocations early on.
    Boot,
    Standard,
}

/// Thread safe arena handed out to the rest of the runtime.
pub struct MetaspaceArena {
    ty: MetaspaceType,
    arena: Mutex<Arena>,
}

impl MetaspaceArena {
    pub fn new(metaspace: &Metaspace, ty: MetaspaceType) -> Self {
        Self {
            ty,
            arena: Mutex::new(Arena::new(
                metaspace.context().clone(),
                metaspace.stats().clone(),
                ArenaGrowthPolicy::for_type(ty),
            )),
        }
    }

    #[inline]
    pub fn metaspace_type(&self) -> MetaspaceType {
        self.ty
    }

    /// Allocates `bytes` zeroed bytes aligned to a machine word.
    ///
    /// `None` means the commit limit or the GC threshold is reached.
    pub fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let p = self.arena.lock().allocate(bytes)? as *mut u8;
        // SAFETY: the arena just handed out `bytes` committed bytes at `p`
        unsafe { ptr::write_bytes(p, 0, bytes) };
        NonNull::new(p)
    }

    /// Returns a block previously allocated with the same `bytes` from this arena.
    ///
    /// The block is only reused by this arena, its memory goes back when the
    /// arena is dropped.
    pub fn deallocate(&self, p: NonNull<u8>, bytes: usize) {
        self.arena.lock().deallocate(p.as_ptr() as usize, bytes)
    }

    pub fn contains(&self, p: NonNull<u8>) -> bool {
        self.arena.lock().contains(p.as_ptr() as usize)
    }

    pub fn usage_numbers(&self) -> ArenaUsage {
        self.arena.lock().usage_numbers()
    }

    /// Levels of the owned segments, oldest first.
    pub fn segment_levels(&self) -> Vec<SegmentLevel> {
        self.arena.lock().segment_levels()
    }

    pub fn verify(&self) {
        self.arena.lock().verify()
    }
}
