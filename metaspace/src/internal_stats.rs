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

//! Diagnostic event counters.
//!
//! All counters use `Relaxed` ordering and are never used for allocation
//! decisions.

use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

macro_rules! internal_stats {
    ($($name:ident: $desc:literal,)*) => {
        /// Counters of allocator events of one metaspace instance.
        #[derive(Default)]
        pub struct InternalStats {
            $($name: AtomicU64,)*
        }

        /// Point in time copy of [`InternalStats`].
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct InternalStatsSnapshot {
            $(pub $name: u64,)*
        }

        impl InternalStats {
            pub fn new() -> Self {
                Self::default()
            }

            $(
                #[inline]
                pub(crate) fn $name(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> InternalStatsSnapshot {
                InternalStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }

        impl fmt::Display for InternalStatsSnapshot {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                $(writeln!(f, "{:>44}: {}", $desc, self.$name)?;)*
                Ok(())
            }
        }
    };
}

internal_stats! {
    num_allocs: "allocations",
    num_deallocs: "deallocations",
    num_allocs_from_block_manager: "allocations served from freed blocks",
    num_segments_retired: "segments retired",
    num_allocs_failed_limit: "allocations failed at the commit limit",
    num_arena_births: "arenas created",
    num_arena_deaths: "arenas destroyed",
    num_volumes_births: "volumes reserved",
    num_volumes_deaths: "volumes released",
    num_range_committed: "ranges committed",
    num_range_uncommitted: "ranges uncommitted",
    num_segments_returned_to_manager: "segments returned to the free lists",
    num_segments_taken_from_manager: "segments taken from the free lists",
    num_segments_merged: "buddy merges",
    num_segments_split: "buddy splits",
    num_segments_enlarged: "segments enlarged in place",
    num_purges: "purges",
}
