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

use crate::{constants::SegmentLevel, metaspace_arena::MetaspaceType};

/// Segment sizes an arena asks for, indexed by the number of segments it already owns.
///
/// Once an arena owns more segments than there are entries, the last entry repeats.
#[derive(Debug)]
pub struct ArenaGrowthPolicy {
    levels: &'static [SegmentLevel],
}

static BOOT_POLICY: ArenaGrowthPolicy = ArenaGrowthPolicy {
    levels: &[SegmentLevel::LV_4M, SegmentLevel::LV_1M],
};

static STANDARD_POLICY: ArenaGrowthPolicy = ArenaGrowthPolicy {
    levels: &[
        SegmentLevel::LV_4K,
        SegmentLevel::LV_4K,
        SegmentLevel::LV_4K,
        SegmentLevel::LV_8K,
        SegmentLevel::LV_16K,
    ],
};

impl ArenaGrowthPolicy {
    pub fn for_type(ty: MetaspaceType) -> &'static ArenaGrowthPolicy {
        match ty {
            MetaspaceType::Boot => &BOOT_POLICY,
            MetaspaceType::Standard => &STANDARD_POLICY,
        }
    }

    pub fn level_at_step(&self, step: usize) -> SegmentLevel {
        self.levels[step.min(self.levels.len() - 1)]
    }
}
