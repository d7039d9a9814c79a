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

use crate::{
    commit_mask::CommittedMask,
    constants::{REGION_BYTES, REGIONS_PER_VOLUME},
    region::Region,
    segment::{SegmentId, SegmentPool},
};

/// Index of a volume inside its [`VolumeList`](crate::volume_list::VolumeList).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VolumeId(usize);

impl VolumeId {
    #[inline]
    pub(crate) const fn new(index: usize) -> Self {
        VolumeId(index)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// One reservation of address space, carved into regions.
///
/// Regions are handed out in address order and never given back; a region
/// that merged back into a free root segment is reused through the free lists.
pub struct Volume {
    base: usize,
    reserved_bytes: usize,
    pub(crate) mask: CommittedMask,
    regions: Vec<Region>,
    next_region_index: usize,
}

impl Volume {
    pub(crate) fn new(base: usize, reserved_bytes: usize) -> Self {
        debug_assert_eq!(reserved_bytes % REGION_BYTES, 0);
        let num_regions = reserved_bytes / REGION_BYTES;
        Self {
            base,
            reserved_bytes,
            mask: CommittedMask::new(base, reserved_bytes),
            regions: (0..num_regions)
                .map(|i| Region::new(base + i * REGION_BYTES))
                .collect(),
            next_region_index: 0,
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.reserved_bytes
    }

    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    pub fn committed_bytes(&self) -> usize {
        self.mask.committed_bytes()
    }

    /// `[base, end)`
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn is_full(&self) -> bool {
        self.next_region_index >= self.regions.len()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn mask(&self) -> &CommittedMask {
        &self.mask
    }

    /// Region containing `addr`.
    pub fn region_by_address(&self, addr: usize) -> &Region {
        assert!(self.contains(addr), "{:#x} outside volume {:#x}", addr, self.base);
        &self.regions[(addr - self.base) / REGION_BYTES]
    }

    /// Opens the next untouched region. `None` once all regions are in use.
    pub(crate) fn allocate_root_segment(
        &mut self,
        pool: &mut SegmentPool,
        id: VolumeId,
    ) -> Option<SegmentId> {
        let region = self.regions.get_mut(self.next_region_index)?;
        self.next_region_index += 1;
        let segment = region.alloc_root_segment(pool, id);
        trace!(
            "volume {:#x}: opened region {} of {}",
            self.base,
            self.next_region_index,
            REGIONS_PER_VOLUME
        );
        Some(segment)
    }

    pub(crate) fn verify(&self, pool: &SegmentPool) {
        for region in &self.regions {
            region.verify(pool);
        }
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "volume [{:#x}, {:#x}): {} regions opened, {} of {} bytes committed",
            self.base,
            self.end(),
            self.next_region_index,
            self.committed_bytes(),
            self.reserved_bytes
        )?;
        write!(f, "{}", self.mask)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::VOLUME_DEFAULT_BYTES;

    #[test]
    fn test_regions_in_order() {
        let base = VOLUME_DEFAULT_BYTES;
        let mut volume = Volume::new(base, VOLUME_DEFAULT_BYTES);
        let mut pool = SegmentPool::new();

        for i in 0..REGIONS_PER_VOLUME {
            let id = volume.allocate_root_segment(&mut pool, VolumeId::new(0)).unwrap();
            assert_eq!(pool.get(id).base(), base + i * REGION_BYTES);
            assert!(pool.get(id).is_root());
        }
        assert!(volume.is_full());
        assert!(volume.allocate_root_segment(&mut pool, VolumeId::new(0)).is_none());
        volume.verify(&pool);
    }

    #[test]
    fn test_region_lookup() {
        let base = VOLUME_DEFAULT_BYTES;
        let volume = Volume::new(base, VOLUME_DEFAULT_BYTES);
        assert_eq!(volume.region_by_address(base).base(), base);
        assert_eq!(
            volume.region_by_address(base + REGION_BYTES + 17).base(),
            base + REGION_BYTES
        );
        assert_eq!(
            volume.region_by_address(volume.end() - 1).base(),
            volume.end() - REGION_BYTES
        );
        assert!(!volume.contains(volume.end()));
    }
}
