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

use std::{ptr::NonNull, sync::Arc};

use log::{debug, trace, warn};

use crate::{
    committed_limiter::CommittedLimiter,
    constants::{COMMIT_GRANULE_BYTES, VOLUME_DEFAULT_BYTES},
    error::{fatal_out_of_memory, MetaspaceError, OutOfMemoryReport},
    internal_stats::InternalStats,
    modules::os_memory::{MemFlag, OsMemoryModule, Protection},
    region::Region,
    segment::{Segment, SegmentId, SegmentPool},
    util::is_aligned,
    volume::{Volume, VolumeId},
};

/// All volumes of one metaspace, the newest one last.
///
/// Owns the physical commit state: every commit and uncommit passes through
/// here so the per-volume masks, the list totals and the global limiter stay
/// in sync.
pub struct VolumeList {
    volumes: Vec<Volume>,
    reserved_bytes: usize,
    committed_bytes: usize,
    os: Arc<dyn OsMemoryModule>,
    limiter: Arc<CommittedLimiter>,
    stats: Arc<InternalStats>,
    always_pre_touch: bool,
    max_reserved_bytes: Option<usize>,
    reservation_limit_hits: usize,
}

impl VolumeList {
    pub(crate) fn new(
        os: Arc<dyn OsMemoryModule>,
        limiter: Arc<CommittedLimiter>,
        stats: Arc<InternalStats>,
        always_pre_touch: bool,
        max_reserved_bytes: Option<usize>,
    ) -> Self {
        Self {
            volumes: Vec::new(),
            reserved_bytes: 0,
            committed_bytes: 0,
            os,
            limiter,
            stats,
            always_pre_touch,
            max_reserved_bytes,
            reservation_limit_hits: 0,
        }
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes
    }

    /// How often a root segment was refused because of the reservation cap.
    pub fn reservation_limit_hits(&self) -> usize {
        self.reservation_limit_hits
    }

    pub fn num_volumes(&self) -> usize {
        self.volumes.len()
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    #[inline]
    pub fn volume(&self, id: VolumeId) -> &Volume {
        &self.volumes[id.index()]
    }

    /// `[base, end)` of any volume.
    pub fn contains(&self, addr: usize) -> bool {
        self.volumes.iter().any(|v| v.contains(addr))
    }

    /// Region a segment lives in.
    pub fn region_of(&self, segment: &Segment) -> &Region {
        let Some(volume) = segment.volume else {
            panic!("segment at {:#x} belongs to no volume", segment.base());
        };
        self.volume(volume).region_by_address(segment.base())
    }

    fn can_expand(&self) -> bool {
        match self.max_reserved_bytes {
            Some(max) => self.reserved_bytes + VOLUME_DEFAULT_BYTES <= max,
            None => true,
        }
    }

    fn fatal(&self, error: MetaspaceError) -> ! {
        fatal_out_of_memory(OutOfMemoryReport {
            error,
            reserved_bytes: self.reserved_bytes,
            committed_bytes: self.committed_bytes,
        })
    }

    fn create_new_volume(&mut self) {
        let base = match self.os.reserve_memory_aligned(
            MemFlag::Metaspace,
            VOLUME_DEFAULT_BYTES,
            VOLUME_DEFAULT_BYTES,
        ) {
            Ok(base) => base.as_ptr() as usize,
            Err(err) => self.fatal(err),
        };
        self.volumes.push(Volume::new(base, VOLUME_DEFAULT_BYTES));
        self.reserved_bytes += VOLUME_DEFAULT_BYTES;
        self.stats.num_volumes_births();
        debug!(
            "new volume at {:#x}, {} volumes reserving {} bytes",
            base,
            self.volumes.len(),
            self.reserved_bytes
        );
    }

    /// Hands out a fresh root segment, reserving a new volume when the newest is exhausted.
    ///
    /// Returns `None` only if the reservation cap forbids another volume.
    pub(crate) fn allocate_root_segment(&mut self, pool: &mut SegmentPool) -> Option<SegmentId> {
        let len = self.volumes.len();
        if let Some(last) = self.volumes.last_mut() {
            let id = VolumeId::new(len - 1);
            if let Some(segment) = last.allocate_root_segment(pool, id) {
                return Some(segment);
            }
        }
        if !self.can_expand() {
            debug!("reservation limit reached at {} bytes", self.reserved_bytes);
            self.reservation_limit_hits += 1;
            return None;
        }
        self.create_new_volume();
        let id = VolumeId::new(self.volumes.len() - 1);
        self.volumes
            .last_mut()
            .and_then(|v| v.allocate_root_segment(pool, id))
    }

    /// Commits the granule aligned range `[addr, addr + bytes)` of `volume`.
    ///
    /// Returns `false` if the limiter does not allow the additional commit.
    /// An OS failure is fatal.
    pub(crate) fn commit_range(&mut self, volume: VolumeId, addr: usize, bytes: usize) -> bool {
        debug_assert!(is_aligned(addr, COMMIT_GRANULE_BYTES) && is_aligned(bytes, COMMIT_GRANULE_BYTES));
        let v = &mut self.volumes[volume.index()];
        debug_assert!(v.contains(addr) && addr + bytes <= v.end());

        let increase = bytes - v.mask.committed_bytes_in_range(addr, bytes);
        if increase == 0 {
            return true;
        }
        let possible = self.limiter.possible_expand_bytes();
        if possible < increase {
            debug!(
                "commit of {} bytes at {:#x} denied, only {} bytes possible",
                increase, addr, possible
            );
            return false;
        }

        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            self.fatal(MetaspaceError::CommitFailed { addr, bytes });
        };
        if let Err(err) =
            unsafe { self.os.commit_memory(MemFlag::Metaspace, ptr, bytes, Protection::ReadWrite) }
        {
            self.fatal(err);
        }

        let v = &mut self.volumes[volume.index()];
        if self.always_pre_touch {
            // granules committed before may already hold live data
            let mut granule = addr;
            while granule < addr + bytes {
                if !v.mask.is_committed(granule) {
                    if let Some(p) = NonNull::new(granule as *mut u8) {
                        unsafe { self.os.pretouch_memory(p, COMMIT_GRANULE_BYTES) };
                    }
                }
                granule += COMMIT_GRANULE_BYTES;
            }
        }
        let marked = v.mask.mark_committed(addr, bytes);
        debug_assert_eq!(marked, increase);

        self.limiter.increase_committed(increase);
        self.committed_bytes += increase;
        self.stats.num_range_committed();
        trace!("committed [{:#x}, {:#x}), +{} bytes", addr, addr + bytes, increase);
        true
    }

    /// Uncommits the granule aligned range `[addr, addr + bytes)` of `volume`.
    /// An OS failure is fatal.
    pub(crate) fn uncommit_range(&mut self, volume: VolumeId, addr: usize, bytes: usize) {
        debug_assert!(is_aligned(addr, COMMIT_GRANULE_BYTES) && is_aligned(bytes, COMMIT_GRANULE_BYTES));
        let committed = self.volumes[volume.index()]
            .mask
            .committed_bytes_in_range(addr, bytes);
        if committed == 0 {
            return;
        }

        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            self.fatal(MetaspaceError::UncommitFailed { addr, bytes });
        };
        if let Err(err) = unsafe { self.os.uncommit_memory(MemFlag::Metaspace, ptr, bytes) } {
            self.fatal(err);
        }

        self.volumes[volume.index()].mask.mark_uncommitted(addr, bytes);
        self.limiter.decrease_committed(committed);
        self.committed_bytes -= committed;
        self.stats.num_range_uncommitted();
        trace!("uncommitted [{:#x}, {:#x}), -{} bytes", addr, addr + bytes, committed);
    }

    pub(crate) fn verify(&self, pool: &SegmentPool) {
        let mut committed = 0;
        for volume in &self.volumes {
            volume.verify(pool);
            committed += volume.committed_bytes();
        }
        assert_eq!(committed, self.committed_bytes, "volume committed counters out of sync");
        assert_eq!(self.reserved_bytes, self.volumes.len() * VOLUME_DEFAULT_BYTES);
    }
}

impl Drop for VolumeList {
    fn drop(&mut self) {
        for volume in self.volumes.drain(..) {
            self.limiter.decrease_committed(volume.committed_bytes());
            let Some(base) = NonNull::new(volume.base() as *mut u8) else {
                continue;
            };
            if let Err(err) =
                unsafe { self.os.release_memory(MemFlag::Metaspace, base, volume.reserved_bytes()) }
            {
                warn!("{}", err);
            }
            self.stats.num_volumes_deaths();
        }
        self.committed_bytes = 0;
        self.reserved_bytes = 0;
    }
}
