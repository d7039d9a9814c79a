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

use std::{io, ptr::null_mut, ptr::NonNull, sync::OnceLock};

use libc::{
    c_void, madvise, mmap, mprotect, munmap, sysconf, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED,
    MAP_NORESERVE, MAP_PRIVATE, PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE, _SC_PAGE_SIZE,
};
use log::{trace, warn};

use super::{MemFlag, OsMemoryModule, Protection};
use crate::{error::MetaspaceError, util::align_up};

/// Anonymous `mmap` backed memory.
pub struct MmapOsMemory;

impl MmapOsMemory {
    pub fn new() -> Self {
        MmapOsMemory
    }
}

impl Default for MmapOsMemory {
    fn default() -> Self {
        Self::new()
    }
}

fn protection_flags(protection: Protection) -> i32 {
    match protection {
        Protection::Read => PROT_READ,
        Protection::ReadWrite => PROT_READ | PROT_WRITE,
        Protection::ReadWriteExecute => PROT_READ | PROT_WRITE | PROT_EXEC,
    }
}

impl OsMemoryModule for MmapOsMemory {
    fn reserve_memory_aligned(
        &self,
        flag: MemFlag,
        bytes: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, MetaspaceError> {
        let err = MetaspaceError::ReserveFailed { bytes, alignment };
        // over-reserve so an aligned window of `bytes` is guaranteed to exist
        let extra_size = bytes.checked_add(alignment).ok_or(err.clone())?;

        let extra_base = unsafe {
            mmap(
                null_mut(),
                extra_size,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if extra_base == MAP_FAILED {
            warn!("reserve of {} bytes ({}) failed: {}", extra_size, flag, io::Error::last_os_error());
            return Err(err);
        }

        let extra_base = extra_base as usize;
        let aligned_base = align_up(extra_base, alignment);
        let begin_offset = aligned_base - extra_base;
        let end_offset = (extra_base + extra_size) - (aligned_base + bytes);

        unsafe {
            if begin_offset > 0 {
                munmap(extra_base as *mut c_void, begin_offset);
            }
            if end_offset > 0 {
                munmap((aligned_base + bytes) as *mut c_void, end_offset);
            }
        }

        trace!("reserved {} bytes ({}) at {:#x}", bytes, flag, aligned_base);
        NonNull::new(aligned_base as *mut u8).ok_or(err)
    }

    unsafe fn commit_memory(
        &self,
        _flag: MemFlag,
        addr: NonNull<u8>,
        bytes: usize,
        protection: Protection,
    ) -> Result<(), MetaspaceError> {
        let code = mprotect(addr.as_ptr() as *mut c_void, bytes, protection_flags(protection));
        if code != 0 {
            warn!("mprotect failed: {}", io::Error::last_os_error());
            return Err(MetaspaceError::CommitFailed {
                addr: addr.as_ptr() as usize,
                bytes,
            });
        }
        Ok(())
    }

    unsafe fn uncommit_memory(
        &self,
        _flag: MemFlag,
        addr: NonNull<u8>,
        bytes: usize,
    ) -> Result<(), MetaspaceError> {
        let err = MetaspaceError::UncommitFailed {
            addr: addr.as_ptr() as usize,
            bytes,
        };
        if madvise(addr.as_ptr() as *mut c_void, bytes, MADV_DONTNEED) != 0 {
            warn!("madvise failed: {}", io::Error::last_os_error());
            return Err(err);
        }
        if mprotect(addr.as_ptr() as *mut c_void, bytes, PROT_NONE) != 0 {
            warn!("mprotect failed: {}", io::Error::last_os_error());
            return Err(err);
        }
        Ok(())
    }

    unsafe fn release_memory(
        &self,
        flag: MemFlag,
        addr: NonNull<u8>,
        bytes: usize,
    ) -> Result<(), MetaspaceError> {
        if munmap(addr.as_ptr() as *mut c_void, bytes) != 0 {
            warn!("could not unmap {} bytes ({}): {}", bytes, flag, io::Error::last_os_error());
            return Err(MetaspaceError::ReleaseFailed {
                addr: addr.as_ptr() as usize,
                bytes,
            });
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
        *PAGE_SIZE.get_or_init(|| unsafe { sysconf(_SC_PAGE_SIZE) as usize })
    }
}
