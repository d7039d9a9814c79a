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

use std::{
    alloc::{alloc, dealloc, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use log::trace;
use parking_lot::Mutex;

use super::{touch_pages, MemFlag, OsMemoryModule, Protection};
use crate::error::MetaspaceError;

struct Reservation {
    base: usize,
    layout: Layout,
}

impl Reservation {
    fn contains(&self, addr: usize, bytes: usize) -> bool {
        addr >= self.base && addr + bytes <= self.base + self.layout.size()
    }
}

/// Memory provider backed by the process heap.
///
/// Reservations are plain aligned heap allocations, commit and uncommit are
/// bookkeeping only. Memory is not zeroed on commit; the allocator clears
/// every block it hands out. Useful where `mmap` is not available and for injecting
/// failures in tests.
pub struct HeapOsMemory {
    reservations: Mutex<Vec<Reservation>>,
    committed_bytes: AtomicUsize,
    commit_calls: AtomicUsize,
    uncommit_calls: AtomicUsize,
    pretouched_bytes: AtomicUsize,
    fail_commits: AtomicBool,
    fail_reservations: AtomicBool,
}

impl HeapOsMemory {
    pub fn new() -> Self {
        Self {
            reservations: Mutex::new(Vec::new()),
            committed_bytes: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
            uncommit_calls: AtomicUsize::new(0),
            pretouched_bytes: AtomicUsize::new(0),
            fail_commits: AtomicBool::new(false),
            fail_reservations: AtomicBool::new(false),
        }
    }

    /// Makes every following commit request fail.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::Relaxed);
    }

    /// Makes every following reservation request fail.
    pub fn set_fail_reservations(&self, fail: bool) {
        self.fail_reservations.store(fail, Ordering::Relaxed);
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reservations.lock().iter().map(|r| r.layout.size()).sum()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.lock().len()
    }

    /// Bytes committed through this provider. Overlapping commits are counted again.
    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes.load(Ordering::Relaxed)
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::Relaxed)
    }

    pub fn uncommit_calls(&self) -> usize {
        self.uncommit_calls.load(Ordering::Relaxed)
    }

    pub fn pretouched_bytes(&self) -> usize {
        self.pretouched_bytes.load(Ordering::Relaxed)
    }

    fn check_reserved(&self, addr: usize, bytes: usize) -> bool {
        self.reservations.lock().iter().any(|r| r.contains(addr, bytes))
    }
}

impl Default for HeapOsMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl OsMemoryModule for HeapOsMemory {
    fn reserve_memory_aligned(
        &self,
        flag: MemFlag,
        bytes: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, MetaspaceError> {
        let err = MetaspaceError::ReserveFailed { bytes, alignment };
        if self.fail_reservations.load(Ordering::Relaxed) || bytes == 0 {
            return Err(err);
        }
        let layout = Layout::from_size_align(bytes, alignment).map_err(|_| err.clone())?;
        let base = NonNull::new(unsafe { alloc(layout) }).ok_or(err)?;

        trace!("reserved {} bytes ({}) on the heap at {:p}", bytes, flag, base);
        self.reservations.lock().push(Reservation {
            base: base.as_ptr() as usize,
            layout,
        });
        Ok(base)
    }

    unsafe fn commit_memory(
        &self,
        _flag: MemFlag,
        addr: NonNull<u8>,
        bytes: usize,
        _protection: Protection,
    ) -> Result<(), MetaspaceError> {
        let addr = addr.as_ptr() as usize;
        if self.fail_commits.load(Ordering::Relaxed) || !self.check_reserved(addr, bytes) {
            return Err(MetaspaceError::CommitFailed { addr, bytes });
        }
        self.commit_calls.fetch_add(1, Ordering::Relaxed);
        self.committed_bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn uncommit_memory(
        &self,
        _flag: MemFlag,
        addr: NonNull<u8>,
        bytes: usize,
    ) -> Result<(), MetaspaceError> {
        let addr = addr.as_ptr() as usize;
        if !self.check_reserved(addr, bytes) {
            return Err(MetaspaceError::UncommitFailed { addr, bytes });
        }
        self.uncommit_calls.fetch_add(1, Ordering::Relaxed);
        let _ = self.committed_bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
            Some(c.saturating_sub(bytes))
        });
        Ok(())
    }

    unsafe fn release_memory(
        &self,
        _flag: MemFlag,
        addr: NonNull<u8>,
        bytes: usize,
    ) -> Result<(), MetaspaceError> {
        let addr = addr.as_ptr() as usize;
        let mut reservations = self.reservations.lock();
        let index = reservations
            .iter()
            .position(|r| r.base == addr && r.layout.size() == bytes)
            .ok_or(MetaspaceError::ReleaseFailed { addr, bytes })?;
        let reservation = reservations.swap_remove(index);
        dealloc(reservation.base as *mut u8, reservation.layout);
        Ok(())
    }

    unsafe fn pretouch_memory(&self, addr: NonNull<u8>, bytes: usize) {
        self.pretouched_bytes.fetch_add(bytes, Ordering::Relaxed);
        touch_pages(addr, bytes, self.page_size())
    }

    fn page_size(&self) -> usize {
        4096
    }
}

impl Drop for HeapOsMemory {
    fn drop(&mut self) {
        for reservation in self.reservations.get_mut().drain(..) {
            unsafe { dealloc(reservation.base as *mut u8, reservation.layout) };
        }
    }
}
