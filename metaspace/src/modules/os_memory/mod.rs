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

use core::{fmt, ptr::NonNull};

use crate::error::MetaspaceError;

mod heap;
#[cfg(feature = "use_libc")]
mod mmap;

pub use heap::HeapOsMemory;
#[cfg(feature = "use_libc")]
pub use mmap::MmapOsMemory;

/// Category a mapping is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemFlag {
    LangHeap,
    Class,
    Thread,
    GC,
    Internal,
    Symbol,
    Arena,
    Metaspace,
    None,
}

impl fmt::Display for MemFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemFlag::LangHeap => "lang heap",
            MemFlag::Class => "class",
            MemFlag::Thread => "thread",
            MemFlag::GC => "gc",
            MemFlag::Internal => "internal",
            MemFlag::Symbol => "symbol",
            MemFlag::Arena => "arena",
            MemFlag::Metaspace => "metaspace",
            MemFlag::None => "unknown",
        };
        f.write_str(name)
    }
}

/// Access rights of committed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Read,
    ReadWrite,
    ReadWriteExecute,
}

/// Virtual memory primitives the allocator is built on.
///
/// Addresses and sizes passed to `commit_memory`/`uncommit_memory` are always
/// aligned to the commit granule and lie inside a range returned by
/// `reserve_memory_aligned`.
pub trait OsMemoryModule: Send + Sync {
    /// Reserves `bytes` of address space aligned to `alignment` without
    /// backing it with physical memory.
    fn reserve_memory_aligned(
        &self,
        flag: MemFlag,
        bytes: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, MetaspaceError>;

    /// Backs `[addr, addr + bytes)` with physical memory.
    ///
    /// ### Safety
    ///
    /// The range must be part of a live reservation.
    unsafe fn commit_memory(
        &self,
        flag: MemFlag,
        addr: NonNull<u8>,
        bytes: usize,
        protection: Protection,
    ) -> Result<(), MetaspaceError>;

    /// Returns the physical memory behind `[addr, addr + bytes)`, keeping the
    /// address range reserved. The contents are lost.
    ///
    /// ### Safety
    ///
    /// The range must be part of a live reservation and must not be accessed
    /// until it is committed again.
    unsafe fn uncommit_memory(
        &self,
        flag: MemFlag,
        addr: NonNull<u8>,
        bytes: usize,
    ) -> Result<(), MetaspaceError>;

    /// Gives a whole reservation back to the OS.
    ///
    /// ### Safety
    ///
    /// `addr` and `bytes` must match a previous reservation exactly.
    unsafe fn release_memory(
        &self,
        flag: MemFlag,
        addr: NonNull<u8>,
        bytes: usize,
    ) -> Result<(), MetaspaceError>;

    /// Faults in every page of a committed range. The contents of the range
    /// are not preserved.
    ///
    /// ### Safety
    ///
    /// The range must be committed and writable and must hold no live data.
    unsafe fn pretouch_memory(&self, addr: NonNull<u8>, bytes: usize) {
        touch_pages(addr, bytes, self.page_size())
    }

    fn page_size(&self) -> usize;
}

/// Writes one zero byte per page of `[addr, addr + bytes)`.
///
/// Only used on freshly committed memory, which holds no data yet.
///
/// ### Safety
///
/// The range must be committed and writable.
pub(crate) unsafe fn touch_pages(addr: NonNull<u8>, bytes: usize, page: usize) {
    let mut offset = 0;
    while offset < bytes {
        addr.as_ptr().add(offset).write_volatile(0);
        offset += page;
    }
}
