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

use core::{
    alloc::Layout,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
    slice,
};
use std::{alloc, sync::Arc};

use log::trace;

use crate::{constants::META_ALIGNED_BYTES, metaspace_arena::MetaspaceArena, modules::os_memory::MemFlag};

/// Where a [`MetaArray`] keeps its elements.
#[derive(Clone)]
pub enum ArrayBacking {
    /// Process heap, accounted to the given category.
    Native(MemFlag),
    /// Process heap; outgrown storage is only freed together with the array.
    Scratch,
    /// Metadata arena; outgrown storage goes back to the arena for reuse.
    Arena(Arc<MetaspaceArena>),
}

impl ArrayBacking {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, ()> {
        match self {
            ArrayBacking::Native(flag) => {
                trace!("{} array storage: {} bytes", flag, layout.size());
                // SAFETY: layout has a non-zero size
                NonNull::new(unsafe { alloc::alloc(layout) }).ok_or(())
            }
            ArrayBacking::Scratch => NonNull::new(unsafe { alloc::alloc(layout) }).ok_or(()),
            ArrayBacking::Arena(arena) => arena.allocate(layout.size()).ok_or(()),
        }
    }

    /// Frees `p` right away, except for scratch storage.
    ///
    /// Returns whether the storage was freed.
    unsafe fn release(&self, p: NonNull<u8>, layout: Layout) -> bool {
        match self {
            ArrayBacking::Native(_) => {
                alloc::dealloc(p.as_ptr(), layout);
                true
            }
            ArrayBacking::Scratch => false,
            ArrayBacking::Arena(arena) => {
                arena.deallocate(p, layout.size());
                true
            }
        }
    }
}

/// Growable array of plain data living in metaspace or native memory.
pub struct MetaArray<T: Copy> {
    backing: ArrayBacking,
    data: NonNull<T>,
    len: usize,
    capacity: usize,
    /// outgrown scratch storage
    retired: Vec<(NonNull<u8>, Layout)>,
}

// SAFETY: the array owns its storage exclusively
unsafe impl<T: Copy + Send> Send for MetaArray<T> {}

impl<T: Copy> MetaArray<T> {
    const MIN_CAPACITY: usize = 4;

    pub fn new(backing: ArrayBacking) -> Self {
        assert!(size_of::<T>() > 0, "zero sized elements are not supported");
        if let ArrayBacking::Arena(_) = backing {
            assert!(
                align_of::<T>() <= META_ALIGNED_BYTES,
                "arena storage is only aligned to {} bytes",
                META_ALIGNED_BYTES
            );
        }
        Self {
            backing,
            data: NonNull::dangling(),
            len: 0,
            capacity: 0,
            retired: Vec::new(),
        }
    }

    pub fn with_capacity(backing: ArrayBacking, capacity: usize) -> Result<Self, ()> {
        let mut array = Self::new(backing);
        if capacity > 0 {
            array.grow_to(capacity)?;
        }
        Ok(array)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn backing(&self) -> &ArrayBacking {
        &self.backing
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` elements are initialized, `data` is dangling
        // but aligned if `len == 0`
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.as_slice().get(index).copied()
    }

    /// Appends `value`, growing the storage if needed.
    ///
    /// Fails only if the backing arena is out of budget.
    pub fn push(&mut self, value: T) -> Result<(), ()> {
        if self.len == self.capacity {
            let new_capacity = (self.capacity * 2).max(Self::MIN_CAPACITY);
            self.grow_to(new_capacity)?;
        }
        // SAFETY: len < capacity
        unsafe { self.data.as_ptr().add(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(unsafe { self.data.as_ptr().add(self.len).read() })
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    fn grow_to(&mut self, new_capacity: usize) -> Result<(), ()> {
        debug_assert!(new_capacity > self.capacity);
        let new_layout = Layout::array::<T>(new_capacity).map_err(|_| ())?;
        let new_data = self.backing.allocate(new_layout)?.cast::<T>();

        if self.capacity > 0 {
            unsafe {
                ptr::copy_nonoverlapping(self.data.as_ptr(), new_data.as_ptr(), self.len);
                self.release_storage();
            }
        }

        self.data = new_data;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Hands the current storage back to the backing.
    unsafe fn release_storage(&mut self) {
        let Ok(layout) = Layout::array::<T>(self.capacity) else {
            return;
        };
        let p = self.data.cast::<u8>();
        if !self.backing.release(p, layout) {
            self.retired.push((p, layout));
        }
    }
}

impl<T: Copy> Drop for MetaArray<T> {
    fn drop(&mut self) {
        if self.capacity > 0 {
            unsafe { self.release_storage() };
        }
        for (p, layout) in self.retired.drain(..) {
            // SAFETY: scratch storage comes from the global allocator
            unsafe { alloc::dealloc(p.as_ptr(), layout) };
        }
    }
}
