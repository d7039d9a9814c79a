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

mod block_array;
mod block_tree;

use log::trace;

use crate::{constants::META_ALIGNED_BYTES, util::is_aligned};
use block_array::BlockArray;
pub(crate) use block_tree::BlockTree;

/// Recycler for blocks an arena got back from its clients.
///
/// Small blocks sit in exact-size bins, larger ones in a size-keyed tree.
pub struct BlockManager {
    small_blocks: BlockArray,
    tree: BlockTree,
}

impl BlockManager {
    /// Smallest block worth keeping.
    pub const MIN_BYTES: usize = core::mem::size_of::<usize>();

    pub fn new() -> Self {
        Self {
            small_blocks: BlockArray::new(),
            tree: BlockTree::new(),
        }
    }

    /// Hands out a block of at least `bytes` if one is available.
    ///
    /// The part of a larger block not needed is kept for later requests.
    pub fn allocate(&mut self, bytes: usize) -> Option<usize> {
        assert!(bytes >= Self::MIN_BYTES, "request of {} bytes too small", bytes);
        debug_assert!(is_aligned(bytes, META_ALIGNED_BYTES));

        let (p, real) = if bytes >= BlockTree::MIN_BYTES {
            self.tree.remove(bytes)?
        } else {
            // split a tree block only if no small block fits
            self.small_blocks
                .remove(bytes)
                .or_else(|| self.tree.remove(bytes))?
        };

        let waste = real - bytes;
        if waste >= Self::MIN_BYTES {
            self.deallocate(p + bytes, waste);
        }
        trace!("reused block {:#x} ({} of {} bytes)", p, bytes, real);
        Some(p)
    }

    /// Takes a freed block.
    pub fn deallocate(&mut self, p: usize, bytes: usize) {
        assert!(bytes >= Self::MIN_BYTES, "block of {} bytes too small", bytes);
        debug_assert!(is_aligned(bytes, META_ALIGNED_BYTES));
        if bytes >= BlockTree::MIN_BYTES {
            self.tree.add(p, bytes);
        } else {
            self.small_blocks.add(p, bytes);
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.small_blocks.total_bytes() + self.tree.total_bytes()
    }

    pub fn count(&self) -> usize {
        self.small_blocks.count() + self.tree.count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// All free blocks as `(address, bytes)`, in no particular order.
    pub fn blocks(&self) -> Vec<(usize, usize)> {
        let mut blocks: Vec<_> = self.small_blocks.iter().collect();
        blocks.extend(self.tree.blocks().into_iter().map(|(size, addr)| (addr, size)));
        blocks
    }

    pub(crate) fn verify(&self) {
        self.small_blocks.verify();
        self.tree.verify();
    }
}

impl Default for BlockManager {
    fn default() -> Self {
        Self::new()
    }
}
