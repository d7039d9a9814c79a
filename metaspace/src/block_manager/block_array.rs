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

use crate::{block_manager::BlockManager, constants::META_ALIGNED_BYTES, util::is_aligned};

use super::block_tree::BlockTree;

const NUM_BINS: usize = (BlockTree::MIN_BYTES - BlockManager::MIN_BYTES) / META_ALIGNED_BYTES;

/// Bins of small free blocks, one per aligned size below [`BlockTree::MIN_BYTES`].
pub(crate) struct BlockArray {
    bins: [Vec<usize>; NUM_BINS],
    total_bytes: usize,
}

impl BlockArray {
    pub(crate) fn new() -> Self {
        Self {
            bins: core::array::from_fn(|_| Vec::new()),
            total_bytes: 0,
        }
    }

    #[inline]
    fn bin_for(bytes: usize) -> usize {
        debug_assert!(is_aligned(bytes, META_ALIGNED_BYTES));
        debug_assert!((BlockManager::MIN_BYTES..BlockTree::MIN_BYTES).contains(&bytes));
        (bytes - BlockManager::MIN_BYTES) / META_ALIGNED_BYTES
    }

    #[inline]
    fn bin_size(bin: usize) -> usize {
        BlockManager::MIN_BYTES + bin * META_ALIGNED_BYTES
    }

    pub(crate) fn add(&mut self, addr: usize, bytes: usize) {
        self.bins[Self::bin_for(bytes)].push(addr);
        self.total_bytes += bytes;
    }

    /// Takes the most recently added block of the smallest size `>= bytes`.
    pub(crate) fn remove(&mut self, bytes: usize) -> Option<(usize, usize)> {
        let first = Self::bin_for(bytes);
        // Find the first non-empty size class
        for bin in first..NUM_BINS {
            if let Some(addr) = self.bins[bin].pop() {
                let real = Self::bin_size(bin);
                self.total_bytes -= real;
                return Some((addr, real));
            }
        }
        None
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub(crate) fn count(&self) -> usize {
        self.bins.iter().map(Vec::len).sum()
    }

    pub(crate) fn verify(&self) {
        let total: usize = self
            .bins
            .iter()
            .enumerate()
            .map(|(bin, blocks)| blocks.len() * Self::bin_size(bin))
            .sum();
        assert_eq!(total, self.total_bytes, "block array total out of sync");
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.bins
            .iter()
            .enumerate()
            .flat_map(|(bin, blocks)| blocks.iter().map(move |a| (*a, Self::bin_size(bin))))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const W: usize = META_ALIGNED_BYTES;

    #[test]
    fn test_exact_bin_is_lifo() {
        let mut arr = BlockArray::new();
        arr.add(0x100, 2 * W);
        arr.add(0x200, 2 * W);
        assert_eq!(arr.total_bytes(), 4 * W);
        assert_eq!(arr.remove(2 * W), Some((0x200, 2 * W)));
        assert_eq!(arr.remove(2 * W), Some((0x100, 2 * W)));
        assert_eq!(arr.remove(2 * W), None);
        assert_eq!(arr.total_bytes(), 0);
    }

    #[test]
    fn test_falls_through_to_larger_bin() {
        let mut arr = BlockArray::new();
        arr.add(0x100, 5 * W);
        assert_eq!(arr.remove(6 * W), None);
        assert_eq!(arr.remove(W), Some((0x100, 5 * W)));
        assert_eq!(arr.count(), 0);
        arr.verify();
    }
}
