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

use crate::{
    constants::COMMIT_GRANULE_BYTES,
    util::{bit_array::BitArray, ceil_div, is_aligned},
};

/// One bit per commit granule of a volume, set while the granule is committed.
///
/// Only mutated under the context lock, so plain bit operations suffice.
pub struct CommittedMask {
    base: usize,
    bits: BitArray,
}

impl CommittedMask {
    pub fn new(base: usize, bytes: usize) -> Self {
        debug_assert!(is_aligned(base, COMMIT_GRANULE_BYTES));
        Self {
            base,
            bits: BitArray::new(ceil_div(bytes, COMMIT_GRANULE_BYTES)),
        }
    }

    fn granule_range(&self, addr: usize, bytes: usize) -> (usize, usize) {
        assert!(
            is_aligned(addr, COMMIT_GRANULE_BYTES) && is_aligned(bytes, COMMIT_GRANULE_BYTES),
            "range {:#x} + {} not granule aligned",
            addr,
            bytes
        );
        assert!(addr >= self.base, "range {:#x} below mask", addr);
        let from = (addr - self.base) / COMMIT_GRANULE_BYTES;
        let to = from + bytes / COMMIT_GRANULE_BYTES;
        assert!(to <= self.bits.len(), "range {:#x} + {} beyond mask", addr, bytes);
        (from, to)
    }

    pub fn committed_bytes_in_range(&self, addr: usize, bytes: usize) -> usize {
        let (from, to) = self.granule_range(addr, bytes);
        self.bits.count_range(from, to) * COMMIT_GRANULE_BYTES
    }

    pub fn is_committed(&self, addr: usize) -> bool {
        let index = (addr - self.base) / COMMIT_GRANULE_BYTES;
        self.bits.is_set(index)
    }

    /// Marks the range committed, returns the number of newly committed bytes.
    pub fn mark_committed(&mut self, addr: usize, bytes: usize) -> usize {
        let before = self.committed_bytes_in_range(addr, bytes);
        let (from, to) = self.granule_range(addr, bytes);
        self.bits.set_range(true, from, to);
        bytes - before
    }

    /// Marks the range uncommitted, returns the number of bytes that were committed.
    pub fn mark_uncommitted(&mut self, addr: usize, bytes: usize) -> usize {
        let before = self.committed_bytes_in_range(addr, bytes);
        let (from, to) = self.granule_range(addr, bytes);
        self.bits.set_range(false, from, to);
        before
    }

    pub fn committed_bytes(&self) -> usize {
        self.bits.count_ones() * COMMIT_GRANULE_BYTES
    }

    pub fn granules(&self) -> usize {
        self.bits.len()
    }
}

impl fmt::Display for CommittedMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.bits.len() {
            if i > 0 && i % 64 == 0 {
                writeln!(f)?;
            }
            f.write_str(if self.bits.is_set(i) { "X" } else { "-" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::M;

    const G: usize = COMMIT_GRANULE_BYTES;

    #[test]
    fn test_mark_and_count() {
        let base = 64 * M;
        let mut mask = CommittedMask::new(base, 4 * M);
        assert_eq!(mask.granules(), 64);

        assert_eq!(mask.mark_committed(base + G, 3 * G), 3 * G);
        // overlapping commit only counts the new granule
        assert_eq!(mask.mark_committed(base, 2 * G), G);
        assert_eq!(mask.committed_bytes(), 4 * G);
        assert_eq!(mask.committed_bytes_in_range(base + 2 * G, 4 * G), 2 * G);
        assert!(mask.is_committed(base + 3 * G + 1));
        assert!(!mask.is_committed(base + 4 * G));

        assert_eq!(mask.mark_uncommitted(base + 2 * G, 4 * G), 2 * G);
        assert_eq!(mask.committed_bytes(), 2 * G);
    }

    #[test]
    fn test_display() {
        let mut mask = CommittedMask::new(0, 4 * G);
        mask.mark_committed(G, G);
        assert_eq!(mask.to_string(), "-X--");
    }

    #[test]
    #[should_panic]
    fn test_unaligned_range() {
        let mask = CommittedMask::new(0, 4 * G);
        mask.committed_bytes_in_range(100, G);
    }
}
