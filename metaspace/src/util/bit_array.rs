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

use crate::util::ceil_div;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Plain (non-atomic) bit set. Callers serialize access themselves.
#[derive(Clone)]
pub(crate) struct BitArray {
    words: Vec<u64>,
    len: usize,
}

impl BitArray {
    pub(crate) fn new(len: usize) -> Self {
        BitArray {
            words: vec![0; ceil_div(len, BITS_PER_WORD)],
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn set(&mut self, value: bool, index: usize) {
        assert!(index < self.len, "bit index {} out of bounds ({})", index, self.len);
        let word = &mut self.words[index / BITS_PER_WORD];
        let mask = 1u64 << (index % BITS_PER_WORD);
        if value {
            // set bit
            *word |= mask;
        } else {
            // unset bit
            *word &= !mask;
        }
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        assert!(index < self.len, "bit index {} out of bounds ({})", index, self.len);
        (self.words[index / BITS_PER_WORD] & (1u64 << (index % BITS_PER_WORD))) != 0
    }

    /// Sets all bits in `[from, to)` to `value`.
    pub(crate) fn set_range(&mut self, value: bool, from: usize, to: usize) {
        assert!(from <= to && to <= self.len);
        let mut index = from;
        while index < to {
            let offset = index % BITS_PER_WORD;
            let span = (BITS_PER_WORD - offset).min(to - index);
            let mask = word_mask(offset, span);
            let word = &mut self.words[index / BITS_PER_WORD];
            if value {
                *word |= mask;
            } else {
                *word &= !mask;
            }
            index += span;
        }
    }

    /// Number of set bits in `[from, to)`.
    pub(crate) fn count_range(&self, from: usize, to: usize) -> usize {
        assert!(from <= to && to <= self.len);
        let mut count = 0;
        let mut index = from;
        while index < to {
            let offset = index % BITS_PER_WORD;
            let span = (BITS_PER_WORD - offset).min(to - index);
            let mask = word_mask(offset, span);
            count += (self.words[index / BITS_PER_WORD] & mask).count_ones() as usize;
            index += span;
        }
        count
    }

    pub(crate) fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[inline]
fn word_mask(offset: usize, span: usize) -> u64 {
    if span == BITS_PER_WORD {
        u64::MAX
    } else {
        ((1u64 << span) - 1) << offset
    }
}

#[cfg(test)]
mod test {
    use super::BitArray;

    #[test]
    fn test_set_and_clear() {
        let mut arr = BitArray::new(130);
        assert_eq!(arr.len(), 130);
        arr.set(true, 0);
        arr.set(true, 64);
        arr.set(true, 129);
        assert!(arr.is_set(0) && arr.is_set(64) && arr.is_set(129));
        assert!(!arr.is_set(1));

        arr.set(false, 64);
        assert!(!arr.is_set(64));
        // clearing one bit must leave its neighbours alone
        assert!(arr.is_set(0));
        assert_eq!(arr.count_ones(), 2);
    }

    #[test]
    fn test_ranges_across_words() {
        let mut arr = BitArray::new(256);
        arr.set_range(true, 60, 200);
        assert_eq!(arr.count_range(0, 256), 140);
        assert_eq!(arr.count_range(60, 64), 4);
        assert_eq!(arr.count_range(0, 60), 0);
        assert_eq!(arr.count_range(128, 192), 64);

        arr.set_range(false, 100, 150);
        assert_eq!(arr.count_ones(), 90);
        assert!(arr.is_set(99));
        assert!(!arr.is_set(100));
        assert!(!arr.is_set(149));
        assert!(arr.is_set(150));
    }
}
