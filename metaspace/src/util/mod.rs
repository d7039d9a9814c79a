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

pub(crate) mod bit_array;
pub mod growable_array;

#[inline]
pub(crate) const fn is_power_of_two(x: usize) -> bool {
    x != 0 && (x & (x - 1)) == 0
}

/// Rounds `x` up to the next multiple of `alignment` (a power of two).
#[inline]
pub(crate) const fn align_up(x: usize, alignment: usize) -> usize {
    debug_assert!(is_power_of_two(alignment));
    (x + alignment - 1) & !(alignment - 1)
}

/// Rounds `x` down to the previous multiple of `alignment` (a power of two).
#[inline]
pub(crate) const fn align_down(x: usize, alignment: usize) -> usize {
    debug_assert!(is_power_of_two(alignment));
    x & !(alignment - 1)
}

/// Like `align_down` but never returns less than `alignment`.
#[inline]
pub(crate) const fn align_down_bounded(x: usize, alignment: usize) -> usize {
    let aligned = align_down(x, alignment);
    if aligned > 0 {
        aligned
    } else {
        alignment
    }
}

#[inline]
pub(crate) const fn is_aligned(x: usize, alignment: usize) -> bool {
    align_down(x, alignment) == x
}

/// efficient way to calculate: ceil(x / y)
pub(crate) fn ceil_div(x: usize, y: usize) -> usize {
    (x + y - 1) / y
}
