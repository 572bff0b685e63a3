// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Allocation bitmap shared by blocks and inodes.

use std::ops::Bound;
use std::ops::RangeBounds;

/// A view over one bitmap block. Bit `i` set means resource `i` of the group is in use.
pub struct BitMap<'a> {
    inner: &'a mut [u8],
}

impl<'a> BitMap<'a> {
    pub fn from_slice_mut(inner: &'a mut [u8]) -> Self {
        Self { inner }
    }

    /// Number of bits in the bitmap.
    pub fn len(&self) -> usize {
        self.inner.len() * 8
    }

    /// Sets every bit of `range`, clamped to the bitmap.
    pub fn mark_used(&mut self, range: impl RangeBounds<usize>) {
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&e) => e + 1,
            Bound::Excluded(&e) => e,
            Bound::Unbounded => self.len(),
        }
        .min(self.len());

        let mut bit = start;
        while bit < end {
            if bit % 8 == 0 && end - bit >= 8 {
                self.inner[bit / 8] = 0xff;
                bit += 8;
            } else {
                self.inner[bit / 8] |= 1 << (bit % 8);
                bit += 1;
            }
        }
    }

    /// Sets the lowest clear bit and returns its index, or `None` if the bitmap is full.
    pub fn allocate(&mut self) -> Option<usize> {
        let (i, byte) = self
            .inner
            .iter_mut()
            .enumerate()
            .find(|(_, b)| **b != 0xff)?;
        let j = byte.trailing_ones() as usize;
        *byte |= 1 << j;
        Some(i * 8 + j)
    }
}

// Implements test utility methods.
#[cfg(test)]
impl<'a> BitMap<'a> {
    /// Returns whether bit `index` is set. Bits past the end read as set.
    pub fn is_set(&self, index: usize) -> bool {
        self.inner
            .get(index / 8)
            .map_or(true, |b| b & (1 << (index % 8)) != 0)
    }

    /// Number of set bits among the first `n`.
    pub fn count_ones_in(&self, n: usize) -> usize {
        (0..n.min(self.len())).filter(|&i| self.is_set(i)).count()
    }
}
