// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Defines the in-memory image buffer that every component writes into.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::error::Error;
use crate::error::Result;

/// Represents a block number in the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);

impl From<u32> for BlockId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<BlockId> for u32 {
    fn from(value: BlockId) -> Self {
        value.0
    }
}

/// A zero-initialized byte buffer holding the whole filesystem image.
pub struct Image {
    buf: Vec<u8>,
    block_size: usize,
}

impl Image {
    /// Allocates a zeroed image of `len` bytes.
    pub fn new(len: usize, block_size: usize) -> Self {
        Self {
            buf: vec![0; len],
            block_size,
        }
    }

    fn range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.buf.len() => Ok(offset..end),
            _ => Err(Error::ImageOverflow { offset, len }),
        }
    }

    /// Returns the byte offset of a block.
    pub fn block_offset(&self, block: BlockId) -> usize {
        u32::from(block) as usize * self.block_size
    }

    /// Returns the mutable content of a block.
    pub fn block_mut(&mut self, block: BlockId) -> Result<&mut [u8]> {
        let range = self.range(self.block_offset(block), self.block_size)?;
        Ok(&mut self.buf[range])
    }

    /// Reads a copy of a `T` stored at `offset`.
    pub fn read<T: FromBytes>(&self, offset: usize) -> Result<T> {
        let len = std::mem::size_of::<T>();
        let range = self.range(offset, len)?;
        T::read_from_bytes(&self.buf[range]).map_err(|_| Error::ImageOverflow { offset, len })
    }

    /// Writes the bytes of `value` at `offset`.
    pub fn write<T>(&mut self, offset: usize, value: &T) -> Result<()>
    where
        T: IntoBytes + Immutable + ?Sized,
    {
        let bytes = value.as_bytes();
        let range = self.range(offset, bytes.len())?;
        self.buf[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads the `index`-th 32-bit little-endian block pointer stored in `block`.
    pub fn pointer(&self, block: BlockId, index: usize) -> Result<u32> {
        let offset = self.block_offset(block) + index * 4;
        Ok(self.read::<zerocopy::little_endian::U32>(offset)?.get())
    }

    /// Stores a 32-bit little-endian block pointer at the `index`-th slot of `block`.
    pub fn set_pointer(&mut self, block: BlockId, index: usize, value: u32) -> Result<()> {
        let offset = self.block_offset(block) + index * 4;
        self.write(offset, &zerocopy::little_endian::U32::new(value))
    }

    /// Copies `len` bytes from `src` to `dst` inside the image.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) -> Result<()> {
        let src = self.range(src, len)?;
        self.range(dst, len)?;
        self.buf.copy_within(src, dst);
        Ok(())
    }

    /// Consumes the image and returns its bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

// Implements test utility methods.
#[cfg(test)]
impl Image {
    pub fn block(&self, block: BlockId) -> Result<&[u8]> {
        let range = self.range(self.block_offset(block), self.block_size)?;
        Ok(&self.buf[range])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::little_endian::U16;

    use super::*;

    #[test]
    fn test_block_bounds() {
        let mut image = Image::new(4096 + 10, 1024);
        assert!(image.block(BlockId::from(3)).is_ok());
        // The trailing partial block is not addressable.
        assert!(image.block(BlockId::from(4)).is_err());
        image.block_mut(BlockId::from(1)).unwrap()[0] = 0xaa;
        assert_eq!(image.as_slice()[1024], 0xaa);
    }

    #[test]
    fn test_pointers() {
        let mut image = Image::new(2048, 1024);
        image.set_pointer(BlockId::from(1), 3, 0x1234_5678).unwrap();
        assert_eq!(image.pointer(BlockId::from(1), 3).unwrap(), 0x1234_5678);
        assert_eq!(&image.as_slice()[1036..1040], &[0x78, 0x56, 0x34, 0x12]);
        assert!(image.pointer(BlockId::from(1), 256).is_err());
    }

    #[test]
    fn test_read_write() {
        let mut image = Image::new(16, 1024);
        image.write(5, &U16::new(0xef53)).unwrap();
        assert_eq!(image.read::<U16>(5).unwrap().get(), 0xef53);
        assert!(image.write(15, &U16::new(1)).is_err());
        assert!(image.read::<U16>(15).is_err());
        image.copy_within(5, 10, 2).unwrap();
        assert_eq!(&image.as_slice()[10..12], &[0x53, 0xef]);
        assert!(image.copy_within(0, 10, 8).is_err());
    }
}
