// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Defines block group descriptors and the fixed layout of each block group.

use zerocopy::little_endian::U16;
use zerocopy::little_endian::U32;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

use crate::bitmap::BitMap;
use crate::error::Result;
use crate::geometry::Geometry;
use crate::image::BlockId;
use crate::image::Image;
use crate::inode::FIRST_INO;

/// The block group descriptor.
///
/// The field names follow the [ext2 documentation](https://www.nongnu.org/ext2-doc/ext2.html#block-group-descriptor-table).
/// When 64-byte descriptors are in use, the upper half of each slot stays zero.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct GroupDescriptor {
    pub block_bitmap: U32,
    pub inode_bitmap: U32,
    pub inode_table: U32,
    pub free_blocks_count: U16,
    pub free_inodes_count: U16,
    pub used_dirs_count: U16,
    pub flags: U16,
    pub reserved: [U32; 3],
}

const _: () = assert!(std::mem::size_of::<GroupDescriptor>() == 32);

/// Block numbers of the metadata stored at the start of a block group.
///
/// ```text
/// | superblock | descriptors ... | block bitmap | inode bitmap | inode table ... | data ... |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLayout {
    pub superblock: BlockId,
    pub descriptors: BlockId,
    pub block_bitmap: BlockId,
    pub inode_bitmap: BlockId,
    pub inode_table: BlockId,
}

impl GroupLayout {
    pub fn new(geometry: &Geometry, group: u32) -> Self {
        let start = geometry.group_first_block(group);
        let block_bitmap = start + 1 + geometry.desc_blocks;
        GroupLayout {
            superblock: BlockId::from(start),
            descriptors: BlockId::from(start + 1),
            block_bitmap: BlockId::from(block_bitmap),
            inode_bitmap: BlockId::from(block_bitmap + 1),
            inode_table: BlockId::from(block_bitmap + 2),
        }
    }
}

impl GroupDescriptor {
    /// Creates the descriptor of `group` in an empty filesystem and initializes its bitmaps in
    /// `image`.
    pub fn init(image: &mut Image, geometry: &Geometry, group: u32) -> Result<Self> {
        let layout = GroupLayout::new(geometry, group);

        let mut bbm = BitMap::from_slice_mut(image.block_mut(layout.block_bitmap)?);
        bbm.mark_used(..geometry.overhead_per_group as usize);
        bbm.mark_used(geometry.blocks_in_group(group) as usize..);

        let mut free_inodes = geometry.inodes_per_group;
        let mut ibm = BitMap::from_slice_mut(image.block_mut(layout.inode_bitmap)?);
        ibm.mark_used(geometry.inodes_per_group as usize..);
        if group == 0 {
            let reserved = FIRST_INO - 1;
            ibm.mark_used(..reserved as usize);
            free_inodes -= reserved;
        }

        let mut desc = GroupDescriptor::new_zeroed();
        desc.block_bitmap.set(layout.block_bitmap.into());
        desc.inode_bitmap.set(layout.inode_bitmap.into());
        desc.inode_table.set(layout.inode_table.into());
        desc.free_blocks_count.set(geometry.initial_free_blocks(group) as u16);
        desc.free_inodes_count.set(free_inodes as u16);
        Ok(desc)
    }

    pub fn free_blocks(&self) -> u32 {
        self.free_blocks_count.get() as u32
    }

    pub fn free_inodes(&self) -> u32 {
        self.free_inodes_count.get() as u32
    }
}
