// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Computes the on-disk layout of the filesystem: block groups, bitmaps and inode tables.

use log::debug;

use crate::error::Error;
use crate::error::Result;
use crate::inode::FIRST_INO;
use crate::inode::INODE_SIZE;

/// Block size used by the filesystem. Only 1024-byte blocks are produced.
pub const BLOCK_SIZE: u32 = 1024;
/// `BLOCK_SIZE == 1024 << LOG_BLOCK_SIZE`.
pub const LOG_BLOCK_SIZE: u32 = 0;

/// Size of a classic group descriptor.
pub const GROUP_DESC_SIZE: u32 = 32;
/// Size of a group descriptor when `INCOMPAT_64BIT` is enabled.
pub const GROUP_DESC_SIZE_64BIT: u32 = 64;

/// Inputs of the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryParams {
    /// Total number of blocks in the filesystem.
    pub blocks_count: u64,
    /// Requested number of inodes. The planned count may be larger.
    pub inodes_count: u64,
    /// Number of blocks reserved for the super user.
    pub reserved_blocks: u64,
    /// Use 64-byte group descriptors.
    pub wide_descriptors: bool,
}

/// The planned layout of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Block size in bytes.
    pub block_size: u32,
    /// First block covered by block group 0.
    pub first_data_block: u32,
    /// Total number of blocks.
    pub blocks_count: u32,
    /// Total number of inodes (`inodes_per_group * group_count`).
    pub inodes_count: u32,
    /// Blocks reserved for the super user.
    pub reserved_blocks: u32,
    /// Number of block groups.
    pub group_count: u32,
    /// Blocks in every group but possibly the last one.
    pub blocks_per_group: u32,
    /// Inodes in every group.
    pub inodes_per_group: u32,
    /// Size of one group descriptor.
    pub desc_size: u32,
    /// Blocks used by the group descriptor array.
    pub desc_blocks: u32,
    /// Blocks used by the inode table of one group.
    pub inode_table_blocks: u32,
    /// Metadata blocks at the start of every group.
    pub overhead_per_group: u32,
    /// Free blocks of the empty filesystem.
    pub free_blocks: u32,
}

impl Geometry {
    /// Plans the layout for the given parameters.
    pub fn plan(params: &GeometryParams) -> Result<Self> {
        let block_size = BLOCK_SIZE;
        let max_blocks_per_group = block_size * 8;
        let max_inodes_per_group = block_size * 8;

        if params.inodes_count < FIRST_INO as u64 {
            return Err(Error::Configuration(format!(
                "bad inode count {}: at least {FIRST_INO} inodes are required",
                params.inodes_count
            )));
        }
        if params.blocks_count < 8 {
            return Err(Error::Configuration(format!(
                "bad block count {}: at least 8 blocks are required",
                params.blocks_count
            )));
        }
        let blocks_count = u32::try_from(params.blocks_count).map_err(|_| {
            Error::Configuration(format!("too many blocks: {}", params.blocks_count))
        })?;
        let reserved_blocks = u32::try_from(params.reserved_blocks)
            .ok()
            .filter(|&r| r <= blocks_count)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "bad reserved block count {} for {} blocks",
                    params.reserved_blocks, blocks_count
                ))
            })?;

        let first_data_block = if block_size == 1024 { 1 } else { 0 };
        let data_blocks = blocks_count - first_data_block;
        debug!("blocks_count={blocks_count}");
        debug!("inodes_count={}", params.inodes_count);
        debug!("first_data_block={first_data_block}");

        let min_group_count = params.inodes_count.div_ceil(max_inodes_per_group as u64);
        let group_count = (data_blocks.div_ceil(max_blocks_per_group) as u64).max(min_group_count);
        let group_count = u32::try_from(group_count)
            .ok()
            .filter(|&g| g <= data_blocks)
            .ok_or_else(|| {
                Error::Geometry(format!(
                    "too many block groups ({group_count}) for {blocks_count} blocks"
                ))
            })?;
        debug!("group_count={group_count}");

        let blocks_per_group = data_blocks
            .div_ceil(group_count)
            .next_multiple_of(8)
            .min(max_blocks_per_group);
        debug!("blocks_per_group={blocks_per_group}");

        let inodes_per_group = params
            .inodes_count
            .div_ceil(group_count as u64)
            .clamp(16, max_inodes_per_group as u64)
            .next_multiple_of(8) as u32;
        debug!("inodes_per_group={inodes_per_group}");
        let inodes_count = inodes_per_group.checked_mul(group_count).ok_or_else(|| {
            Error::Geometry(format!(
                "too many inodes: {inodes_per_group} * {group_count} groups"
            ))
        })?;

        let desc_size = if params.wide_descriptors {
            GROUP_DESC_SIZE_64BIT
        } else {
            GROUP_DESC_SIZE
        };
        let desc_blocks = (group_count as u64 * desc_size as u64).div_ceil(block_size as u64);
        let inode_table_blocks =
            (inodes_per_group as u64 * INODE_SIZE as u64).div_ceil(block_size as u64);
        debug!("desc_blocks={desc_blocks}");
        debug!("inode_table_blocks={inode_table_blocks}");

        // Superblock, group descriptors, block bitmap, inode bitmap and inode table.
        let overhead_per_group = 1 + desc_blocks + 1 + 1 + inode_table_blocks;
        let total_overhead = overhead_per_group * group_count as u64;
        if total_overhead >= data_blocks as u64 {
            return Err(Error::Geometry(format!(
                "too much overhead: {overhead_per_group} blocks in each of {group_count} groups \
                 for {data_blocks} data blocks"
            )));
        }
        // Cannot truncate: `total_overhead < data_blocks`.
        let overhead_per_group = overhead_per_group as u32;
        let free_blocks = data_blocks - total_overhead as u32;
        debug!("overhead_per_group={overhead_per_group}");
        debug!("free_blocks={free_blocks}");

        let last_group_blocks = (data_blocks as u64)
            .saturating_sub((group_count as u64 - 1) * blocks_per_group as u64);
        debug!("last_group_blocks={last_group_blocks}");
        if last_group_blocks <= overhead_per_group as u64 {
            return Err(Error::Geometry(format!(
                "last block group too small: {last_group_blocks} blocks for an overhead of \
                 {overhead_per_group}"
            )));
        }

        Ok(Geometry {
            block_size,
            first_data_block,
            blocks_count,
            inodes_count,
            reserved_blocks,
            group_count,
            blocks_per_group,
            inodes_per_group,
            desc_size,
            desc_blocks: desc_blocks as u32,
            inode_table_blocks: inode_table_blocks as u32,
            overhead_per_group,
            free_blocks,
        })
    }

    /// Returns the first block of the given group, which holds its superblock copy.
    pub fn group_first_block(&self, group: u32) -> u32 {
        self.first_data_block + group * self.blocks_per_group
    }

    /// Returns the number of blocks that belong to the given group.
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        if group + 1 < self.group_count {
            self.blocks_per_group
        } else {
            self.blocks_count - self.group_first_block(group)
        }
    }

    /// Returns the number of free blocks of the given group in the empty filesystem.
    pub fn initial_free_blocks(&self, group: u32) -> u32 {
        self.blocks_in_group(group) - self.overhead_per_group
    }

    /// Number of 32-bit block pointers that fit in one block.
    pub fn pointers_per_block(&self) -> u64 {
        self.block_size as u64 / 4
    }
}
