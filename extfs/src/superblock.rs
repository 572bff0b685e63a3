// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Defines the superblock structure.

use zerocopy::little_endian::U16;
use zerocopy::little_endian::U32;
use zerocopy::little_endian::U64;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

use crate::geometry::Geometry;
use crate::geometry::GROUP_DESC_SIZE_64BIT;
use crate::geometry::LOG_BLOCK_SIZE;
use crate::inode::FIRST_INO;
use crate::inode::INODE_SIZE;

/// Byte offset of the primary superblock.
pub const SUPERBLOCK_OFFSET: usize = 1024;
/// Bytes reserved for a superblock.
pub const SUPERBLOCK_SIZE: usize = 1024;

const EXT2_MAGIC_NUMBER: u16 = 0xEF53;
const EXT2_VALID_FS: u16 = 1;
const EXT2_ERRORS_CONTINUE: u16 = 1;
const EXT2_OS_LINUX: u32 = 0;
const EXT2_DYNAMIC_REV: u32 = 1;

pub const FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
pub const FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;

/// `s_jnl_blocks` holds a copy of the journal inode's block array, size high and size low.
pub const JNL_BACKUP_BLOCKS: u8 = 1;

/// The ext2 superblock.
///
/// The field names follow the [ext2 documentation](https://www.nongnu.org/ext2-doc/ext2.html#superblock).
/// Note that this struct only holds the fields at the beginning of the superblock. All fields after
/// the fields supported by this structure are filled with zeros.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SuperBlock {
    pub inodes_count: U32,
    pub blocks_count: U32,
    pub r_blocks_count: U32,
    pub free_blocks_count: U32,
    pub free_inodes_count: U32,
    pub first_data_block: U32,
    pub log_block_size: U32,
    pub log_frag_size: U32,
    pub blocks_per_group: U32,
    pub frags_per_group: U32,
    pub inodes_per_group: U32,
    pub mtime: U32,
    pub wtime: U32,
    pub mnt_count: U16,
    pub max_mnt_count: U16,
    pub magic: U16,
    pub state: U16,
    pub errors: U16,
    pub minor_rev_level: U16,
    pub lastcheck: U32,
    pub checkinterval: U32,
    pub creator_os: U32,
    pub rev_level: U32,
    pub def_resuid: U16,
    pub def_resgid: U16,
    pub first_ino: U32,
    pub inode_size: U16,
    pub block_group_nr: U16,
    pub feature_compat: U32,
    pub feature_incompat: U32,
    pub feature_ro_compat: U32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted: [u8; 64],
    pub algorithm_usage_bitmap: U32,
    pub prealloc_blocks: u8,
    pub prealloc_dir_blocks: u8,
    pub reserved_gdt_blocks: U16,
    pub journal_uuid: [u8; 16],
    pub journal_inum: U32,
    pub journal_dev: U32,
    pub last_orphan: U32,
    pub hash_seed: [U32; 4],
    pub def_hash_version: u8,
    pub jnl_backup_type: u8,
    pub desc_size: U16,
    pub default_mount_opts: U32,
    pub first_meta_bg: U32,
    pub mkfs_time: U32,
    pub jnl_blocks: [U32; 17],
    pub blocks_count_hi: U32,
    pub r_blocks_count_hi: U32,
    pub free_blocks_count_hi: U32,
    pub min_extra_isize: U16,
    pub want_extra_isize: U16,
    pub flags: U32,
    pub raid_stride: U16,
    pub mmp_interval: U16,
    pub mmp_block: U64,
    pub raid_stripe_width: U32,
    pub log_groups_per_flex: u8,
    pub checksum_type: u8,
    pub reserved_pad: U16,
    pub kbytes_written: U64,
    // Add more fields if needed.
}

const _: () = assert!(std::mem::size_of::<SuperBlock>() == 384);

impl SuperBlock {
    /// Creates the superblock of an empty filesystem laid out by `geometry`.
    pub fn new(geometry: &Geometry, uuid: [u8; 16], now: u32) -> Self {
        let mut sb = Self::new_zeroed();
        sb.inodes_count.set(geometry.inodes_count);
        sb.blocks_count.set(geometry.blocks_count);
        sb.r_blocks_count.set(geometry.reserved_blocks);
        sb.free_blocks_count.set(geometry.free_blocks);
        // Inodes 1 to 10 are reserved.
        // <https://docs.kernel.org/filesystems/ext4/special_inodes.html>.
        sb.free_inodes_count
            .set(geometry.inodes_count - (FIRST_INO - 1));
        sb.first_data_block.set(geometry.first_data_block);
        sb.log_block_size.set(LOG_BLOCK_SIZE);
        sb.log_frag_size.set(LOG_BLOCK_SIZE);
        sb.blocks_per_group.set(geometry.blocks_per_group);
        sb.frags_per_group.set(geometry.blocks_per_group);
        sb.inodes_per_group.set(geometry.inodes_per_group);
        // Disable the periodic check based on the mount count.
        sb.max_mnt_count.set(u16::MAX);
        sb.magic.set(EXT2_MAGIC_NUMBER);
        sb.state.set(EXT2_VALID_FS);
        sb.errors.set(EXT2_ERRORS_CONTINUE);
        sb.creator_os.set(EXT2_OS_LINUX);
        sb.rev_level.set(EXT2_DYNAMIC_REV);
        sb.first_ino.set(FIRST_INO);
        sb.inode_size.set(INODE_SIZE as u16);
        sb.feature_incompat.set(FEATURE_INCOMPAT_FILETYPE);
        if geometry.desc_size >= GROUP_DESC_SIZE_64BIT {
            sb.desc_size.set(geometry.desc_size as u16);
            sb.feature_incompat
                .set(sb.feature_incompat.get() | FEATURE_INCOMPAT_64BIT);
        }
        sb.uuid = uuid;
        sb.mkfs_time.set(now);
        sb.wtime.set(now);
        sb.lastcheck.set(now);
        sb
    }

    pub fn set_compat(&mut self, feature: u32) {
        self.feature_compat.set(self.feature_compat.get() | feature);
    }

    pub fn set_ro_compat(&mut self, feature: u32) {
        self.feature_ro_compat
            .set(self.feature_ro_compat.get() | feature);
    }
}

// Implements test utility methods.
#[cfg(test)]
impl SuperBlock {
    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size.get()
    }

    pub fn has_compat(&self, feature: u32) -> bool {
        self.feature_compat.get() & feature != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryParams;

    #[test]
    fn test_new_superblock() {
        let geometry = Geometry::plan(&GeometryParams {
            blocks_count: 16384,
            inodes_count: 4096,
            reserved_blocks: 819,
            wide_descriptors: false,
        })
        .unwrap();
        let sb = SuperBlock::new(&geometry, [7; 16], 1000);
        assert_eq!(sb.magic.get(), 0xef53);
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.first_data_block.get(), 1);
        assert_eq!(sb.free_inodes_count.get(), 4096 - 10);
        assert_eq!(sb.r_blocks_count.get(), 819);
        assert_eq!(sb.feature_incompat.get(), FEATURE_INCOMPAT_FILETYPE);
        assert_eq!(sb.desc_size.get(), 0);
        assert!(!sb.has_compat(FEATURE_COMPAT_HAS_JOURNAL));
        // s_uuid lives at offset 0x68.
        assert_eq!(&sb.as_bytes()[0x68..0x78], &[7; 16]);
        // s_kbytes_written is the last field this struct covers.
        assert_eq!(std::mem::offset_of!(SuperBlock, kbytes_written), 0x178);
    }

    #[test]
    fn test_wide_descriptors() {
        let geometry = Geometry::plan(&GeometryParams {
            blocks_count: 16384,
            inodes_count: 4096,
            reserved_blocks: 0,
            wide_descriptors: true,
        })
        .unwrap();
        let sb = SuperBlock::new(&geometry, [0; 16], 0);
        assert_eq!(sb.desc_size.get(), 64);
        assert_eq!(
            sb.feature_incompat.get(),
            FEATURE_INCOMPAT_FILETYPE | FEATURE_INCOMPAT_64BIT
        );
    }
}
