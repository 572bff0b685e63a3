// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Creates the empty JBD2 journal of ext3 and ext4 filesystems.

use log::info;
use zerocopy::big_endian::U32;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

use crate::entry::Metadata;
use crate::error::Error;
use crate::error::Result;
use crate::fs::ExtFs;
use crate::inode::InodeType;
use crate::inode::JOURNAL_INO;
use crate::inode::NUM_BLOCK_POINTERS;
use crate::superblock::FEATURE_COMPAT_HAS_JOURNAL;
use crate::superblock::JNL_BACKUP_BLOCKS;

const JBD2_MAGIC_NUMBER: u32 = 0xC03B_3998;
const JBD2_SUPERBLOCK_V2: u32 = 4;

/// Smallest journal, in blocks, that is created.
pub const MIN_JOURNAL_BLOCKS: u32 = 1024;

/// The journal superblock stored in the first block of the journal. All fields are big-endian.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct JournalSuperBlock {
    // Common block header.
    pub magic: U32,
    pub blocktype: U32,
    pub header_sequence: U32,

    // Static information describing the journal.
    pub blocksize: U32,
    pub maxlen: U32,
    pub first: U32,

    // Dynamic information describing the current state of the log.
    pub sequence: U32,
    pub start: U32,
    pub errno: U32,

    pub feature_compat: U32,
    pub feature_incompat: U32,
    pub feature_ro_compat: U32,
    pub uuid: [u8; 16],
    pub nr_users: U32,
    pub dynsuper: U32,
    pub max_transaction: U32,
    pub max_trans_data: U32,
    pub checksum_type: u8,
    pub padding2: [u8; 3],
    pub num_fc_blks: U32,
    pub head: U32,
    pub padding: [U32; 40],
    pub checksum: U32,
    pub users: [u8; 16 * 48],
}

const _: () = assert!(std::mem::size_of::<JournalSuperBlock>() == 1024);

impl JournalSuperBlock {
    /// Creates the superblock of an empty journal of `maxlen` blocks.
    pub fn new(block_size: u32, maxlen: u32, uuid: [u8; 16]) -> Self {
        let mut jsb = Self::new_zeroed();
        jsb.magic.set(JBD2_MAGIC_NUMBER);
        jsb.blocktype.set(JBD2_SUPERBLOCK_V2);
        jsb.blocksize.set(block_size);
        jsb.maxlen.set(maxlen);
        jsb.first.set(1);
        jsb.sequence.set(1);
        jsb.nr_users.set(1);
        jsb.uuid = uuid;
        jsb
    }
}

impl ExtFs {
    /// Writes a journal of `blocks` blocks into the reserved journal inode and records it in the
    /// superblock.
    pub(crate) fn add_journal(&mut self, blocks: u32) -> Result<()> {
        if blocks < MIN_JOURNAL_BLOCKS {
            return Err(Error::Configuration(format!(
                "journal must have at least {MIN_JOURNAL_BLOCKS} blocks: {blocks}"
            )));
        }
        info!("creating a journal of {blocks} blocks");

        let num = JOURNAL_INO;
        let metadata = Metadata {
            atime: self.now,
            mtime: self.now,
            ctime: self.now,
            ..Metadata::with_mode(0o600)
        };
        let mut inode = self.init_inode(num, InodeType::Regular, &metadata)?;
        inode.links_count.set(1);

        let block_size = self.geometry.block_size;
        let mut block = vec![0u8; block_size as usize];
        let jsb = JournalSuperBlock::new(block_size, blocks, self.sb.uuid);
        block[..std::mem::size_of::<JournalSuperBlock>()].copy_from_slice(jsb.as_bytes());
        self.append(num, &mut inode, &block)?;
        block.fill(0);
        for _ in 1..blocks {
            self.append(num, &mut inode, &block)?;
        }
        self.write_inode(num, &inode)?;

        self.sb.set_compat(FEATURE_COMPAT_HAS_JOURNAL);
        self.sb.journal_inum.set(num.into());
        self.sb.jnl_backup_type = JNL_BACKUP_BLOCKS;
        self.sb.jnl_blocks[..NUM_BLOCK_POINTERS].copy_from_slice(&inode.block);
        self.sb.jnl_blocks[NUM_BLOCK_POINTERS] = inode.size_high;
        self.sb.jnl_blocks[NUM_BLOCK_POINTERS + 1] = inode.size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FsVersion;
    use crate::fs::tests::new_fs_with;

    #[test]
    fn test_ext3_journal() {
        let fs = new_fs_with(16384, 4096, FsVersion::Ext3);
        assert!(fs.sb.has_compat(FEATURE_COMPAT_HAS_JOURNAL));
        assert_eq!(fs.sb.journal_inum.get(), 8);

        let inode = fs.read_inode(JOURNAL_INO).unwrap();
        assert_eq!(inode.mode.get(), 0o100600);
        assert_eq!(inode.links_count.get(), 1);
        assert_eq!(inode.size(), 1024 * 1024);
        // 1024 data blocks, 12 direct, 256 through the singly indirect table, and 756 through the
        // doubly indirect table and 3 of its tables.
        assert_eq!(inode.blocks.get(), (1024 + 5) * 2);

        let first = fs.lookup_block(&inode, 0).unwrap().unwrap();
        let jsb = JournalSuperBlock::read_from_bytes(fs.image.block(first).unwrap()).unwrap();
        assert_eq!(jsb.magic.get(), 0xC03B3998);
        assert_eq!(jsb.blocktype.get(), 4);
        assert_eq!(jsb.blocksize.get(), 1024);
        assert_eq!(jsb.maxlen.get(), 1024);
        assert_eq!(jsb.first.get(), 1);
        assert_eq!(jsb.sequence.get(), 1);
        assert_eq!(jsb.nr_users.get(), 1);
        assert_eq!(jsb.uuid, fs.sb.uuid);
        // Big-endian on disk.
        assert_eq!(&fs.image.block(first).unwrap()[..4], &[0xc0, 0x3b, 0x39, 0x98]);

        let last = fs.lookup_block(&inode, 1023).unwrap().unwrap();
        assert!(fs.image.block(last).unwrap().iter().all(|&b| b == 0));
        assert_eq!(fs.lookup_block(&inode, 1024).unwrap(), None);

        assert_eq!(fs.sb.jnl_backup_type, 1);
        assert_eq!(fs.sb.jnl_blocks[..15], inode.block);
        assert_eq!(fs.sb.jnl_blocks[16].get(), 1024 * 1024);
    }

    #[test]
    fn test_ext2_has_no_journal() {
        let fs = new_fs_with(16384, 4096, FsVersion::Ext2);
        assert!(!fs.sb.has_compat(FEATURE_COMPAT_HAS_JOURNAL));
        assert_eq!(fs.sb.journal_inum.get(), 0);
        assert_eq!(fs.read_inode(JOURNAL_INO).unwrap().mode.get(), 0);
    }

    #[test]
    fn test_journal_too_small() {
        let mut fs = new_fs_with(16384, 4096, FsVersion::Ext2);
        assert!(matches!(
            fs.add_journal(MIN_JOURNAL_BLOCKS - 1),
            Err(Error::Configuration(_))
        ));
    }
}
