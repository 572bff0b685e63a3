// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Allocates blocks and inodes from the per-group bitmaps.

use crate::bitmap::BitMap;
use crate::error::Error;
use crate::error::Result;
use crate::fs::ExtFs;
use crate::image::BlockId;
use crate::inode::InodeNum;

impl ExtFs {
    /// Allocates a block for `owner`, preferring the block group that holds the inode.
    pub(crate) fn allocate_block(&mut self, owner: InodeNum) -> Result<BlockId> {
        let preferred = owner.group(self.geometry.inodes_per_group);
        let group = if self
            .groups
            .get(preferred)
            .is_some_and(|g| g.free_blocks() > 0)
        {
            preferred
        } else {
            self.groups
                .iter()
                .position(|g| g.free_blocks() > 0)
                .ok_or_else(|| {
                    Error::OutOfSpace(format!("failed to allocate block for inode {owner}"))
                })?
        };

        let desc = &mut self.groups[group];
        let bitmap = BlockId::from(desc.block_bitmap.get());
        let bit = BitMap::from_slice_mut(self.image.block_mut(bitmap)?)
            .allocate()
            .ok_or(Error::InconsistentBitmap {
                kind: "block",
                group,
            })?;
        desc.free_blocks_count.set(desc.free_blocks_count.get() - 1);
        self.sb
            .free_blocks_count
            .set(self.sb.free_blocks_count.get() - 1);

        Ok(BlockId::from(
            self.geometry.group_first_block(group as u32) + bit as u32,
        ))
    }

    /// Allocates an inode from the first block group that has one.
    pub(crate) fn allocate_inode(&mut self) -> Result<InodeNum> {
        let group = self
            .groups
            .iter()
            .position(|g| g.free_inodes() > 0)
            .ok_or_else(|| {
                Error::OutOfSpace(format!(
                    "failed to allocate inode: all {} inodes are used",
                    self.geometry.inodes_count
                ))
            })?;

        let desc = &mut self.groups[group];
        let bitmap = BlockId::from(desc.inode_bitmap.get());
        let bit = BitMap::from_slice_mut(self.image.block_mut(bitmap)?)
            .allocate()
            .ok_or(Error::InconsistentBitmap {
                kind: "inode",
                group,
            })?;
        desc.free_inodes_count.set(desc.free_inodes_count.get() - 1);
        self.sb
            .free_inodes_count
            .set(self.sb.free_inodes_count.get() - 1);

        // Inode numbers are 1-indexed.
        InodeNum::new(group as u32 * self.geometry.inodes_per_group + bit as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::new_fs;
    use crate::inode::FIRST_INO;

    #[test]
    fn test_allocate_inode_sequence() {
        let mut fs = new_fs(16384, 4096);
        // lost+found took the first unreserved inode.
        assert_eq!(fs.allocate_inode().unwrap(), InodeNum(FIRST_INO + 1));
        assert_eq!(fs.allocate_inode().unwrap(), InodeNum(FIRST_INO + 2));
        assert_eq!(fs.groups[0].free_inodes(), 2048 - 13);
        assert_eq!(fs.sb.free_inodes_count.get(), 4096 - 13);
    }

    #[test]
    fn test_allocate_block_prefers_owner_group() {
        let mut fs = new_fs(16384, 4096);
        let b = fs.allocate_block(InodeNum(2049)).unwrap();
        // First data block of group 1.
        assert_eq!(u32::from(b), 8193 + 260);
        let b = fs.allocate_block(InodeNum(12)).unwrap();
        assert!(u32::from(b) < 8193);
    }

    #[test]
    fn test_allocate_block_falls_back() {
        let mut fs = new_fs(16384, 4096);
        let before = fs.sb.free_blocks_count.get();
        fs.groups[1].free_blocks_count.set(0);
        let b = fs.allocate_block(InodeNum(2049)).unwrap();
        assert!(u32::from(b) < 8193);
        assert_eq!(fs.sb.free_blocks_count.get(), before - 1);
    }

    #[test]
    fn test_out_of_blocks() {
        let mut fs = new_fs(16384, 4096);
        for g in fs.groups.iter_mut() {
            g.free_blocks_count.set(0);
        }
        match fs.allocate_block(InodeNum(12)) {
            Err(Error::OutOfSpace(msg)) => {
                assert_eq!(msg, "failed to allocate block for inode 12")
            }
            r => panic!("unexpected result: {r:?}"),
        }
    }

    #[test]
    fn test_out_of_inodes() {
        let mut fs = new_fs(16384, 4096);
        for g in fs.groups.iter_mut() {
            g.free_inodes_count.set(0);
        }
        assert!(matches!(fs.allocate_inode(), Err(Error::OutOfSpace(_))));
    }

    #[test]
    fn test_inconsistent_bitmap() {
        let mut fs = new_fs(16384, 4096);
        let bitmap = BlockId::from(fs.groups[1].inode_bitmap.get());
        fs.image.block_mut(bitmap).unwrap().fill(0xff);
        fs.groups[0].free_inodes_count.set(0);
        assert!(matches!(
            fs.allocate_inode(),
            Err(Error::InconsistentBitmap {
                kind: "inode",
                group: 1
            })
        ));
    }
}
