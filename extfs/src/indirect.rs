// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Maps logical block indices of an inode to physical blocks through the direct, singly, doubly and
//! triply indirect pointers.

use crate::error::Error;
use crate::error::Result;
use crate::fs::ExtFs;
use crate::image::BlockId;
use crate::inode::Inode;
use crate::inode::InodeNum;
use crate::inode::DIND_BLOCK;
use crate::inode::IND_BLOCK;
use crate::inode::NUM_DIRECT_BLOCKS;
use crate::inode::TIND_BLOCK;

/// Slots to follow from the inode's block array down to a data block. The first slot indexes
/// `i_block`, the following ones index pointer tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPath {
    slots: [usize; 4],
    depth: usize,
}

impl BlockPath {
    /// Classifies `index` given `ppb` pointers per block.
    pub fn resolve(index: u64, ppb: u64) -> Result<Self> {
        let direct = NUM_DIRECT_BLOCKS as u64;
        let mut i = index;
        if i < direct {
            return Ok(Self::new(&[i as usize]));
        }
        i -= direct;
        if i < ppb {
            return Ok(Self::new(&[IND_BLOCK, i as usize]));
        }
        i -= ppb;
        if i < ppb * ppb {
            return Ok(Self::new(&[
                DIND_BLOCK,
                (i / ppb) as usize,
                (i % ppb) as usize,
            ]));
        }
        i -= ppb * ppb;
        if i < ppb * ppb * ppb {
            return Ok(Self::new(&[
                TIND_BLOCK,
                (i / (ppb * ppb)) as usize,
                ((i / ppb) % ppb) as usize,
                (i % ppb) as usize,
            ]));
        }
        Err(Error::InvalidBlockIndex(index))
    }

    fn new(path: &[usize]) -> Self {
        let mut slots = [0; 4];
        slots[..path.len()].copy_from_slice(path);
        Self {
            slots,
            depth: path.len(),
        }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.slots[..self.depth]
    }
}

impl ExtFs {
    /// Returns the block holding the `index`-th logical block of inode `num`, allocating the
    /// missing pointer tables and the data block on the way. Each allocated block is accounted
    /// in `inode.blocks`.
    pub(crate) fn block_for_index(
        &mut self,
        num: InodeNum,
        inode: &mut Inode,
        index: u64,
    ) -> Result<BlockId> {
        let path = BlockPath::resolve(index, self.geometry.pointers_per_block())?;
        let block_size = self.geometry.block_size;

        let mut table: Option<BlockId> = None;
        let mut block = 0;
        for &slot in path.as_slice() {
            block = match table {
                None => inode.block[slot].get(),
                Some(t) => self.image.pointer(t, slot)?,
            };
            if block == 0 {
                block = self.allocate_block(num)?.into();
                match table {
                    None => inode.block[slot].set(block),
                    Some(t) => self.image.set_pointer(t, slot, block)?,
                }
                inode.add_block(block_size);
            }
            table = Some(BlockId::from(block));
        }
        Ok(BlockId::from(block))
    }

    /// Returns the block holding the `index`-th logical block of `inode` if it is mapped.
    pub(crate) fn lookup_block(&self, inode: &Inode, index: u64) -> Result<Option<BlockId>> {
        let path = BlockPath::resolve(index, self.geometry.pointers_per_block())?;
        let mut table: Option<BlockId> = None;
        for &slot in path.as_slice() {
            let block = match table {
                None => inode.block[slot].get(),
                Some(t) => self.image.pointer(t, slot)?,
            };
            if block == 0 {
                return Ok(None);
            }
            table = Some(BlockId::from(block));
        }
        Ok(table)
    }
}
