// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Defines the inode structure.

use enumn::N;
use zerocopy::little_endian::U16;
use zerocopy::little_endian::U32;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

use crate::error::Error;
use crate::error::Result;

/// Root directory.
pub const ROOT_INO: InodeNum = InodeNum(2);
/// Journal of ext3 and ext4.
pub const JOURNAL_INO: InodeNum = InodeNum(8);
/// First inode that is not reserved. Usually used for `lost+found`.
pub const FIRST_INO: u32 = 11;
/// Size of an inode record.
pub const INODE_SIZE: u32 = 128;

/// Each inode contains 12 direct pointers (0-11), one singly indirect pointer (12), one
/// doubly indirect block pointer (13), and one triply indirect pointer (14).
pub const NUM_DIRECT_BLOCKS: usize = 12;
pub const IND_BLOCK: usize = NUM_DIRECT_BLOCKS;
pub const DIND_BLOCK: usize = IND_BLOCK + 1;
pub const TIND_BLOCK: usize = DIND_BLOCK + 1;
pub const NUM_BLOCK_POINTERS: usize = TIND_BLOCK + 1;

/// Max number of hard links to an inode, as enforced by the ext2 driver.
pub const LINK_MAX: u16 = 32000;

/// `i_blocks` counts 512-byte units regardless of the filesystem block size.
const INODE_BLOCK_UNIT: u32 = 512;

/// Types of inodes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, N)]
pub enum InodeType {
    Fifo = 0x1,
    Char = 0x2,
    Directory = 0x4,
    Block = 0x6,
    Regular = 0x8,
    Symlink = 0xa,
    Socket = 0xc,
}

impl InodeType {
    /// Converts to a file type for directory entry.
    pub fn into_dir_entry_file_type(self) -> u8 {
        match self {
            InodeType::Regular => 1,
            InodeType::Directory => 2,
            InodeType::Char => 3,
            InodeType::Block => 4,
            InodeType::Fifo => 5,
            InodeType::Socket => 6,
            InodeType::Symlink => 7,
        }
    }

    /// Returns the `S_IFMT` bits of this type.
    pub fn mode_bits(self) -> u16 {
        (self as u16) << 12
    }
}

/// Represents an inode number. This is 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeNum(pub u32);

impl InodeNum {
    /// Creates an inode number, rejecting 0.
    pub fn new(inode: u32) -> Result<Self> {
        if inode == 0 {
            return Err(Error::InvalidEntry("inode number is 1-indexed".to_string()));
        }
        Ok(Self(inode))
    }

    /// Returns the block group holding this inode.
    pub fn group(self, inodes_per_group: u32) -> usize {
        ((self.0 - 1) / inodes_per_group) as usize
    }

    /// Returns the index of this inode inside its group's bitmap and inode table.
    pub fn index_in_group(self, inodes_per_group: u32) -> usize {
        ((self.0 - 1) % inodes_per_group) as usize
    }
}

impl std::fmt::Display for InodeNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<InodeNum> for u32 {
    fn from(inode: InodeNum) -> Self {
        inode.0
    }
}

/// The ext2 inode, revision 1 with 128-byte records.
///
/// The field names follow the [ext2 documentation](https://www.nongnu.org/ext2-doc/ext2.html#inode-table).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Inode {
    pub mode: U16,
    pub uid: U16,
    pub size: U32,
    pub atime: U32,
    pub ctime: U32,
    pub mtime: U32,
    pub dtime: U32,
    pub gid: U16,
    pub links_count: U16,
    pub blocks: U32,
    pub flags: U32,
    pub osd1: U32,
    pub block: [U32; NUM_BLOCK_POINTERS],
    pub generation: U32,
    pub file_acl: U32,
    /// `i_dir_acl` in revision 0, high 32 bits of the size of regular files since.
    pub size_high: U32,
    pub faddr: U32,
    pub frag: u8,
    pub fsize: u8,
    pub pad1: U16,
    pub uid_high: U16,
    pub gid_high: U16,
    pub reserved2: U32,
}

const _: () = assert!(std::mem::size_of::<Inode>() == INODE_SIZE as usize);

impl Inode {
    pub fn typ(&self) -> Option<InodeType> {
        InodeType::n((self.mode.get() >> 12) as u8)
    }

    pub fn set_mode(&mut self, typ: InodeType, permissions: u16) {
        self.mode.set(typ.mode_bits() | (permissions & 0o7777));
    }

    pub fn set_owner(&mut self, uid: u32, gid: u32) {
        self.uid.set(uid as u16);
        self.uid_high.set((uid >> 16) as u16);
        self.gid.set(gid as u16);
        self.gid_high.set((gid >> 16) as u16);
    }

    pub fn set_times(&mut self, atime: u32, mtime: u32, ctime: u32) {
        self.atime.set(atime);
        self.mtime.set(mtime);
        self.ctime.set(ctime);
    }

    pub fn size(&self) -> u64 {
        if self.typ() == Some(InodeType::Regular) {
            (self.size_high.get() as u64) << 32 | self.size.get() as u64
        } else {
            self.size.get() as u64
        }
    }

    /// Sets the size. Only regular files can grow past 4 GiB.
    pub fn set_size(&mut self, size: u64) -> Result<()> {
        let high = (size >> 32) as u32;
        if high != 0 && self.typ() != Some(InodeType::Regular) {
            return Err(Error::InvalidEntry(format!(
                "size {size} is too large for a {:?} inode",
                self.typ()
            )));
        }
        self.size.set(size as u32);
        self.size_high.set(high);
        Ok(())
    }

    /// Accounts for one more block of `block_size` bytes used by this inode.
    pub fn add_block(&mut self, block_size: u32) {
        self.blocks
            .set(self.blocks.get() + block_size / INODE_BLOCK_UNIT);
    }

    /// Counts one more link to this inode. Fails beyond `LINK_MAX` links.
    pub fn inc_links(&mut self) -> Result<()> {
        let links = self
            .links_count
            .get()
            .checked_add(1)
            .filter(|&n| n <= LINK_MAX)
            .ok_or_else(|| {
                Error::InvalidEntry(format!("too many links: more than {LINK_MAX}"))
            })?;
        self.links_count.set(links);
        Ok(())
    }

    /// Returns the max length of symbolic links that can be stored in the inode data.
    pub const fn max_inline_symlink_len() -> usize {
        NUM_BLOCK_POINTERS * 4
    }

    /// Stores a symbolic link target in the block pointer array. The target must be shorter than
    /// `max_inline_symlink_len()`.
    pub fn set_inline_symlink(&mut self, target: &[u8]) -> Result<()> {
        if target.len() >= Self::max_inline_symlink_len() {
            return Err(Error::InvalidEntry(format!(
                "symlink target of {} bytes cannot be inlined",
                target.len()
            )));
        }
        self.block.as_mut_bytes()[..target.len()].copy_from_slice(target);
        self.size.set(target.len() as u32);
        Ok(())
    }

    /// Stores a device number the way the kernel's ext2 driver does: the old 16-bit encoding in
    /// the first slot when it fits, otherwise the new encoding in the second slot.
    pub fn set_device(&mut self, major: u32, minor: u32) {
        if major < 256 && minor < 256 {
            self.block[0].set(major << 8 | minor);
            self.block[1].set(0);
        } else {
            self.block[0].set(0);
            self.block[1].set((minor & 0xff) | (major << 8) | ((minor & !0xff) << 12));
        }
    }
}
