// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Defines a struct to represent an ext2/3/4 filesystem under construction and implements methods
//! to populate it from an entry tree.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::info;
use zerocopy::FromZeros;

use crate::blockgroup::GroupDescriptor;
use crate::blockgroup::GroupLayout;
use crate::builder::FsVersion;
use crate::entry::DeviceKind;
use crate::entry::Entry;
use crate::entry::EntryData;
use crate::entry::FileSource;
use crate::entry::Metadata;
use crate::error::Error;
use crate::error::Result;
use crate::geometry::Geometry;
use crate::image::BlockId;
use crate::image::Image;
use crate::inode::Inode;
use crate::inode::InodeNum;
use crate::inode::InodeType;
use crate::inode::INODE_SIZE;
use crate::inode::ROOT_INO;
use crate::superblock::SuperBlock;
use crate::superblock::FEATURE_RO_COMPAT_LARGE_FILE;
use crate::superblock::SUPERBLOCK_OFFSET;
use crate::superblock::SUPERBLOCK_SIZE;

/// Regular files of this size or larger need `RO_COMPAT_LARGE_FILE`.
const LARGE_FILE_SIZE: u64 = 1 << 31;

const LOST_AND_FOUND: &str = "lost+found";

/// Parameters of a filesystem that are not part of its geometry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FsOptions {
    pub version: FsVersion,
    pub uuid: [u8; 16],
    pub now: u32,
    pub journal_blocks: u32,
}

/// A struct to represent an ext2/3/4 filesystem being built in memory.
pub(crate) struct ExtFs {
    pub(crate) image: Image,
    pub(crate) geometry: Geometry,
    /// Primary superblock. Written to the image by `finalize`.
    pub(crate) sb: SuperBlock,
    /// Group descriptors. Written to the image by `finalize`.
    pub(crate) groups: Vec<GroupDescriptor>,
    pub(crate) now: u32,
    lost_found: InodeNum,
}

impl ExtFs {
    /// Lays out an empty filesystem in an image of `image_size` bytes: superblock, group
    /// descriptors, bitmaps, the root directory, `lost+found` and the journal if any.
    pub(crate) fn new(image_size: usize, geometry: Geometry, opts: &FsOptions) -> Result<Self> {
        let needed = geometry.blocks_count as u64 * geometry.block_size as u64;
        if (image_size as u64) < needed {
            return Err(Error::Configuration(format!(
                "image of {image_size} bytes cannot hold {} blocks",
                geometry.blocks_count
            )));
        }

        let mut image = Image::new(image_size, geometry.block_size as usize);
        let groups = (0..geometry.group_count)
            .map(|g| GroupDescriptor::init(&mut image, &geometry, g))
            .collect::<Result<Vec<_>>>()?;
        let sb = SuperBlock::new(&geometry, opts.uuid, opts.now);

        let mut fs = ExtFs {
            image,
            geometry,
            sb,
            groups,
            now: opts.now,
            lost_found: ROOT_INO,
        };

        // The root inode is reserved, so it is not taken from the bitmap.
        let root_metadata = fs.stamped(0o755);
        fs.init_inode(ROOT_INO, InodeType::Directory, &root_metadata)?;
        fs.add_entry(ROOT_INO, ROOT_INO, b".")?;
        fs.add_entry(ROOT_INO, ROOT_INO, b"..")?;
        fs.inc_used_dirs(ROOT_INO);

        let lost_found_metadata = fs.stamped(0o700);
        fs.lost_found =
            fs.add_directory(ROOT_INO, LOST_AND_FOUND.as_bytes(), &lost_found_metadata)?;

        if opts.version.has_journal() {
            fs.add_journal(opts.journal_blocks)?;
        }
        Ok(fs)
    }

    fn stamped(&self, mode: u16) -> Metadata {
        Metadata {
            atime: self.now,
            mtime: self.now,
            ctime: self.now,
            ..Metadata::with_mode(mode)
        }
    }

    fn inode_offset(&self, num: InodeNum) -> Result<usize> {
        if num.0 == 0 || num.0 > self.geometry.inodes_count {
            return Err(Error::InvalidEntry(format!(
                "inode {num} is out of range 1..={}",
                self.geometry.inodes_count
            )));
        }
        let ipg = self.geometry.inodes_per_group;
        let table = BlockId::from(self.groups[num.group(ipg)].inode_table.get());
        Ok(self.image.block_offset(table) + num.index_in_group(ipg) * INODE_SIZE as usize)
    }

    /// Returns a copy of an inode record.
    pub(crate) fn read_inode(&self, num: InodeNum) -> Result<Inode> {
        self.image.read(self.inode_offset(num)?)
    }

    /// Stores an inode record.
    pub(crate) fn write_inode(&mut self, num: InodeNum, inode: &Inode) -> Result<()> {
        let offset = self.inode_offset(num)?;
        self.image.write(offset, inode)
    }

    /// Writes a fresh inode of type `typ` with `metadata` and no links or data, and returns it.
    pub(crate) fn init_inode(
        &mut self,
        num: InodeNum,
        typ: InodeType,
        metadata: &Metadata,
    ) -> Result<Inode> {
        let mut inode = Inode::new_zeroed();
        inode.set_mode(typ, metadata.mode);
        inode.set_owner(metadata.uid, metadata.gid);
        inode.set_times(metadata.atime, metadata.mtime, metadata.ctime);
        self.write_inode(num, &inode)?;
        Ok(inode)
    }

    fn inc_used_dirs(&mut self, num: InodeNum) {
        let desc = &mut self.groups[num.group(self.geometry.inodes_per_group)];
        desc.used_dirs_count.set(desc.used_dirs_count.get() + 1);
    }

    /// Creates a directory `name` in `parent` with its `.` and `..` entries.
    pub(crate) fn add_directory(
        &mut self,
        parent: InodeNum,
        name: &[u8],
        metadata: &Metadata,
    ) -> Result<InodeNum> {
        let num = self.allocate_inode()?;
        self.init_inode(num, InodeType::Directory, metadata)?;
        self.add_entry(parent, num, name)?;
        self.add_entry(num, num, b".")?;
        self.add_entry(num, parent, b"..")?;
        self.inc_used_dirs(num);
        Ok(num)
    }

    fn add_file(
        &mut self,
        parent: InodeNum,
        name: &[u8],
        metadata: &Metadata,
        size: u64,
        source: &FileSource,
    ) -> Result<InodeNum> {
        let num = self.allocate_inode()?;
        self.init_inode(num, InodeType::Regular, metadata)?;
        self.add_entry(parent, num, name)?;
        if size == 0 {
            return Ok(num);
        }

        let mut inode = self.read_inode(num)?;
        let written = self.append_from(num, &mut inode, source.open()?)?;
        if written != size {
            return Err(Error::InvalidEntry(format!(
                "{:?}: expected {size} bytes of content but read {written}",
                String::from_utf8_lossy(name)
            )));
        }
        self.write_inode(num, &inode)?;
        if size >= LARGE_FILE_SIZE {
            self.sb.set_ro_compat(FEATURE_RO_COMPAT_LARGE_FILE);
        }
        Ok(num)
    }

    fn add_symlink(
        &mut self,
        parent: InodeNum,
        name: &[u8],
        metadata: &Metadata,
        target: &[u8],
    ) -> Result<InodeNum> {
        if target.is_empty() || target.len() >= self.geometry.block_size as usize {
            return Err(Error::InvalidEntry(format!(
                "symlink target must be 1 to {} bytes: {:?}",
                self.geometry.block_size - 1,
                String::from_utf8_lossy(target)
            )));
        }

        let num = self.allocate_inode()?;
        self.init_inode(num, InodeType::Symlink, metadata)?;
        self.add_entry(parent, num, name)?;

        let mut inode = self.read_inode(num)?;
        if target.len() < Inode::max_inline_symlink_len() {
            inode.set_inline_symlink(target)?;
        } else {
            self.append(num, &mut inode, target)?;
        }
        self.write_inode(num, &inode)?;
        Ok(num)
    }

    fn add_device(
        &mut self,
        parent: InodeNum,
        name: &[u8],
        metadata: &Metadata,
        kind: DeviceKind,
        major: u32,
        minor: u32,
    ) -> Result<InodeNum> {
        let typ = match kind {
            DeviceKind::Char => InodeType::Char,
            DeviceKind::Block => InodeType::Block,
        };
        let num = self.allocate_inode()?;
        self.init_inode(num, typ, metadata)?;
        self.add_entry(parent, num, name)?;

        let mut inode = self.read_inode(num)?;
        inode.set_device(major, minor);
        self.write_inode(num, &inode)?;
        Ok(num)
    }

    /// Copies the entries of `children` into the root directory, recursively, and returns the
    /// inode assigned to each path.
    pub(crate) fn populate(
        &mut self,
        children: &BTreeMap<OsString, Entry>,
    ) -> Result<BTreeMap<PathBuf, InodeNum>> {
        let mut inodes = BTreeMap::new();
        self.populate_dir(ROOT_INO, Path::new(""), children, &mut inodes)?;
        Ok(inodes)
    }

    fn populate_dir(
        &mut self,
        parent: InodeNum,
        parent_path: &Path,
        children: &BTreeMap<OsString, Entry>,
        inodes: &mut BTreeMap<PathBuf, InodeNum>,
    ) -> Result<()> {
        for (name, entry) in children {
            let path = parent_path.join(name);
            let name = name.as_bytes();
            let metadata = &entry.metadata;
            let is_lost_found = parent == ROOT_INO && name == LOST_AND_FOUND.as_bytes();

            let num = match &entry.data {
                EntryData::Directory(_) if is_lost_found => {
                    // `lost+found` was created with the filesystem. Merge into it.
                    info!("merging the existing /{LOST_AND_FOUND} directory");
                    self.lost_found
                }
                _ if is_lost_found => {
                    return Err(Error::InvalidEntry(format!(
                        "/{LOST_AND_FOUND} must be a directory"
                    )))
                }
                EntryData::Directory(_) => self.add_directory(parent, name, metadata)?,
                EntryData::Regular { size, source } => {
                    self.add_file(parent, name, metadata, *size, source)?
                }
                EntryData::Symlink(target) => self.add_symlink(parent, name, metadata, target)?,
                EntryData::CharDevice { major, minor } => {
                    self.add_device(parent, name, metadata, DeviceKind::Char, *major, *minor)?
                }
                EntryData::BlockDevice { major, minor } => {
                    self.add_device(parent, name, metadata, DeviceKind::Block, *major, *minor)?
                }
            };
            debug!("inode {num} for /{}", path.display());

            if let EntryData::Directory(grandchildren) = &entry.data {
                self.populate_dir(num, &path, grandchildren, inodes)?;
            }
            inodes.insert(path, num);
        }
        Ok(())
    }

    /// Marks the filesystem clean, writes the superblock and the group descriptors, copies them
    /// to every block group and returns the image.
    pub(crate) fn finalize(mut self) -> Result<Vec<u8>> {
        self.sb.wtime.set(self.now);
        self.sb.lastcheck.set(self.now);
        self.sb.state.set(1);

        self.image.write(SUPERBLOCK_OFFSET, &self.sb)?;
        let desc_size = self.geometry.desc_size as usize;
        let desc_start = self
            .image
            .block_offset(GroupLayout::new(&self.geometry, 0).descriptors);
        for (i, desc) in self.groups.iter().enumerate() {
            self.image.write(desc_start + i * desc_size, desc)?;
        }

        let desc_len = self.geometry.desc_blocks as usize * self.geometry.block_size as usize;
        for g in 1..self.geometry.group_count {
            let layout = GroupLayout::new(&self.geometry, g);
            let sb_dst = self.image.block_offset(layout.superblock);
            self.image
                .copy_within(SUPERBLOCK_OFFSET, sb_dst, SUPERBLOCK_SIZE)?;
            let desc_dst = self.image.block_offset(layout.descriptors);
            self.image.copy_within(desc_start, desc_dst, desc_len)?;
        }
        Ok(self.image.into_inner())
    }
}
