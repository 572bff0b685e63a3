// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Defines the parameters of a filesystem image and the entry point that builds it.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use log::info;

use crate::entry::EntryTree;
use crate::error::Error;
use crate::error::Result;
use crate::fs::ExtFs;
use crate::fs::FsOptions;
use crate::geometry::Geometry;
use crate::geometry::GeometryParams;
use crate::geometry::BLOCK_SIZE;
use crate::inode::InodeNum;
use crate::journal::MIN_JOURNAL_BLOCKS;

/// Revision of the ext filesystem family to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FsVersion {
    /// ext2, no journal.
    Ext2 = 2,
    /// ext3, ext2 with a journal.
    Ext3 = 3,
    /// ext4. Same layout as ext3 here, but 64-byte group descriptors can be enabled.
    Ext4 = 4,
}

impl FsVersion {
    /// Returns whether the filesystem carries a journal.
    pub fn has_journal(self) -> bool {
        self >= FsVersion::Ext3
    }
}

impl FromStr for FsVersion {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.strip_prefix("ext").unwrap_or(value) {
            "2" => Ok(FsVersion::Ext2),
            "3" => Ok(FsVersion::Ext3),
            "4" => Ok(FsVersion::Ext4),
            _ => Err(format!(
                "invalid filesystem type {value:?}: expected ext2, ext3 or ext4"
            )),
        }
    }
}

impl std::fmt::Display for FsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ext{}", *self as u8)
    }
}

/// Parameters of a filesystem image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Builder {
    /// Size of the image in bytes. Trailing bytes that do not make a whole block stay zero.
    pub size: u64,
    /// ext2, ext3 or ext4.
    pub version: FsVersion,
    /// One inode is created for every `inode_ratio` bytes of the image.
    pub inode_ratio: u64,
    /// Percentage of blocks reserved for the super user.
    pub reserved_ratio: u8,
    /// Number of inodes, overriding `inode_ratio`.
    pub inode_count: Option<u64>,
    /// Size of the journal in blocks. Ignored for ext2.
    pub journal_blocks: u32,
    /// Use 64-byte group descriptors (`INCOMPAT_64BIT`). ext4 only. Never enabled automatically:
    /// images of any size get 32-byte descriptors unless this is set.
    pub wide_descriptors: bool,
    /// Volume UUID. A random one is generated if `None`.
    pub uuid: Option<[u8; 16]>,
    /// Creation and write time in seconds since the epoch. The current time is used if `None`.
    pub timestamp: Option<u32>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            size: 256 * 1024 * 1024,
            version: FsVersion::Ext2,
            inode_ratio: 4096,
            reserved_ratio: 5,
            inode_count: None,
            journal_blocks: MIN_JOURNAL_BLOCKS,
            wide_descriptors: false,
            uuid: None,
            timestamp: None,
        }
    }
}

impl Builder {
    /// Validates the parameters and derives the inputs of the geometry planner.
    pub fn geometry_params(&self) -> Result<GeometryParams> {
        if self.inode_ratio == 0 {
            return Err(Error::Configuration("inode ratio must not be 0".to_string()));
        }
        if self.reserved_ratio > 50 {
            return Err(Error::Configuration(format!(
                "reserved ratio must be at most 50%: {}%",
                self.reserved_ratio
            )));
        }
        if self.wide_descriptors && self.version != FsVersion::Ext4 {
            return Err(Error::Configuration(format!(
                "64-bit group descriptors are not supported by {}",
                self.version
            )));
        }
        if self.version.has_journal() && self.journal_blocks < MIN_JOURNAL_BLOCKS {
            return Err(Error::Configuration(format!(
                "journal must have at least {MIN_JOURNAL_BLOCKS} blocks: {}",
                self.journal_blocks
            )));
        }
        usize::try_from(self.size).map_err(|_| {
            Error::Configuration(format!("image size {} does not fit in memory", self.size))
        })?;

        let blocks_count = self.size / BLOCK_SIZE as u64;
        Ok(GeometryParams {
            blocks_count,
            inodes_count: self.inode_count.unwrap_or(self.size / self.inode_ratio),
            reserved_blocks: blocks_count * self.reserved_ratio as u64 / 100,
            wide_descriptors: self.wide_descriptors,
        })
    }

    /// Builds an image holding `tree` and returns its bytes.
    pub fn build(&self, tree: &EntryTree) -> Result<Vec<u8>> {
        self.build_with_inodes(tree).map(|(image, _)| image)
    }

    /// Builds an image holding `tree` and returns its bytes along with the inode number assigned
    /// to each path of the tree.
    pub fn build_with_inodes(
        &self,
        tree: &EntryTree,
    ) -> Result<(Vec<u8>, BTreeMap<PathBuf, InodeNum>)> {
        let geometry = Geometry::plan(&self.geometry_params()?)?;
        info!(
            "creating {} image: {} blocks in {} groups, {} inodes",
            self.version, geometry.blocks_count, geometry.group_count, geometry.inodes_count
        );

        let opts = FsOptions {
            version: self.version,
            uuid: self
                .uuid
                .unwrap_or_else(|| uuid::Uuid::new_v4().into_bytes()),
            now: self.timestamp.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or_default()
            }),
            journal_blocks: self.journal_blocks,
        };
        // Checked by `geometry_params`.
        let image_size = self.size as usize;

        let mut fs = ExtFs::new(image_size, geometry, &opts)?;
        let inodes = fs.populate(tree.children())?;
        info!(
            "{} entries written, {} blocks and {} inodes free",
            inodes.len(),
            fs.sb.free_blocks_count.get(),
            fs.sb.free_inodes_count.get()
        );
        Ok((fs.finalize()?, inodes))
    }

    /// Builds an image holding `tree` and writes it to `path`.
    pub fn build_to_file(&self, tree: &EntryTree, path: impl AsRef<Path>) -> Result<()> {
        let image = self.build(tree)?;
        let mut file = File::create(path)?;
        file.write_all(&image)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!("ext2".parse::<FsVersion>().unwrap(), FsVersion::Ext2);
        assert_eq!("ext4".parse::<FsVersion>().unwrap(), FsVersion::Ext4);
        assert_eq!("3".parse::<FsVersion>().unwrap(), FsVersion::Ext3);
        assert!("ext5".parse::<FsVersion>().is_err());
        assert!("btrfs".parse::<FsVersion>().is_err());
        assert!("ext02".parse::<FsVersion>().is_err());
        assert_eq!(FsVersion::Ext3.to_string(), "ext3");
        assert!(!FsVersion::Ext2.has_journal());
        assert!(FsVersion::Ext4.has_journal());
    }

    #[test]
    fn test_default_params() {
        let params = Builder::default().geometry_params().unwrap();
        assert_eq!(params.blocks_count, 262144);
        assert_eq!(params.inodes_count, 65536);
        assert_eq!(params.reserved_blocks, 13107);
        assert!(!params.wide_descriptors);
    }

    #[test]
    fn test_narrow_descriptors_by_default() {
        let builder = Builder {
            size: 4 * 1024 * 1024 * 1024,
            version: FsVersion::Ext4,
            ..Default::default()
        };
        let params = builder.geometry_params().unwrap();
        assert!(!params.wide_descriptors);
        assert_eq!(Geometry::plan(&params).unwrap().desc_size, 32);
    }

    #[test]
    fn test_invalid_params() {
        let cases = [
            Builder {
                inode_ratio: 0,
                ..Default::default()
            },
            Builder {
                reserved_ratio: 60,
                ..Default::default()
            },
            Builder {
                wide_descriptors: true,
                version: FsVersion::Ext3,
                ..Default::default()
            },
            Builder {
                version: FsVersion::Ext3,
                journal_blocks: 100,
                ..Default::default()
            },
        ];
        for b in cases {
            assert!(
                matches!(b.geometry_params(), Err(Error::Configuration(_))),
                "{b:?}"
            );
        }
    }

    #[test]
    fn test_too_few_inodes() {
        let builder = Builder {
            size: 16 * 1024 * 1024,
            inode_count: Some(5),
            ..Default::default()
        };
        assert!(matches!(
            builder.build(&EntryTree::new()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_too_small_image() {
        // 128 inodes need an inode table of 16 blocks, more than 10 blocks can hold.
        let builder = Builder {
            size: 10 * 1024,
            inode_count: Some(128),
            ..Default::default()
        };
        assert!(matches!(
            builder.build(&EntryTree::new()),
            Err(Error::Geometry(_))
        ));
    }

    #[test]
    fn test_reproducible() {
        let builder = Builder {
            size: 4 * 1024 * 1024,
            version: FsVersion::Ext3,
            uuid: Some([1; 16]),
            timestamp: Some(1234),
            ..Default::default()
        };
        let tree = EntryTree::new();
        assert_eq!(builder.build(&tree).unwrap(), builder.build(&tree).unwrap());
    }

    #[test]
    fn test_unaligned_size() {
        let builder = Builder {
            size: 4 * 1024 * 1024 + 100,
            ..Default::default()
        };
        let image = builder.build(&EntryTree::new()).unwrap();
        assert_eq!(image.len(), 4 * 1024 * 1024 + 100);
        assert!(image[4 * 1024 * 1024..].iter().all(|&b| b == 0));
    }
}
