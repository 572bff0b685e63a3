// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Defines the tree of entries stored in a new filesystem.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::MetadataExt;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use log::debug;
use log::warn;

use crate::error::Error;
use crate::error::Result;

/// Ownership, permissions and timestamps of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Permission bits, including setuid, setgid and sticky bits. The file type bits are ignored.
    pub mode: u16,
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Last access time in seconds since the epoch.
    pub atime: u32,
    /// Last modification time in seconds since the epoch.
    pub mtime: u32,
    /// Last status change time in seconds since the epoch.
    pub ctime: u32,
}

impl Metadata {
    /// Creates metadata owned by root with all timestamps set to 0.
    pub fn with_mode(mode: u16) -> Self {
        Metadata {
            mode: mode & 0o7777,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }

    fn from_host(meta: &std::fs::Metadata) -> Self {
        let time = |t: i64| u32::try_from(t).unwrap_or(0);
        Metadata {
            mode: (meta.mode() & 0o7777) as u16,
            uid: meta.uid(),
            gid: meta.gid(),
            atime: time(meta.atime()),
            mtime: time(meta.mtime()),
            ctime: time(meta.ctime()),
        }
    }
}

/// Where the content of a regular file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Content held in memory.
    Memory(Vec<u8>),
    /// A file on the host, read when the entry is written.
    Host(PathBuf),
}

impl FileSource {
    pub(crate) fn open(&self) -> Result<Box<dyn Read + '_>> {
        Ok(match self {
            FileSource::Memory(bytes) => Box::new(bytes.as_slice()),
            FileSource::Host(path) => Box::new(File::open(path)?),
        })
    }
}

/// Type-specific data of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryData {
    /// A directory and its children, keyed by name.
    Directory(BTreeMap<OsString, Entry>),
    /// A regular file.
    Regular {
        /// Size of the content in bytes.
        size: u64,
        /// Where to read the content from.
        source: FileSource,
    },
    /// A symbolic link and its target.
    Symlink(Vec<u8>),
    /// A character device.
    CharDevice {
        /// Major device number.
        major: u32,
        /// Minor device number.
        minor: u32,
    },
    /// A block device.
    BlockDevice {
        /// Major device number.
        major: u32,
        /// Minor device number.
        minor: u32,
    },
}

/// A node of the entry tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Path relative to the root of the filesystem.
    pub path: PathBuf,
    /// Ownership, permissions and timestamps.
    pub metadata: Metadata,
    /// Type-specific data.
    pub data: EntryData,
}

impl Entry {
    /// Creates an empty directory.
    pub fn directory(path: impl Into<PathBuf>, metadata: Metadata) -> Self {
        Self::new(path, metadata, EntryData::Directory(BTreeMap::new()))
    }

    /// Creates a regular file holding `contents`.
    pub fn file(path: impl Into<PathBuf>, metadata: Metadata, contents: Vec<u8>) -> Self {
        let size = contents.len() as u64;
        Self::new(
            path,
            metadata,
            EntryData::Regular {
                size,
                source: FileSource::Memory(contents),
            },
        )
    }

    /// Creates a regular file whose `size` bytes are read from `host_path`.
    pub fn host_file(
        path: impl Into<PathBuf>,
        metadata: Metadata,
        host_path: impl Into<PathBuf>,
        size: u64,
    ) -> Self {
        Self::new(
            path,
            metadata,
            EntryData::Regular {
                size,
                source: FileSource::Host(host_path.into()),
            },
        )
    }

    /// Creates a symbolic link to `target`.
    pub fn symlink(
        path: impl Into<PathBuf>,
        metadata: Metadata,
        target: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(path, metadata, EntryData::Symlink(target.into()))
    }

    /// Creates a character device node.
    pub fn char_device(
        path: impl Into<PathBuf>,
        metadata: Metadata,
        major: u32,
        minor: u32,
    ) -> Self {
        Self::new(path, metadata, EntryData::CharDevice { major, minor })
    }

    /// Creates a block device node.
    pub fn block_device(
        path: impl Into<PathBuf>,
        metadata: Metadata,
        major: u32,
        minor: u32,
    ) -> Self {
        Self::new(path, metadata, EntryData::BlockDevice { major, minor })
    }

    fn new(path: impl Into<PathBuf>, metadata: Metadata, data: EntryData) -> Self {
        Entry {
            path: path.into(),
            metadata,
            data,
        }
    }

    /// Returns the last component of the path.
    pub fn name(&self) -> Option<&OsStr> {
        self.path.file_name()
    }

    /// Returns the children if this is a directory.
    pub fn children(&self) -> Option<&BTreeMap<OsString, Entry>> {
        match &self.data {
            EntryData::Directory(children) => Some(children),
            _ => None,
        }
    }
}

/// A rooted tree of entries. The root directory itself is implicit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryTree {
    root: BTreeMap<OsString, Entry>,
}

fn normal_components(path: &Path) -> Result<Vec<&OsStr>> {
    let mut names = vec![];
    for c in path.components() {
        match c {
            Component::Normal(name) => names.push(name),
            Component::CurDir => {}
            _ => {
                return Err(Error::InvalidEntry(format!(
                    "path must be relative without '..': {}",
                    path.display()
                )))
            }
        }
    }
    if names.is_empty() {
        return Err(Error::InvalidEntry(format!(
            "path has no name: {:?}",
            path.display()
        )));
    }
    Ok(names)
}

impl EntryTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entries of the root directory.
    pub fn children(&self) -> &BTreeMap<OsString, Entry> {
        &self.root
    }

    /// Inserts `entry` at its path. Its parent directory must already be in the tree.
    pub fn insert(&mut self, entry: Entry) -> Result<()> {
        let names = normal_components(&entry.path)?;
        let Some((name, parents)) = names.split_last() else {
            return Err(Error::InvalidEntry("empty path".to_string()));
        };

        let mut dir = &mut self.root;
        for parent in parents {
            dir = match dir.get_mut(*parent).map(|e| &mut e.data) {
                Some(EntryData::Directory(children)) => children,
                Some(_) => {
                    return Err(Error::InvalidEntry(format!(
                        "parent {:?} of {} is not a directory",
                        parent,
                        entry.path.display()
                    )))
                }
                None => {
                    return Err(Error::InvalidEntry(format!(
                        "missing parent {:?} for {}",
                        parent,
                        entry.path.display()
                    )))
                }
            };
        }

        let name = name.to_os_string();
        if dir.contains_key(&name) {
            return Err(Error::InvalidEntry(format!(
                "entry already present: {}",
                entry.path.display()
            )));
        }
        dir.insert(name, entry);
        Ok(())
    }

    /// Looks up the entry at `path`.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&Entry> {
        let names = normal_components(path.as_ref()).ok()?;
        let (last, parents) = names.split_last()?;
        let mut dir = &self.root;
        for parent in parents {
            dir = dir.get(*parent)?.children()?;
        }
        dir.get(*last)
    }

    /// Builds a tree from the contents of the host directory `src_dir`. Directories, regular
    /// files, symbolic links and device nodes are loaded with their ownership and permissions.
    /// Sockets and FIFOs are skipped.
    pub fn from_host_dir(src_dir: impl AsRef<Path>) -> Result<Self> {
        let mut tree = Self::new();
        tree.load_host_dir(src_dir.as_ref(), Path::new(""))?;
        Ok(tree)
    }

    fn load_host_dir(&mut self, host_dir: &Path, rel_dir: &Path) -> Result<()> {
        let mut dir_entries = std::fs::read_dir(host_dir)?.collect::<std::io::Result<Vec<_>>>()?;
        dir_entries.sort_by_key(|e| e.file_name());

        for dir_entry in dir_entries {
            let host_path = dir_entry.path();
            let path = rel_dir.join(dir_entry.file_name());
            let meta = std::fs::symlink_metadata(&host_path)?;
            let metadata = Metadata::from_host(&meta);
            let ftype = meta.file_type();
            debug!("loading {}", host_path.display());

            let entry = if ftype.is_dir() {
                Entry::directory(&path, metadata)
            } else if ftype.is_file() {
                Entry::host_file(&path, metadata, &host_path, meta.len())
            } else if ftype.is_symlink() {
                let target = std::fs::read_link(&host_path)?;
                Entry::symlink(&path, metadata, target.as_os_str().as_bytes())
            } else if ftype.is_char_device() {
                let (major, minor) = decode_dev(meta.rdev());
                Entry::char_device(&path, metadata, major, minor)
            } else if ftype.is_block_device() {
                let (major, minor) = decode_dev(meta.rdev());
                Entry::block_device(&path, metadata, major, minor)
            } else {
                warn!("skipping {}: unsupported file type", host_path.display());
                continue;
            };
            self.insert(entry)?;

            if ftype.is_dir() {
                self.load_host_dir(&host_path, &path)?;
            }
        }
        Ok(())
    }
}

/// Splits a device number encoded the way glibc's `makedev` does.
fn decode_dev(dev: u64) -> (u32, u32) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major as u32, minor as u32)
}

/// Kind of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Character device.
    Char,
    /// Block device.
    Block,
}

/// A device node given as `name:mode:uid:gid:c|b:major:minor`, e.g. `dev/console:600:0:0:c:5:1`.
/// The mode is octal; the other numbers are decimal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevNode {
    /// Path of the node relative to the root.
    pub path: PathBuf,
    /// Permission bits.
    pub mode: u16,
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Character or block device.
    pub kind: DeviceKind,
    /// Major device number.
    pub major: u32,
    /// Minor device number.
    pub minor: u32,
}

fn invalid_value_err(value: &str, expected: &str) -> String {
    format!("invalid value {value:?}: {expected}")
}

impl FromStr for DevNode {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let components: Vec<&str> = value.split(':').collect();
        if components.len() != 7 || components[0].trim_start_matches('/').is_empty() {
            return Err(invalid_value_err(
                value,
                "expected <name>:<mode>:<uid>:<gid>:<c|b>:<major>:<minor>",
            ));
        }
        let number = |i: usize, what: &str| -> std::result::Result<u32, String> {
            components[i]
                .parse()
                .map_err(|_| invalid_value_err(components[i], &format!("{what} is not a number")))
        };

        let mode = u16::from_str_radix(components[1], 8)
            .ok()
            .filter(|m| *m <= 0o7777)
            .ok_or_else(|| invalid_value_err(components[1], "mode is not a valid octal number"))?;
        let kind = match components[4] {
            "c" => DeviceKind::Char,
            "b" => DeviceKind::Block,
            t => return Err(invalid_value_err(t, "device type must be 'c' or 'b'")),
        };

        Ok(DevNode {
            path: PathBuf::from(components[0].trim_start_matches('/')),
            mode,
            uid: number(2, "uid")?,
            gid: number(3, "gid")?,
            kind,
            major: number(5, "major")?,
            minor: number(6, "minor")?,
        })
    }
}

impl From<DevNode> for Entry {
    fn from(node: DevNode) -> Self {
        let metadata = Metadata {
            uid: node.uid,
            gid: node.gid,
            ..Metadata::with_mode(node.mode)
        };
        match node.kind {
            DeviceKind::Char => Entry::char_device(node.path, metadata, node.major, node.minor),
            DeviceKind::Block => Entry::block_device(node.path, metadata, node.major, node.minor),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    fn meta() -> Metadata {
        Metadata::with_mode(0o644)
    }

    #[test]
    fn test_insert_and_get() {
        let mut tree = EntryTree::new();
        tree.insert(Entry::directory("a", Metadata::with_mode(0o755)))
            .unwrap();
        tree.insert(Entry::file("a/b.txt", meta(), b"hello".to_vec()))
            .unwrap();
        tree.insert(Entry::symlink("./c", meta(), "a/b.txt")).unwrap();

        let b = tree.get("a/b.txt").unwrap();
        assert_eq!(b.name(), Some(OsStr::new("b.txt")));
        assert_eq!(
            b.data,
            EntryData::Regular {
                size: 5,
                source: FileSource::Memory(b"hello".to_vec())
            }
        );
        assert!(tree.get("c").is_some());
        assert!(tree.get("a/missing").is_none());
        assert_eq!(tree.children().len(), 2);
    }

    #[test]
    fn test_insert_errors() {
        let mut tree = EntryTree::new();
        tree.insert(Entry::file("f", meta(), vec![])).unwrap();
        for path in ["missing/x", "f/x", "f", "../x", "/abs", ""] {
            let err = tree.insert(Entry::file(path, meta(), vec![])).unwrap_err();
            assert!(matches!(err, Error::InvalidEntry(_)), "{path}: {err}");
        }
    }

    #[test]
    fn test_parse_dev_node() {
        let node: DevNode = "dev/console:600:0:5:c:5:1".parse().unwrap();
        assert_eq!(node.path, PathBuf::from("dev/console"));
        assert_eq!(node.mode, 0o600);
        assert_eq!(node.gid, 5);
        assert_eq!(node.kind, DeviceKind::Char);
        assert_eq!((node.major, node.minor), (5, 1));

        let entry = Entry::from(node);
        assert_eq!(entry.data, EntryData::CharDevice { major: 5, minor: 1 });
        assert_eq!(entry.metadata.mode, 0o600);

        let node: DevNode = "/dev/sda:660:0:6:b:8:0".parse().unwrap();
        assert_eq!(node.path, PathBuf::from("dev/sda"));
        assert_eq!(node.kind, DeviceKind::Block);

        for bad in [
            "dev/x:600:0:0:p:1:1",
            "dev/x:900:0:0:c:1:1",
            "dev/x:600:0:0:c:1",
            ":600:0:0:c:1:1",
            "dev/x:600:root:0:c:1:1",
        ] {
            assert!(bad.parse::<DevNode>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_decode_dev() {
        assert_eq!(decode_dev(0x0501), (5, 1));
        // makedev(259, 0x12345)
        let dev = (0x12345 & 0xff) | ((259 & 0xfff) << 8) | ((0x12345 & !0xff) << 12);
        assert_eq!(decode_dev(dev), (259, 0x12345));
    }

    #[test]
    fn test_from_host_dir() {
        let td = tempdir().unwrap();
        let root = td.path();
        std::fs::create_dir(root.join("dir")).unwrap();
        std::fs::write(root.join("dir/file"), b"content").unwrap();
        std::fs::set_permissions(root.join("dir/file"), std::fs::Permissions::from_mode(0o640))
            .unwrap();
        symlink("dir/file", root.join("link")).unwrap();

        let tree = EntryTree::from_host_dir(root).unwrap();
        let file = tree.get("dir/file").unwrap();
        assert_eq!(file.metadata.mode, 0o640);
        assert_eq!(
            file.data,
            EntryData::Regular {
                size: 7,
                source: FileSource::Host(root.join("dir/file"))
            }
        );
        assert_eq!(
            tree.get("link").unwrap().data,
            EntryData::Symlink(b"dir/file".to_vec())
        );
        assert!(tree.get("dir").unwrap().children().is_some());
    }
}
