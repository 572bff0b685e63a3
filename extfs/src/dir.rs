// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encodes linked-list directory entries.

use zerocopy::little_endian::U16;
use zerocopy::little_endian::U32;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

use crate::error::Error;
use crate::error::Result;
use crate::fs::ExtFs;
use crate::inode::InodeNum;

/// Max length of an entry name.
pub const MAX_NAME_LEN: usize = 255;

/// The fixed part of a directory entry. The name follows, padded to 4 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DirEntryHeader {
    pub inode: U32,
    pub rec_len: U16,
    pub name_len: u8,
    pub file_type: u8,
}

const HEADER_SIZE: usize = std::mem::size_of::<DirEntryHeader>();

/// Returns the smallest record length that can hold a name of `name_len` bytes.
///
/// rec_len = |inode| + |rec_len| + |name_len| + |file_type| + name + padding
///         = 8 + |name| + padding
pub fn rec_len_for(name_len: usize) -> usize {
    (HEADER_SIZE + name_len).next_multiple_of(4)
}

/// Checks that `name` can be stored in a directory entry.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidEntry("entry name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidEntry(format!(
            "name length must not exceed {MAX_NAME_LEN}: {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    if name.iter().any(|&c| c == b'/' || c == 0) {
        return Err(Error::InvalidEntry(format!(
            "name must not contain '/' or NUL: {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

fn write_entry(
    block: &mut [u8],
    offset: usize,
    rec_len: usize,
    inode: u32,
    file_type: u8,
    name: &[u8],
) -> Result<()> {
    let overflow = Error::ImageOverflow {
        offset,
        len: rec_len,
    };
    let header = DirEntryHeader {
        inode: U32::new(inode),
        rec_len: U16::new(rec_len as u16),
        name_len: name.len() as u8,
        file_type,
    };
    let dst = block
        .get_mut(offset..offset + HEADER_SIZE + name.len())
        .ok_or(overflow)?;
    dst[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    dst[HEADER_SIZE..].copy_from_slice(name);
    Ok(())
}

/// Tries to store an entry in `block`, which must already hold a valid entry list. A hole left by
/// an unused entry is reused when it is large enough. Otherwise the first entry with enough slack
/// is shrunk to its minimal length and the new entry takes the rest of its record.
///
/// Returns `false` when there is no room in the block.
pub fn insert_into_block(block: &mut [u8], inode: u32, file_type: u8, name: &[u8]) -> Result<bool> {
    let need = rec_len_for(name.len());
    let mut offset = 0;
    while offset + HEADER_SIZE < block.len() {
        let (header, _) = DirEntryHeader::read_from_prefix(&block[offset..]).map_err(|_| {
            Error::ImageOverflow {
                offset,
                len: HEADER_SIZE,
            }
        })?;
        let rec_len = header.rec_len.get() as usize;
        if header.inode.get() == 0 && rec_len >= need {
            write_entry(block, offset, rec_len, inode, file_type, name)?;
            return Ok(true);
        }

        let min_rec_len = rec_len_for(header.name_len as usize);
        if rec_len >= min_rec_len + need {
            let shrunk = DirEntryHeader {
                rec_len: U16::new(min_rec_len as u16),
                ..header
            };
            block[offset..offset + HEADER_SIZE].copy_from_slice(shrunk.as_bytes());
            write_entry(
                block,
                offset + min_rec_len,
                rec_len - min_rec_len,
                inode,
                file_type,
                name,
            )?;
            return Ok(true);
        }

        // A zero record length would loop forever.
        if rec_len == 0 {
            break;
        }
        offset += rec_len;
    }
    Ok(false)
}

/// A decoded directory entry.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub file_type: u8,
    pub name: Vec<u8>,
}

/// Decodes the entry list of a directory block, including holes.
#[cfg(test)]
pub fn parse_block(block: &[u8]) -> Vec<DirEntry> {
    let mut entries = vec![];
    let mut offset = 0;
    while offset + HEADER_SIZE <= block.len() {
        let (header, rest) = DirEntryHeader::read_from_prefix(&block[offset..]).unwrap();
        entries.push(DirEntry {
            inode: header.inode.get(),
            rec_len: header.rec_len.get(),
            file_type: header.file_type,
            name: rest[..header.name_len as usize].to_vec(),
        });
        assert_ne!(header.rec_len.get(), 0);
        offset += header.rec_len.get() as usize;
    }
    assert_eq!(offset, block.len(), "rec_len must sum to the block size");
    entries
}

impl ExtFs {
    /// Adds an entry `name` pointing to `child` in the directory `parent` and increments the link
    /// count of `child`. Only the last block of the directory is searched for room; a new block is
    /// appended if it is full.
    pub(crate) fn add_entry(
        &mut self,
        parent: InodeNum,
        child: InodeNum,
        name: &[u8],
    ) -> Result<()> {
        validate_name(name)?;

        let mut child_inode = self.read_inode(child)?;
        let file_type = child_inode
            .typ()
            .ok_or_else(|| Error::InvalidEntry(format!("inode {child} has no valid type")))?
            .into_dir_entry_file_type();
        child_inode.inc_links().map_err(|e| match e {
            Error::InvalidEntry(msg) => Error::InvalidEntry(format!(
                "{:?} -> inode {child}: {msg}",
                String::from_utf8_lossy(name)
            )),
            e => e,
        })?;
        self.write_inode(child, &child_inode)?;

        let mut parent_inode = self.read_inode(parent)?;
        let block_size = self.geometry.block_size as u64;
        let size = parent_inode.size();
        if size > 0 {
            if let Some(block) = self.lookup_block(&parent_inode, size / block_size - 1)? {
                if insert_into_block(self.image.block_mut(block)?, child.into(), file_type, name)? {
                    return Ok(());
                }
            }
        }

        let mut buf = vec![0u8; block_size as usize];
        write_entry(&mut buf, 0, block_size as usize, child.into(), file_type, name)?;
        self.append(parent, &mut parent_inode, &buf)?;
        self.write_inode(parent, &parent_inode)
    }
}

// Implements test utility methods.
#[cfg(test)]
impl ExtFs {
    /// Lists the live entries of a directory in on-disk order.
    pub fn read_dir(&self, dir: InodeNum) -> Vec<(Vec<u8>, InodeNum, u8)> {
        let inode = self.read_inode(dir).unwrap();
        let block_size = self.geometry.block_size as u64;
        let mut entries = vec![];
        for i in 0..inode.size() / block_size {
            let block = self.lookup_block(&inode, i).unwrap().unwrap();
            for e in parse_block(self.image.block(block).unwrap()) {
                if e.inode != 0 {
                    entries.push((e.name, InodeNum(e.inode), e.file_type));
                }
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Metadata;
    use crate::fs::tests::new_fs;
    use crate::inode::InodeType;
    use crate::inode::LINK_MAX;
    use crate::inode::ROOT_INO;

    fn block_with(entries: &[(u32, &[u8])]) -> Vec<u8> {
        let mut block = vec![0u8; 1024];
        let (first, rest) = entries.split_first().unwrap();
        write_entry(&mut block, 0, 1024, first.0, 2, first.1).unwrap();
        for (inode, name) in rest {
            assert!(insert_into_block(&mut block, *inode, 1, name).unwrap());
        }
        block
    }

    #[test]
    fn test_rec_len() {
        assert_eq!(rec_len_for(1), 12);
        assert_eq!(rec_len_for(2), 12);
        assert_eq!(rec_len_for(4), 12);
        assert_eq!(rec_len_for(5), 16);
        assert_eq!(rec_len_for(255), 264);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name(b"a.txt").is_ok());
        assert!(validate_name(&[b'x'; 255]).is_ok());
        assert!(validate_name(b"").is_err());
        assert!(validate_name(&[b'x'; 256]).is_err());
        assert!(validate_name(b"a/b").is_err());
        assert!(validate_name(b"a\0b").is_err());
    }

    #[test]
    fn test_split_last_entry() {
        let block = block_with(&[(2, b"."), (2, b".."), (11, b"lost+found")]);
        let entries = parse_block(&block);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].rec_len, 12);
        assert_eq!(entries[1].rec_len, 12);
        assert_eq!(entries[2].rec_len, 1000);
        assert_eq!(entries[2].name, b"lost+found");
        assert_eq!(entries[2].inode, 11);
    }

    #[test]
    fn test_reuse_hole() {
        let mut block = block_with(&[(2, b"."), (2, b".."), (12, b"abcdefgh"), (13, b"z")]);
        // Turn the third entry into a hole.
        block[24..28].copy_from_slice(&[0; 4]);
        assert!(insert_into_block(&mut block, 14, 1, b"short").unwrap());
        let entries = parse_block(&block);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2].inode, 14);
        assert_eq!(entries[2].name, b"short");
        assert_eq!(entries[2].rec_len, 16);
    }

    #[test]
    fn test_block_full() {
        let mut block = block_with(&[(2, b"."), (2, b"..")]);
        let name = [b'n'; 200];
        let mut inserted = 0;
        while insert_into_block(&mut block, 20 + inserted, 1, &name).unwrap() {
            inserted += 1;
        }
        // 24 bytes for "." and "..", then 208 bytes per entry.
        assert_eq!(inserted, 4);
        let entries = parse_block(&block);
        assert_eq!(entries.len(), 6);
    }

    #[test]
    fn test_add_entry_grows_directory() {
        let mut fs = new_fs(16384, 4096);
        let mut names = vec![];
        for i in 0..20 {
            let num = fs.allocate_inode().unwrap();
            fs.init_inode(num, InodeType::Regular, &Metadata::with_mode(0o644)).unwrap();
            let name = format!("{i:0>100}").into_bytes();
            fs.add_entry(ROOT_INO, num, &name).unwrap();
            assert_eq!(fs.read_inode(num).unwrap().links_count.get(), 1);
            names.push((name, num));
        }

        let root = fs.read_inode(ROOT_INO).unwrap();
        assert!(root.size() > 1024);
        assert_eq!(root.size() % 1024, 0);
        assert_eq!(root.blocks.get() as u64, root.size() / 512);

        let entries = fs.read_dir(ROOT_INO);
        assert_eq!(&entries[0].0, b".");
        assert_eq!(&entries[1].0, b"..");
        assert_eq!(&entries[2].0, b"lost+found");
        for (i, (name, num)) in names.iter().enumerate() {
            assert_eq!(&entries[3 + i].0, name);
            assert_eq!(entries[3 + i].1, *num);
            assert_eq!(entries[3 + i].2, 1);
        }
    }

    #[test]
    fn test_add_entry_rejects_bad_name() {
        let mut fs = new_fs(16384, 4096);
        let num = fs.allocate_inode().unwrap();
        fs.init_inode(num, InodeType::Regular, &Metadata::with_mode(0o644)).unwrap();
        assert!(matches!(
            fs.add_entry(ROOT_INO, num, b"a/b"),
            Err(Error::InvalidEntry(_))
        ));
        assert_eq!(fs.read_inode(num).unwrap().links_count.get(), 0);
    }

    #[test]
    fn test_add_entry_link_limit() {
        let mut fs = new_fs(16384, 4096);
        let mut root = fs.read_inode(ROOT_INO).unwrap();
        let size = root.size();
        root.links_count.set(LINK_MAX);
        fs.write_inode(ROOT_INO, &root).unwrap();

        // A subdirectory's `..` would add one more link to the root.
        let err = fs
            .add_directory(ROOT_INO, b"sub", &Metadata::with_mode(0o755))
            .unwrap_err();
        match err {
            Error::InvalidEntry(msg) => assert!(msg.contains("\"..\""), "{msg}"),
            e => panic!("unexpected error: {e}"),
        }
        let root = fs.read_inode(ROOT_INO).unwrap();
        assert_eq!(root.links_count.get(), LINK_MAX);
        assert_eq!(root.size(), size);
    }
}
