// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Appends data to the end of an inode.

use std::io::ErrorKind;
use std::io::Read;

use crate::error::Result;
use crate::fs::ExtFs;
use crate::inode::Inode;
use crate::inode::InodeNum;

/// Number of blocks read from a content source at once.
const READ_CHUNK_BLOCKS: usize = 64;

impl ExtFs {
    /// Appends `data` to inode `num`. The unused tail of the last block is filled first, then new
    /// blocks are mapped through the indirect pointers. The size of `inode` grows accordingly.
    pub(crate) fn append(&mut self, num: InodeNum, inode: &mut Inode, data: &[u8]) -> Result<()> {
        let block_size = self.geometry.block_size as u64;
        let mut data = data;
        while !data.is_empty() {
            let size = inode.size();
            let offset = (size % block_size) as usize;
            let block = self.block_for_index(num, inode, size / block_size)?;
            let len = data.len().min(block_size as usize - offset);
            let start = self.image.block_offset(block) + offset;
            self.image.write(start, &data[..len])?;
            inode.set_size(size + len as u64)?;
            data = &data[len..];
        }
        Ok(())
    }

    /// Streams everything `reader` yields to the end of inode `num` and returns the number of
    /// bytes written.
    pub(crate) fn append_from<R: Read>(
        &mut self,
        num: InodeNum,
        inode: &mut Inode,
        mut reader: R,
    ) -> Result<u64> {
        let mut buf = vec![0u8; self.geometry.block_size as usize * READ_CHUNK_BLOCKS];
        let mut written = 0;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.append(num, inode, &buf[..n])?;
            written += n as u64;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::FromZeros;

    use super::*;
    use crate::fs::tests::new_fs;
    use crate::inode::InodeType;

    fn regular_inode() -> Inode {
        let mut inode = Inode::new_zeroed();
        inode.set_mode(InodeType::Regular, 0o644);
        inode
    }

    fn read_back(fs: &ExtFs, inode: &Inode) -> Vec<u8> {
        let block_size = fs.geometry.block_size as u64;
        let mut out = vec![];
        for i in 0..inode.size().div_ceil(block_size) {
            let block = fs.lookup_block(inode, i).unwrap().unwrap();
            out.extend_from_slice(fs.image.block(block).unwrap());
        }
        out.truncate(inode.size() as usize);
        out
    }

    #[test]
    fn test_append_fills_tail_first() {
        let mut fs = new_fs(16384, 4096);
        let num = fs.allocate_inode().unwrap();
        let mut inode = regular_inode();

        fs.append(num, &mut inode, &[1; 1000]).unwrap();
        assert_eq!(inode.size(), 1000);
        assert_eq!(inode.blocks.get(), 2);

        fs.append(num, &mut inode, &[2; 100]).unwrap();
        assert_eq!(inode.size(), 1100);
        assert_eq!(inode.blocks.get(), 4);

        let data = read_back(&fs, &inode);
        assert!(data[..1000].iter().all(|&b| b == 1));
        assert!(data[1000..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_append_through_indirect_block() {
        let mut fs = new_fs(16384, 4096);
        let num = fs.allocate_inode().unwrap();
        let mut inode = regular_inode();
        let data: Vec<u8> = (0..20 * 1024).map(|i| (i % 251) as u8).collect();

        let written = fs.append_from(num, &mut inode, data.as_slice()).unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(inode.size(), data.len() as u64);
        // 20 data blocks plus the singly indirect table.
        assert_eq!(inode.blocks.get(), 21 * 2);
        assert_ne!(inode.block[12].get(), 0);
        assert_eq!(inode.block[13].get(), 0);
        assert_eq!(read_back(&fs, &inode), data);
    }

    #[test]
    fn test_append_empty() {
        let mut fs = new_fs(16384, 4096);
        let num = fs.allocate_inode().unwrap();
        let mut inode = regular_inode();
        assert_eq!(fs.append_from(num, &mut inode, std::io::empty()).unwrap(), 0);
        assert_eq!(inode.blocks.get(), 0);
        assert_eq!(inode.size(), 0);
    }
}
