// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate builds ext2/ext3/ext4 filesystem images in memory, without the help of a kernel
//! driver or an external formatter.
//!
//! Only classic indirect block maps are produced (no extents), the block size is 1024 bytes and
//! backup superblocks are written into every block group.

#![cfg(unix)]
#![deny(missing_docs)]

mod alloc;
mod bitmap;
mod blockgroup;
mod builder;
mod content;
mod dir;
mod entry;
mod error;
mod fs;
mod geometry;
mod image;
mod indirect;
mod inode;
mod journal;
mod superblock;

pub use builder::Builder;
pub use builder::FsVersion;
pub use entry::DevNode;
pub use entry::DeviceKind;
pub use entry::Entry;
pub use entry::EntryData;
pub use entry::EntryTree;
pub use entry::FileSource;
pub use entry::Metadata;
pub use error::Error;
pub use error::Result;
pub use geometry::Geometry;
pub use geometry::GeometryParams;
pub use inode::InodeNum;
