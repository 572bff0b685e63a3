// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Errors reported while building a filesystem image.

use std::io;

use remain::sorted;
use thiserror::Error as ThisError;

/// Any failure aborts the whole build. The partially written image must be discarded.
#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// The build parameters are invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The requested counts cannot be laid out in the requested size.
    #[error("invalid geometry: {0}")]
    Geometry(String),
    /// An access went past the end of the image buffer.
    #[error("access beyond the end of the image: offset={offset} len={len}")]
    ImageOverflow {
        /// Byte offset of the access.
        offset: usize,
        /// Length of the access.
        len: usize,
    },
    /// A group claims free resources but its bitmap is full.
    #[error("{kind} bitmap of group {group} is full but its free count is not zero")]
    InconsistentBitmap {
        /// Either "block" or "inode".
        kind: &'static str,
        /// Index of the block group.
        group: usize,
    },
    /// The logical block index cannot be addressed with triple indirection.
    #[error("invalid inode block index: {0}")]
    InvalidBlockIndex(u64),
    /// The entry tree contains something that cannot be stored.
    #[error("invalid entry: {0}")]
    InvalidEntry(String),
    /// Reading content or writing the image failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// All block groups are out of blocks or inodes.
    #[error("out of space: {0}")]
    OutOfSpace(String),
}

/// Result type used across this crate.
pub type Result<T> = std::result::Result<T, Error>;
