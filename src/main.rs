// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command line tool creating an ext2, ext3 or ext4 image from a directory.

use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use argh::FromArgs;
use extfs::Builder;
use extfs::DevNode;
use extfs::Entry;
use extfs::EntryTree;
use extfs::FsVersion;
use extfs::Metadata;
use log::info;

#[derive(FromArgs)]
/// Create an ext2, ext3 or ext4 filesystem image.
struct Args {
    /// path of the image to create
    #[argh(positional)]
    image: PathBuf,

    /// filesystem type: ext2, ext3 or ext4
    #[argh(option, short = 't', default = "FsVersion::Ext2")]
    fstype: FsVersion,

    /// size of the image in bytes. K, M and G suffixes are accepted.
    #[argh(option, short = 's', from_str_fn(parse_size))]
    size: u64,

    /// directory whose contents are copied into the image
    #[argh(option, short = 'd')]
    source: Option<PathBuf>,

    /// device node to create, in a form of <name>:<mode>:<uid>:<gid>:<c|b>:<major>:<minor>
    #[argh(option)]
    devnode: Vec<DevNode>,

    /// number of bytes per inode
    #[argh(option, short = 'i', default = "4096")]
    inode_ratio: u64,

    /// number of inodes, overriding --inode-ratio
    #[argh(option, short = 'N')]
    inodes: Option<u64>,

    /// percentage of blocks reserved for the super user
    #[argh(option, short = 'm', default = "5")]
    reserved_ratio: u8,

    /// size of the journal in blocks
    #[argh(option, short = 'J', default = "1024")]
    journal_blocks: u32,

    /// use 64-byte group descriptors (ext4 only)
    #[argh(switch)]
    wide_descriptors: bool,

    /// creation time in seconds since the epoch, for reproducible images
    #[argh(option)]
    timestamp: Option<u32>,

    /// print debug messages
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// print errors only
    #[argh(switch, short = 'q')]
    quiet: bool,
}

fn parse_size(value: &str) -> std::result::Result<u64, String> {
    let (digits, shift) = match value.char_indices().last() {
        Some((i, 'k' | 'K')) => (&value[..i], 10),
        Some((i, 'm' | 'M')) => (&value[..i], 20),
        Some((i, 'g' | 'G')) => (&value[..i], 30),
        _ => (value, 0),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(1 << shift))
        .ok_or_else(|| format!("invalid size {value:?}"))
}

/// Inserts `path` and its missing ancestors as plain directories.
fn ensure_dir(tree: &mut EntryTree, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || tree.get(path).is_some() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        ensure_dir(tree, parent)?;
    }
    tree.insert(Entry::directory(path, Metadata::with_mode(0o755)))
        .with_context(|| format!("failed to create directory {}", path.display()))
}

fn build_tree(args: &Args) -> Result<EntryTree> {
    let mut tree = match &args.source {
        Some(dir) => EntryTree::from_host_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?,
        None => EntryTree::new(),
    };
    for node in &args.devnode {
        if let Some(parent) = node.path.parent() {
            ensure_dir(&mut tree, parent)?;
        }
        tree.insert(Entry::from(node.clone()))
            .with_context(|| format!("failed to add device node {}", node.path.display()))?;
    }
    Ok(tree)
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    if args.verbose && args.quiet {
        bail!("--verbose and --quiet are mutually exclusive");
    }
    let level = if args.verbose {
        log::LevelFilter::Debug
    } else if args.quiet {
        log::LevelFilter::Error
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter(None, level)
        .init();

    let tree = build_tree(&args)?;
    let builder = Builder {
        size: args.size,
        version: args.fstype,
        inode_ratio: args.inode_ratio,
        reserved_ratio: args.reserved_ratio,
        inode_count: args.inodes,
        journal_blocks: args.journal_blocks,
        wide_descriptors: args.wide_descriptors,
        timestamp: args.timestamp,
        ..Default::default()
    };
    builder
        .build_to_file(&tree, &args.image)
        .with_context(|| format!("failed to create {}", args.image.display()))?;
    info!("created {} image {}", args.fstype, args.image.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("64M").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("12T").is_err());
        assert!(parse_size("99999999999999G").is_err());
    }

    #[test]
    fn test_devnode_parents() {
        let args: Args = Args::from_args(
            &["mkextfs"],
            &[
                "disk.img",
                "--size",
                "4M",
                "--devnode",
                "dev/input/event0:660:0:0:c:13:64",
            ],
        )
        .unwrap();
        assert_eq!(args.fstype, FsVersion::Ext2);
        let tree = build_tree(&args).unwrap();
        assert!(tree.get("dev").is_some());
        assert!(tree.get("dev/input").is_some());
        assert!(tree.get("dev/input/event0").is_some());
    }
}
