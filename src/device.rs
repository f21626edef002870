// SPDX-License-Identifier: Apache-2.0

//! Test-friendly capability for interacting with the physical partitions that
//! back a super partition. The metadata reader only ever talks to storage
//! through [`PartitionOpener`], never to a concrete backend.

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use crate::stream::ReadSeek;

/// Geometry hints for a named physical partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    /// Size of the block device, in bytes.
    pub size: u64,
    /// Optimal target alignment, in bytes. This is 0 or a multiple of 512.
    pub alignment: u32,
    /// Alignment offset to the parent device (if any), in bytes. This is 0 or
    /// a multiple of 512.
    pub alignment_offset: u32,
    /// Block size for aligning extent and partition sizes.
    pub logical_block_size: u32,
}

pub trait PartitionOpener {
    /// Open the named physical partition for reading. The name can be an
    /// absolute path if the full path is already known.
    fn open(&self, partition_name: &str) -> io::Result<Box<dyn ReadSeek>>;

    /// Query geometry hints for the named physical partition.
    fn get_info(&self, partition_name: &str) -> io::Result<BlockDeviceInfo>;

    /// Return a path that can be used to pass the block device to
    /// device-mapper. This is either an absolute path or a `major:minor`
    /// device sequence.
    fn device_string(&self, partition_name: &str) -> String;
}

/// A [`PartitionOpener`] that opens named partitions as plain files. Relative
/// names are resolved against a base directory, like `/dev/block/by-name` on
/// a device or an image directory on a workstation.
#[derive(Clone, Debug)]
pub struct LocalPartitionOpener {
    base: PathBuf,
}

impl LocalPartitionOpener {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn resolve(&self, partition_name: &str) -> PathBuf {
        let path = Path::new(partition_name);

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        }
    }
}

impl PartitionOpener for LocalPartitionOpener {
    fn open(&self, partition_name: &str) -> io::Result<Box<dyn ReadSeek>> {
        let file = File::open(self.resolve(partition_name))?;

        Ok(Box::new(file))
    }

    fn get_info(&self, partition_name: &str) -> io::Result<BlockDeviceInfo> {
        let metadata = fs::metadata(self.resolve(partition_name))?;

        // Plain files carry no alignment hints.
        Ok(BlockDeviceInfo {
            size: metadata.len(),
            ..Default::default()
        })
    }

    fn device_string(&self, partition_name: &str) -> String {
        self.resolve(partition_name).to_string_lossy().into_owned()
    }
}
