// SPDX-License-Identifier: Apache-2.0

//! Parser for the Android logical partition (LP) metadata stored at the
//! beginning of a super partition.
//!
//! The on-disk format is: 4096 reserved bytes (to avoid creating an
//! accidental boot sector), two copies of the geometry block, and then the
//! primary and backup metadata slots. Every structure is validated before it
//! is exposed; a caller either gets a fully checked [`Metadata`] or an error.

use std::{
    collections::HashSet,
    fmt, io,
    io::{Read, Seek, SeekFrom, Write},
    mem,
    num::NonZeroU64,
    str,
    sync::atomic::AtomicBool,
};

use bitflags::bitflags;
use bstr::ByteSlice;
use thiserror::Error;
use tracing::{debug, warn};
use zerocopy::{FromBytes, FromZeros, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    device::PartitionOpener,
    stream::{self, ReadFixedSizeExt},
    util::{DebugString, is_zero},
};

/// Magic value for [`RawGeometry::magic`].
const GEOMETRY_MAGIC: u32 = 0x616c4467;

/// Padded size for storing a [`RawGeometry`].
pub const GEOMETRY_SIZE: u32 = 4096;

/// Magic value for [`RawHeader::magic`].
const HEADER_MAGIC: u32 = 0x414C5030;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 10;
/// Minimum supported minor version (inclusive).
pub const MINOR_VERSION_MIN: u16 = 0;
/// Maximum supported minor version (inclusive).
pub const MINOR_VERSION_MAX: u16 = 2;

/// Minor version required for using [`PartitionAttributes::UPDATED`].
const VERSION_FOR_UPDATED_ATTR: u16 = 1;
/// Minor version needed for the 256-byte [`RawHeader`] instead of the
/// 128-byte header without [`RawHeader::flags`] and [`RawHeader::reserved`].
const VERSION_FOR_EXPANDED_HEADER: u16 = 2;

/// Size of a sector.
pub const SECTOR_SIZE: u32 = 512;

/// Padding at the beginning of a super image to avoid creating a boot sector.
pub const PARTITION_RESERVED_BYTES: u32 = 4096;

/// Maximum length of a name stored in a 36-byte name field. The last byte is
/// reserved for the NUL terminator.
const MAX_NAME_LEN: usize = 35;

/// The kind of failure an [`Error`] represents. Callers that need to branch
/// on the class of failure should match on this instead of on individual
/// variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Structural mismatch: magic, size, bounds, alignment, or name issues.
    Format,
    /// Checksum mismatch.
    Integrity,
    /// Index, attribute, or overlap violations.
    Logic,
    /// Version too new or an extent layout this crate does not handle.
    Unsupported,
    /// A named partition is absent.
    NotFound,
    /// Passthrough I/O failure from the device.
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    // Naming errors.
    #[error("Invalid partition name: {0:?}")]
    NameInvalid(DebugString),
    #[error("Duplicate partition name: {0:?}")]
    NameDuplicate(DebugString),
    #[error("Name {name:?} with suffix {suffix:?} exceeds {MAX_NAME_LEN} characters")]
    NameSuffixTooLong {
        name: DebugString,
        suffix: &'static str,
    },
    // Geometry errors.
    #[error("Invalid geometry magic: {0:#010x}")]
    GeometryInvalidMagic(u32),
    #[error("Geometry has unrecognized fields: {0} > {size}", size = mem::size_of::<RawGeometry>())]
    GeometryTooLarge(u32),
    #[error("Invalid geometry size: {0} != {size}", size = mem::size_of::<RawGeometry>())]
    GeometryInvalidSize(u32),
    #[error("Expected geometry digest {expected}, but have {actual}")]
    GeometryInvalidDigest { expected: String, actual: String },
    #[error("No metadata slots defined")]
    NoMetadataSlots,
    #[error("Maximum metadata size is not sector-aligned: {0}")]
    MaxMetadataSizeUnaligned(u32),
    #[error("Logical block size is not sector-aligned: {0}")]
    LogicalBlockSizeUnaligned(u32),
    // Header errors.
    #[error("Invalid header magic: {0:#010x}")]
    HeaderInvalidMagic(u32),
    #[error("Unsupported header version: {major}.{minor}")]
    HeaderUnsupportedVersion { major: u16, minor: u16 },
    #[error("Invalid header size: {0} != {1}")]
    HeaderInvalidSize(u32, u32),
    #[error("Expected header digest {expected}, but have {actual}")]
    HeaderInvalidDigest { expected: String, actual: String },
    #[error("Tables size exceeds maximum metadata size: {tables_size} > {max_size}")]
    TablesTooLarge { tables_size: u32, max_size: u32 },
    #[error("Expected tables digest {expected}, but have {actual}")]
    TablesInvalidDigest { expected: String, actual: String },
    // Table descriptor errors.
    #[error("{name} table is out of bounds")]
    TableOutOfBounds { name: &'static str },
    #[error("{name} table has invalid entry size: {entry_size}")]
    TableInvalidEntrySize { name: &'static str, entry_size: u32 },
    #[error("{name} table entry #{index} is truncated")]
    TableEntryTruncated { name: &'static str, index: usize },
    // Partition errors.
    #[error("Partition {name:?}: Invalid attributes: {attributes:?}")]
    PartitionInvalidAttributes {
        name: DebugString,
        attributes: PartitionAttributes,
    },
    #[error("Partition {name:?}: Invalid extent range: {first} + {count}")]
    PartitionInvalidExtentRange {
        name: DebugString,
        first: u32,
        count: u32,
    },
    #[error("Partition {name:?}: Invalid partition group index: {index}")]
    PartitionInvalidGroupIndex { name: DebugString, index: u32 },
    #[error("Partition {name:?}: Size in bytes is too large")]
    PartitionSizeTooLarge { name: DebugString },
    // Extent errors.
    #[error("Extent #{index}: Invalid target type: {target_type}")]
    ExtentInvalidType { index: usize, target_type: u32 },
    #[error("Extent #{index}: Type zero extents cannot have non-zero sector or device")]
    ExtentTypeZeroNotEmpty { index: usize },
    #[error("Extent #{index}: Invalid block device index: {device_index}")]
    ExtentInvalidDeviceIndex { index: usize, device_index: u32 },
    // Block device errors.
    #[error("Metadata does not specify a super device")]
    NoSuperDevice,
    #[error("Metadata region ({metadata_region} bytes) overlaps logical partition contents (first sector {first_logical_sector})")]
    MetadataOverlapsPartitions {
        metadata_region: u64,
        first_logical_sector: u64,
    },
    // Slot selection errors.
    #[error("Invalid metadata slot number: {slot} >= {slot_count}")]
    InvalidSlotNumber { slot: u32, slot_count: u32 },
    #[error("Slot {slot} has no slot suffix; only slots 0 and 1 can be suffixed")]
    SlotNotSuffixable { slot: u32 },
    #[error(
        "Metadata for slot {slot} is unreadable at primary offset {primary_offset} and backup offset {backup_offset}"
    )]
    MetadataUnreadable {
        slot: u32,
        primary_offset: u64,
        backup_offset: u64,
        #[source]
        source: Box<Error>,
    },
    // Extraction errors.
    #[error("Partition not found: {0:?}")]
    PartitionNotFound(String),
    #[error("Partition {name:?}: Extent #{index}: Unsupported non-linear target type")]
    UnsupportedTargetType { name: String, index: usize },
    #[error("Partition {name:?}: Extent #{index}: Split super devices are not supported")]
    SplitSuperNotSupported { name: String, index: usize },
    #[error("Partition {name:?}: Extent #{index}: Extent is not block-aligned")]
    ExtentNotBlockAligned { name: String, index: usize },
    #[error("Partition {name:?}: Extent #{index}: Byte offset too large")]
    ExtentOffsetTooLarge { name: String, index: usize },
    // Wrapped errors.
    #[error("Failed to read LP data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to copy LP data: {0}")]
    DataCopy(&'static str, #[source] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NameInvalid(_)
            | Self::NameDuplicate(_)
            | Self::NameSuffixTooLong { .. }
            | Self::GeometryInvalidMagic(_)
            | Self::GeometryTooLarge(_)
            | Self::GeometryInvalidSize(_)
            | Self::NoMetadataSlots
            | Self::MaxMetadataSizeUnaligned(_)
            | Self::LogicalBlockSizeUnaligned(_)
            | Self::HeaderInvalidMagic(_)
            | Self::HeaderInvalidSize(..)
            | Self::TablesTooLarge { .. }
            | Self::TableOutOfBounds { .. }
            | Self::TableInvalidEntrySize { .. }
            | Self::TableEntryTruncated { .. }
            | Self::ExtentInvalidType { .. }
            | Self::ExtentNotBlockAligned { .. }
            | Self::ExtentOffsetTooLarge { .. } => ErrorKind::Format,
            Self::GeometryInvalidDigest { .. }
            | Self::HeaderInvalidDigest { .. }
            | Self::TablesInvalidDigest { .. } => ErrorKind::Integrity,
            Self::PartitionInvalidAttributes { .. }
            | Self::PartitionInvalidExtentRange { .. }
            | Self::PartitionInvalidGroupIndex { .. }
            | Self::PartitionSizeTooLarge { .. }
            | Self::ExtentTypeZeroNotEmpty { .. }
            | Self::ExtentInvalidDeviceIndex { .. }
            | Self::NoSuperDevice
            | Self::MetadataOverlapsPartitions { .. }
            | Self::InvalidSlotNumber { .. }
            | Self::SlotNotSuffixable { .. } => ErrorKind::Logic,
            Self::HeaderUnsupportedVersion { .. }
            | Self::UnsupportedTargetType { .. }
            | Self::SplitSuperNotSupported { .. } => ErrorKind::Unsupported,
            Self::PartitionNotFound(_) => ErrorKind::NotFound,
            Self::MetadataUnreadable { source, .. } => source.kind(),
            Self::DataRead(..) | Self::DataCopy(..) => ErrorKind::Io,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// The device uses virtual A/B.
        const VIRTUAL_AB_DEVICE = 1 << 0;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PartitionAttributes: u32 {
        /// The partition should not be considered writable.
        const READONLY = 1 << 0;
        /// The partition name needs a slot suffix appended. Only used on
        /// retrofit devices; cleared by slot normalization.
        const SLOT_SUFFIXED = 1 << 1;
        /// The partition was created or modified for a snapshot-based update.
        const UPDATED = 1 << 2;
        /// The partition is disabled and should not be used or mapped.
        const DISABLED = 1 << 3;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PartitionGroupFlags: u32 {
        /// Whether the group name needs a slot suffix to be appended.
        const SLOT_SUFFIXED = 1 << 0;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BlockDeviceFlags: u32 {
        /// Whether the partition name needs a slot suffix to be appended.
        const SLOT_SUFFIXED = 1 << 0;

        const _ = !0;
    }
}

impl PartitionAttributes {
    /// Attributes introduced in metadata minor version 0.
    pub const MASK_V0: Self = Self::READONLY.union(Self::SLOT_SUFFIXED);
    /// Attributes introduced in metadata minor version 1.
    pub const MASK_V1: Self = Self::UPDATED.union(Self::DISABLED);
}

fn sha256(data: &[u8]) -> ring::digest::Digest {
    ring::digest::digest(&ring::digest::SHA256, data)
}

/// Raw on-disk layout for the metadata geometry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawGeometry {
    /// Magic value. This should be equal to [`GEOMETRY_MAGIC`].
    magic: little_endian::U32,
    /// Size of this [`RawGeometry`].
    struct_size: little_endian::U32,
    /// SHA-256 checksum of this [`RawGeometry`] when this field is set to all
    /// zeros.
    checksum: [u8; 32],
    /// Maximum size of a single copy of the metadata (header + tables). This
    /// must be a multiple of [`SECTOR_SIZE`].
    metadata_max_size: little_endian::U32,
    /// Number of metadata slots, excluding the backup copies.
    metadata_slot_count: little_endian::U32,
    /// Block device block size for the logical partitions. This must be a
    /// multiple of [`SECTOR_SIZE`].
    logical_block_size: little_endian::U32,
}

const _: () = assert!(mem::size_of::<RawGeometry>() < GEOMETRY_SIZE as usize);

impl fmt::Debug for RawGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawGeometry")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("struct_size", &self.struct_size.get())
            .field("checksum", &hex::encode(self.checksum))
            .field("metadata_max_size", &self.metadata_max_size.get())
            .field("metadata_slot_count", &self.metadata_slot_count.get())
            .field("logical_block_size", &self.logical_block_size.get())
            .finish()
    }
}

impl RawGeometry {
    /// Ensure that all fields are semantically valid and can be used without
    /// further checks.
    fn validate(&self) -> Result<()> {
        if self.magic.get() != GEOMETRY_MAGIC {
            return Err(Error::GeometryInvalidMagic(self.magic.get()));
        }

        // The bound check comes first so that the checksum can be computed
        // over |struct_size| bytes of a newer, larger geometry without
        // reading out of bounds. The exact size check afterwards rejects
        // format drift outright.
        if self.struct_size.get() > mem::size_of::<Self>() as u32 {
            return Err(Error::GeometryTooLarge(self.struct_size.get()));
        }

        let mut copy = *self;
        copy.checksum.fill(0);

        let digest = sha256(&copy.as_bytes()[..self.struct_size.get() as usize]);
        if digest.as_ref() != self.checksum {
            return Err(Error::GeometryInvalidDigest {
                expected: hex::encode(self.checksum),
                actual: hex::encode(digest),
            });
        }

        if self.struct_size.get() != mem::size_of::<Self>() as u32 {
            return Err(Error::GeometryInvalidSize(self.struct_size.get()));
        }

        if self.metadata_slot_count.get() == 0 {
            return Err(Error::NoMetadataSlots);
        }

        if self.metadata_max_size.get() == 0 || self.metadata_max_size.get() % SECTOR_SIZE != 0 {
            return Err(Error::MaxMetadataSizeUnaligned(
                self.metadata_max_size.get(),
            ));
        }

        if self.logical_block_size.get() == 0 || self.logical_block_size.get() % SECTOR_SIZE != 0 {
            return Err(Error::LogicalBlockSizeUnaligned(
                self.logical_block_size.get(),
            ));
        }

        Ok(())
    }
}

/// Raw on-disk layout for a table descriptor within a [`RawHeader`].
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawTableDescriptor {
    /// Offset relative to the end of the [`RawHeader`].
    offset: little_endian::U32,
    /// Number of entries in the table.
    num_entries: little_endian::U32,
    /// Size of each entry.
    entry_size: little_endian::U32,
}

/// Raw on-disk layout for the metadata header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version. [`MAJOR_VERSION`] is the only version supported. All
    /// other versions cannot be parsed.
    major_version: little_endian::U16,
    /// Minor version. Versions between [`MINOR_VERSION_MIN`] and
    /// [`MINOR_VERSION_MAX`] are supported.
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`].
    header_size: little_endian::U32,
    /// SHA-256 checksum of the first [`RawHeader::header_size`] bytes of this
    /// struct when this field is set to all zeros.
    header_checksum: [u8; 32],
    /// Size of all tables.
    tables_size: little_endian::U32,
    /// SHA-256 checksum of all tables.
    tables_checksum: [u8; 32],
    /// Partition table descriptor.
    partitions: RawTableDescriptor,
    /// Extent table descriptor.
    extents: RawTableDescriptor,
    /// Updatable group descriptor.
    groups: RawTableDescriptor,
    /// Block device table descriptor.
    block_devices: RawTableDescriptor,
    /// [Minor version >=2 only] Header flags. These are informational and do
    /// not affect parsing.
    flags: little_endian::U32,
    /// [Minor version >=2 only] Reserved bytes for future header versions.
    reserved: [u8; 124],
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("header_size", &self.header_size.get())
            .field("header_checksum", &hex::encode(self.header_checksum))
            .field("tables_size", &self.tables_size.get())
            .field("tables_checksum", &hex::encode(self.tables_checksum))
            .field("partitions", &self.partitions)
            .field("extents", &self.extents)
            .field("groups", &self.groups)
            .field("block_devices", &self.block_devices)
            .field("flags", &HeaderFlags::from_bits_retain(self.flags.get()))
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl RawHeader {
    const SIZE_V1_0: usize = mem::offset_of!(Self, flags);

    fn size_for_version(minor_version: u16) -> usize {
        if minor_version >= VERSION_FOR_EXPANDED_HEADER {
            mem::size_of::<Self>()
        } else {
            Self::SIZE_V1_0
        }
    }

    /// Validate everything that can be checked before the trailing expanded
    /// fields have been read: magic, version compatibility, and the header
    /// size expected for this minor version.
    fn validate_prefix(&self) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Error::HeaderInvalidMagic(self.magic.get()));
        }

        if self.major_version.get() != MAJOR_VERSION || self.minor_version.get() > MINOR_VERSION_MAX
        {
            return Err(Error::HeaderUnsupportedVersion {
                major: self.major_version.get(),
                minor: self.minor_version.get(),
            });
        }

        let expected_size = Self::size_for_version(self.minor_version.get()) as u32;

        if self.header_size.get() != expected_size {
            return Err(Error::HeaderInvalidSize(self.header_size.get(), expected_size));
        }

        Ok(())
    }

    /// The header checksum covers exactly [`RawHeader::header_size`] bytes,
    /// computed as if the checksum field were zero. [`RawHeader::validate_prefix`]
    /// must have passed before this function is called.
    fn validate_checksum(&self) -> Result<()> {
        let mut copy = *self;
        copy.header_checksum.fill(0);

        let portion = &copy.as_bytes()[..self.header_size.get() as usize];

        let digest = sha256(portion);
        if digest.as_ref() != self.header_checksum {
            return Err(Error::HeaderInvalidDigest {
                expected: hex::encode(self.header_checksum),
                actual: hex::encode(digest),
            });
        }

        Ok(())
    }

    /// Check that a table lies entirely within [`RawHeader::tables_size`].
    /// All arithmetic is done in u64 so that hostile descriptor values cannot
    /// overflow.
    fn validate_table_bounds(
        &self,
        descriptor: &RawTableDescriptor,
        name: &'static str,
    ) -> Result<()> {
        let tables_size = u64::from(self.tables_size.get());
        let offset = u64::from(descriptor.offset.get());

        if offset > tables_size {
            return Err(Error::TableOutOfBounds { name });
        }

        let table_size =
            u64::from(descriptor.num_entries.get()) * u64::from(descriptor.entry_size.get());

        if tables_size - offset < table_size {
            return Err(Error::TableOutOfBounds { name });
        }

        Ok(())
    }

    /// Ensure the table descriptors are in bounds and that the fixed-size
    /// tables have the entry sizes this parser was compiled for. The block
    /// device table's entry size is deliberately not constrained here.
    fn validate_tables(&self) -> Result<()> {
        for (descriptor, name) in [
            (&self.partitions, "partition"),
            (&self.extents, "extent"),
            (&self.groups, "partition group"),
            (&self.block_devices, "block device"),
        ] {
            self.validate_table_bounds(descriptor, name)?;
        }

        for (descriptor, name, entry_size) in [
            (&self.partitions, "partition", mem::size_of::<RawPartition>()),
            (&self.extents, "extent", mem::size_of::<RawExtent>()),
            (
                &self.groups,
                "partition group",
                mem::size_of::<RawPartitionGroup>(),
            ),
        ] {
            if descriptor.entry_size.get() != entry_size as u32 {
                return Err(Error::TableInvalidEntrySize {
                    name,
                    entry_size: descriptor.entry_size.get(),
                });
            }
        }

        Ok(())
    }
}

/// A potentially invalid raw partition name string.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct PartitionName([u8; 36]);

impl fmt::Debug for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prefix, suffix) = self.split();
        let display = if is_zero(suffix) { prefix } else { &self.0 };

        fmt::Debug::fmt(&display.as_bstr(), f)
    }
}

impl PartitionName {
    fn split(&self) -> (&[u8], &[u8]) {
        self.0
            .iter()
            .position(|b| *b == 0)
            .map_or((&self.0[..], &[][..]), |i| self.0.split_at(i))
    }

    fn validate(&self) -> Result<()> {
        let (prefix, suffix) = self.split();

        // AOSP liblp's metadata_format.h says "Characters may only be
        // alphanumeric or _", but AOSP creates partitions named like
        // "system_b-cow".
        let prefix_valid = prefix
            .iter()
            .all(|b| matches!(*b, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-'));

        if prefix_valid && is_zero(suffix) {
            Ok(())
        } else {
            Err(Error::NameInvalid(DebugString::new(self)))
        }
    }

    fn as_str(&self) -> Result<&str> {
        self.validate()?;

        // ASCII is always UTF-8.
        Ok(str::from_utf8(self.split().0).unwrap())
    }
}

/// Raw on-disk layout for an entry in the logical partitions table.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPartition {
    /// Partition name in ASCII. This must be unique across all partitions.
    name: PartitionName,
    /// Partition attributes.
    attributes: little_endian::U32,
    /// Index of the first extent owned by this partition.
    first_extent_index: little_endian::U32,
    /// Number of extents covered by this partition.
    num_extents: little_endian::U32,
    /// Index of the group containing this partition.
    group_index: little_endian::U32,
}

impl RawPartition {
    /// Ensure that all index and attribute fields are semantically valid.
    /// [`RawHeader::validate_tables`] must have passed before this function
    /// is called.
    fn validate(
        &self,
        header: &RawHeader,
        num_extents: usize,
        num_groups: usize,
    ) -> Result<()> {
        self.name.validate()?;

        let mut valid_attributes = PartitionAttributes::MASK_V0;
        if header.minor_version.get() >= VERSION_FOR_UPDATED_ATTR {
            valid_attributes |= PartitionAttributes::MASK_V1;
        }

        let attributes = PartitionAttributes::from_bits_retain(self.attributes.get());

        if !(attributes - valid_attributes).is_empty() {
            return Err(Error::PartitionInvalidAttributes {
                name: DebugString::new(self.name),
                attributes,
            });
        }

        if self
            .first_extent_index
            .get()
            .checked_add(self.num_extents.get())
            .is_none_or(|n| n as usize > num_extents)
        {
            return Err(Error::PartitionInvalidExtentRange {
                name: DebugString::new(self.name),
                first: self.first_extent_index.get(),
                count: self.num_extents.get(),
            });
        }

        if self.group_index.get() as usize >= num_groups {
            return Err(Error::PartitionInvalidGroupIndex {
                name: DebugString::new(self.name),
                index: self.group_index.get(),
            });
        }

        Ok(())
    }
}

/// Raw on-disk layout for an entry in the extent table.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawExtent {
    /// Number of [`SECTOR_SIZE`]-byte sectors in this extent.
    num_sectors: little_endian::U64,
    /// device-mapper target type.
    target_type: little_endian::U32,
    /// For [`Self::TARGET_TYPE_LINEAR`], the physical partition sector that
    /// this extent maps to. For [`Self::TARGET_TYPE_ZERO`], always 0.
    target_data: little_endian::U64,
    /// For [`Self::TARGET_TYPE_LINEAR`], the index into the block devices
    /// table specifying the physical source of this extent. For
    /// [`Self::TARGET_TYPE_ZERO`], always 0.
    target_source: little_endian::U32,
}

impl RawExtent {
    /// dm-linear target.
    const TARGET_TYPE_LINEAR: u32 = 0;
    /// dm-zero target.
    const TARGET_TYPE_ZERO: u32 = 1;

    fn validate(&self, index: usize, num_block_devices: usize) -> Result<()> {
        match self.target_type.get() {
            Self::TARGET_TYPE_LINEAR => {
                if self.target_source.get() as usize >= num_block_devices {
                    return Err(Error::ExtentInvalidDeviceIndex {
                        index,
                        device_index: self.target_source.get(),
                    });
                }
            }
            Self::TARGET_TYPE_ZERO => {
                if self.target_data.get() != 0 || self.target_source.get() != 0 {
                    return Err(Error::ExtentTypeZeroNotEmpty { index });
                }
            }
            n => {
                return Err(Error::ExtentInvalidType {
                    index,
                    target_type: n,
                });
            }
        }

        Ok(())
    }
}

/// Raw on-disk layout for an entry in the partition groups table.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPartitionGroup {
    /// Partition group name in ASCII.
    name: PartitionName,
    /// Partition group flags.
    flags: little_endian::U32,
    /// Maximum size of all partitions in this group. If this is set to 0,
    /// then there is no size limit.
    maximum_size: little_endian::U64,
}

/// Raw on-disk layout for an entry in the block devices table.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawBlockDevice {
    /// The first [`SECTOR_SIZE`]-byte sector where actual data for the
    /// logical partitions can be allocated.
    first_logical_sector: little_endian::U64,
    /// Alignment for the partition start offset.
    alignment: little_endian::U32,
    /// Adjustment for when the super partition itself is not aligned.
    alignment_offset: little_endian::U32,
    /// Block device size.
    size: little_endian::U64,
    /// Partition name in ASCII.
    partition_name: PartitionName,
    /// Block device flags.
    flags: little_endian::U32,
}

/// Validated geometry for a super device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Maximum size of a single copy of the metadata (header + tables). This
    /// is a multiple of [`SECTOR_SIZE`].
    pub metadata_max_size: u32,
    /// Number of metadata slots, excluding the backup copies.
    pub metadata_slot_count: u32,
    /// Block device block size for the logical partitions. This is a
    /// multiple of [`SECTOR_SIZE`].
    pub logical_block_size: u32,
}

impl From<&RawGeometry> for Geometry {
    fn from(raw: &RawGeometry) -> Self {
        Self {
            metadata_max_size: raw.metadata_max_size.get(),
            metadata_slot_count: raw.metadata_slot_count.get(),
            logical_block_size: raw.logical_block_size.get(),
        }
    }
}

/// Validated metadata header. Table descriptors are a decoding detail and
/// are not exposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub major_version: u16,
    pub minor_version: u16,
    /// Informational flags. Zero for headers below minor version 2.
    pub flags: HeaderFlags,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Partition name in ASCII.
    pub name: String,
    /// Partition attributes.
    pub attributes: PartitionAttributes,
    /// Index of the first extent owned by this partition. Validated to be in
    /// bounds of [`Metadata::extents`].
    pub first_extent_index: u32,
    /// Number of extents covered by this partition.
    pub num_extents: u32,
    /// Index of the group containing this partition. Validated to be in
    /// bounds of [`Metadata::groups`].
    pub group_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentType {
    Linear {
        /// The physical sector that this extent starts at on the block
        /// device.
        start_sector: u64,
        /// The index of the block device that backs this extent. Validated
        /// to be in bounds of [`Metadata::block_devices`].
        block_device_index: u32,
    },
    Zero,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// Number of [`SECTOR_SIZE`]-byte sectors in this extent.
    pub num_sectors: u64,
    /// device-mapper target type.
    pub extent_type: ExtentType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionGroup {
    /// Partition group name in ASCII.
    pub name: String,
    /// Partition group flags.
    pub flags: PartitionGroupFlags,
    /// Maximum size of all partitions in this group.
    pub maximum_size: Option<NonZeroU64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDevice {
    /// The first [`SECTOR_SIZE`]-byte sector where actual data for the
    /// logical partitions can be allocated.
    pub first_logical_sector: u64,
    /// Alignment for the partition start offset.
    pub alignment: u32,
    /// Adjustment for when the super partition itself is not aligned.
    pub alignment_offset: u32,
    /// Block device size.
    pub size: u64,
    /// Partition name in ASCII.
    pub partition_name: String,
    /// Block device flags.
    pub flags: BlockDeviceFlags,
}

/// A fully validated snapshot of one metadata slot. Produced only by a
/// successful decode; immutable afterwards. Relationships between the tables
/// are expressed as indices, all validated before construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub geometry: Geometry,
    pub header: Header,
    pub partitions: Vec<Partition>,
    pub extents: Vec<Extent>,
    pub groups: Vec<PartitionGroup>,
    pub block_devices: Vec<BlockDevice>,
}

impl Metadata {
    /// Find a partition by exact name match.
    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// The extents backing a partition, in index order.
    pub fn partition_extents(&self, partition: &Partition) -> &[Extent] {
        // In bounds per RawPartition::validate.
        &self.extents[partition.first_extent_index as usize..][..partition.num_extents as usize]
    }

    /// Total size of a partition in bytes.
    pub fn partition_size(&self, partition: &Partition) -> Result<u64> {
        self.partition_extents(partition)
            .iter()
            .try_fold(0u64, |total, e| {
                e.num_sectors
                    .checked_mul(u64::from(SECTOR_SIZE))
                    .and_then(|n| total.checked_add(n))
            })
            .ok_or_else(|| Error::PartitionSizeTooLarge {
                name: DebugString::new(&partition.name),
            })
    }

    /// The block device that houses the super partition metadata. Guaranteed
    /// to exist by validation.
    pub fn super_device(&self) -> &BlockDevice {
        &self.block_devices[0]
    }
}

/// Byte offset of the primary geometry block.
pub const fn primary_geometry_offset() -> u64 {
    PARTITION_RESERVED_BYTES as u64
}

/// Byte offset of the backup geometry block.
pub const fn backup_geometry_offset() -> u64 {
    primary_geometry_offset() + GEOMETRY_SIZE as u64
}

/// Byte offset of the primary metadata copy for a slot.
pub fn primary_metadata_offset(geometry: &Geometry, slot_number: u32) -> u64 {
    primary_geometry_offset()
        + 2 * u64::from(GEOMETRY_SIZE)
        + u64::from(geometry.metadata_max_size) * u64::from(slot_number)
}

/// Byte offset of the backup metadata copy for a slot. The backup copies of
/// all slots follow the primary copies of all slots.
pub fn backup_metadata_offset(geometry: &Geometry, slot_number: u32) -> u64 {
    let start = primary_geometry_offset()
        + 2 * u64::from(GEOMETRY_SIZE)
        + u64::from(geometry.metadata_max_size) * u64::from(geometry.metadata_slot_count);

    start + u64::from(geometry.metadata_max_size) * u64::from(slot_number)
}

/// Total size of the metadata region at the start of the super device:
/// reserved bytes plus two copies each of the geometry and of every slot.
pub fn total_metadata_size(metadata_max_size: u32, metadata_slot_count: u32) -> u64 {
    u64::from(PARTITION_RESERVED_BYTES)
        + 2 * (u64::from(GEOMETRY_SIZE)
            + u64::from(metadata_max_size) * u64::from(metadata_slot_count))
}

/// Decode and validate a single geometry block. The buffer is the full
/// [`GEOMETRY_SIZE`]-byte block; everything past the struct is padding.
pub fn parse_geometry(buffer: &[u8; GEOMETRY_SIZE as usize]) -> Result<Geometry> {
    // The buffer is statically large enough.
    let raw = RawGeometry::ref_from_prefix(buffer).unwrap().0;

    raw.validate()?;

    Ok(Geometry::from(raw))
}

fn read_geometry_at(mut reader: impl Read + Seek, offset: u64) -> Result<Geometry> {
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::DataRead("geometry", e))?;

    let buffer: [u8; GEOMETRY_SIZE as usize] = reader
        .read_array_exact()
        .map_err(|e| Error::DataRead("geometry", e))?;

    parse_geometry(&buffer)
}

/// Read and validate the primary copy of the geometry.
pub fn read_primary_geometry(reader: impl Read + Seek) -> Result<Geometry> {
    read_geometry_at(reader, primary_geometry_offset())
}

/// Read and validate the backup copy of the geometry.
pub fn read_backup_geometry(reader: impl Read + Seek) -> Result<Geometry> {
    read_geometry_at(reader, backup_geometry_offset())
}

/// Read and validate geometry information from a device that holds logical
/// partitions. If the primary copy is corrupted, this will attempt to read
/// the backup copy, propagating the backup's error if both fail.
pub fn read_logical_partition_geometry(mut reader: impl Read + Seek) -> Result<Geometry> {
    match read_primary_geometry(&mut reader) {
        Ok(geometry) => Ok(geometry),
        Err(e) => {
            warn!("Primary geometry is unusable, trying backup: {e}");
            read_backup_geometry(&mut reader)
        }
    }
}

/// Read and validate a metadata header at the reader's current position.
fn read_metadata_header(mut reader: impl Read) -> Result<RawHeader> {
    let mut header = RawHeader::new_zeroed();

    reader
        .read_exact(&mut header.as_mut_bytes()[..RawHeader::SIZE_V1_0])
        .map_err(|e| Error::DataRead("header_v1.0", e))?;

    // This must pass before trusting header_size for the trailing read. A
    // legacy header leaves flags and reserved zeroed.
    header.validate_prefix()?;

    if header.header_size.get() as usize > RawHeader::SIZE_V1_0 {
        reader
            .read_exact(&mut header.as_mut_bytes()[RawHeader::SIZE_V1_0..])
            .map_err(|e| Error::DataRead("header_v1.2", e))?;
    }

    header.validate_checksum()?;
    header.validate_tables()?;

    Ok(header)
}

/// Decode a table's entries from the tables buffer. Entries are read at
/// `offset + i * entry_size`; each is parsed as a struct-sized prefix of the
/// remaining buffer, so a final entry shorter than the struct fails cleanly.
fn decode_table<T>(
    buffer: &[u8],
    descriptor: &RawTableDescriptor,
    name: &'static str,
) -> Result<Vec<T>>
where
    T: FromBytes + zerocopy::KnownLayout + zerocopy::Immutable + zerocopy::Unaligned + Copy,
{
    let num_entries = descriptor.num_entries.get() as usize;
    let entry_size = descriptor.entry_size.get() as usize;
    let mut entries = Vec::with_capacity(num_entries);
    let mut offset = descriptor.offset.get() as usize;

    for index in 0..num_entries {
        let entry = T::ref_from_prefix(&buffer[offset..])
            .map_err(|_| Error::TableEntryTruncated { name, index })?
            .0;

        entries.push(*entry);
        offset += entry_size;
    }

    Ok(entries)
}

struct RawTables {
    partitions: Vec<RawPartition>,
    extents: Vec<RawExtent>,
    groups: Vec<RawPartitionGroup>,
    block_devices: Vec<RawBlockDevice>,
}

impl RawTables {
    /// Cross-reference validation in dependency order. Must run before the
    /// tables are converted into the public model.
    fn validate(&self, geometry: &Geometry, header: &RawHeader) -> Result<()> {
        for (index, extent) in self.extents.iter().enumerate() {
            extent.validate(index, self.block_devices.len())?;
        }

        for partition in &self.partitions {
            partition.validate(header, self.extents.len(), self.groups.len())?;
        }

        let Some(super_device) = self.block_devices.first() else {
            return Err(Error::NoSuperDevice);
        };

        // The metadata area must not overlap logical partition storage.
        let metadata_region =
            total_metadata_size(geometry.metadata_max_size, geometry.metadata_slot_count);
        let first_logical_byte =
            u128::from(super_device.first_logical_sector.get()) * u128::from(SECTOR_SIZE);

        if u128::from(metadata_region) > first_logical_byte {
            return Err(Error::MetadataOverlapsPartitions {
                metadata_region,
                first_logical_sector: super_device.first_logical_sector.get(),
            });
        }

        Ok(())
    }
}

/// Read and validate one full copy of the metadata (header plus tables) at
/// the reader's current position. Any failure discards everything.
pub fn parse_metadata(geometry: &Geometry, mut reader: impl Read) -> Result<Metadata> {
    let header = read_metadata_header(&mut reader)?;

    if header.tables_size.get() > geometry.metadata_max_size {
        return Err(Error::TablesTooLarge {
            tables_size: header.tables_size.get(),
            max_size: geometry.metadata_max_size,
        });
    }

    let buffer = reader
        .read_vec_exact(header.tables_size.get() as usize)
        .map_err(|e| Error::DataRead("tables", e))?;

    let digest = sha256(&buffer);
    if digest.as_ref() != header.tables_checksum {
        return Err(Error::TablesInvalidDigest {
            expected: hex::encode(header.tables_checksum),
            actual: hex::encode(digest),
        });
    }

    let tables = RawTables {
        partitions: decode_table(&buffer, &header.partitions, "partition")?,
        extents: decode_table(&buffer, &header.extents, "extent")?,
        groups: decode_table(&buffer, &header.groups, "partition group")?,
        block_devices: decode_table(&buffer, &header.block_devices, "block device")?,
    };

    tables.validate(geometry, &header)?;

    build_metadata(geometry, &header, &tables)
}

/// Convert the validated raw tables into the public model. Name validation
/// and the uniqueness check happen here.
fn build_metadata(geometry: &Geometry, header: &RawHeader, tables: &RawTables) -> Result<Metadata> {
    let mut partitions = Vec::with_capacity(tables.partitions.len());
    let mut seen_names = HashSet::new();

    for raw in &tables.partitions {
        let name = raw.name.as_str()?;

        if name.is_empty() {
            return Err(Error::NameInvalid(DebugString::new(raw.name)));
        }

        if !seen_names.insert(name) {
            return Err(Error::NameDuplicate(DebugString::new(raw.name)));
        }

        partitions.push(Partition {
            name: name.to_owned(),
            attributes: PartitionAttributes::from_bits_retain(raw.attributes.get()),
            first_extent_index: raw.first_extent_index.get(),
            num_extents: raw.num_extents.get(),
            group_index: raw.group_index.get(),
        });
    }

    let extents = tables
        .extents
        .iter()
        .map(|raw| Extent {
            num_sectors: raw.num_sectors.get(),
            extent_type: match raw.target_type.get() {
                RawExtent::TARGET_TYPE_LINEAR => ExtentType::Linear {
                    start_sector: raw.target_data.get(),
                    block_device_index: raw.target_source.get(),
                },
                RawExtent::TARGET_TYPE_ZERO => ExtentType::Zero,
                // Rejected by RawExtent::validate.
                _ => unreachable!(),
            },
        })
        .collect();

    let groups = tables
        .groups
        .iter()
        .map(|raw| {
            Ok(PartitionGroup {
                name: raw.name.as_str()?.to_owned(),
                flags: PartitionGroupFlags::from_bits_retain(raw.flags.get()),
                maximum_size: NonZeroU64::new(raw.maximum_size.get()),
            })
        })
        .collect::<Result<_>>()?;

    let block_devices = tables
        .block_devices
        .iter()
        .map(|raw| {
            Ok(BlockDevice {
                first_logical_sector: raw.first_logical_sector.get(),
                alignment: raw.alignment.get(),
                alignment_offset: raw.alignment_offset.get(),
                size: raw.size.get(),
                partition_name: raw.partition_name.as_str()?.to_owned(),
                flags: BlockDeviceFlags::from_bits_retain(raw.flags.get()),
            })
        })
        .collect::<Result<_>>()?;

    Ok(Metadata {
        geometry: *geometry,
        header: Header {
            major_version: header.major_version.get(),
            minor_version: header.minor_version.get(),
            flags: HeaderFlags::from_bits_retain(header.flags.get()),
        },
        partitions,
        extents,
        groups,
        block_devices,
    })
}

/// The slot suffix appended to partition names on retrofit devices. Only the
/// A and B slots have suffixes.
fn slot_suffix(slot_number: u32) -> Option<&'static str> {
    match slot_number {
        0 => Some("_a"),
        1 => Some("_b"),
        _ => None,
    }
}

fn append_suffix(name: &mut String, slot_number: u32) -> Result<()> {
    let suffix =
        slot_suffix(slot_number).ok_or(Error::SlotNotSuffixable { slot: slot_number })?;

    if name.len() + suffix.len() > MAX_NAME_LEN {
        return Err(Error::NameSuffixTooLong {
            name: DebugString::new(&name),
            suffix,
        });
    }

    name.push_str(suffix);

    Ok(())
}

/// Apply the slot suffix to every partition, block device, and partition
/// group that carries a slot-suffix flag, clearing the flag. This consumes
/// the metadata and returns the adjusted aggregate; on error nothing
/// partially adjusted escapes.
pub fn adjust_metadata_for_slot(mut metadata: Metadata, slot_number: u32) -> Result<Metadata> {
    for partition in &mut metadata.partitions {
        if partition.attributes.contains(PartitionAttributes::SLOT_SUFFIXED) {
            append_suffix(&mut partition.name, slot_number)?;
            partition.attributes -= PartitionAttributes::SLOT_SUFFIXED;
        }
    }

    for block_device in &mut metadata.block_devices {
        if block_device.flags.contains(BlockDeviceFlags::SLOT_SUFFIXED) {
            append_suffix(&mut block_device.partition_name, slot_number)?;
            block_device.flags -= BlockDeviceFlags::SLOT_SUFFIXED;
        }
    }

    for group in &mut metadata.groups {
        if group.flags.contains(PartitionGroupFlags::SLOT_SUFFIXED) {
            append_suffix(&mut group.name, slot_number)?;
            group.flags -= PartitionGroupFlags::SLOT_SUFFIXED;
        }
    }

    Ok(metadata)
}

/// Read, validate, and slot-normalize the metadata for a slot from an open
/// super device. If the primary copy is unusable for any reason, the backup
/// copy at the mirrored offset is tried before giving up.
pub fn read_metadata_from(mut reader: impl Read + Seek, slot_number: u32) -> Result<Metadata> {
    let geometry = read_logical_partition_geometry(&mut reader)?;

    if slot_number >= geometry.metadata_slot_count {
        return Err(Error::InvalidSlotNumber {
            slot: slot_number,
            slot_count: geometry.metadata_slot_count,
        });
    }

    let primary_offset = primary_metadata_offset(&geometry, slot_number);
    let backup_offset = backup_metadata_offset(&geometry, slot_number);
    let mut metadata = None;

    for offset in [primary_offset, backup_offset] {
        debug!("Reading metadata for slot {slot_number} at offset {offset}");

        let result = reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::DataRead("metadata", e))
            .and_then(|_| parse_metadata(&geometry, &mut reader));

        match result {
            Ok(m) => {
                metadata = Some(m);
                break;
            }
            Err(e) if offset == primary_offset => {
                warn!("Primary metadata is unusable, trying backup: {e}");
            }
            Err(e) => {
                return Err(Error::MetadataUnreadable {
                    slot: slot_number,
                    primary_offset,
                    backup_offset,
                    source: Box::new(e),
                });
            }
        }
    }

    // The loop above either stored a value or returned.
    let metadata = metadata.unwrap();

    adjust_metadata_for_slot(metadata, slot_number)
}

/// Read the metadata for a slot from a named super partition via the device
/// capability.
pub fn read_metadata(
    opener: &dyn PartitionOpener,
    super_partition: &str,
    slot_number: u32,
) -> Result<Metadata> {
    let reader = opener
        .open(super_partition)
        .map_err(|e| Error::DataRead("super", e))?;

    read_metadata_from(reader, slot_number)
}

/// Copies a partition's contents out of a super image extent-by-extent.
///
/// Only single-device images with purely dm-linear extents are supported;
/// anything else fails before any byte is written.
pub struct ImageExtractor<'a, R: Read + Seek> {
    reader: R,
    metadata: &'a Metadata,
}

impl<'a, R: Read + Seek> ImageExtractor<'a, R> {
    pub fn new(reader: R, metadata: &'a Metadata) -> Self {
        Self { reader, metadata }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Check that every extent of the partition can be materialized by this
    /// extractor and return their linear start sectors.
    fn validate_extents(&self, partition: &Partition) -> Result<Vec<(u64, u64)>> {
        let extents = self.metadata.partition_extents(partition);
        let mut spans = Vec::with_capacity(extents.len());

        for (index, extent) in extents.iter().enumerate() {
            let ExtentType::Linear {
                start_sector,
                block_device_index,
            } = extent.extent_type
            else {
                return Err(Error::UnsupportedTargetType {
                    name: partition.name.clone(),
                    index,
                });
            };

            if block_device_index != 0 {
                return Err(Error::SplitSuperNotSupported {
                    name: partition.name.clone(),
                    index,
                });
            }

            let offset = start_sector
                .checked_mul(u64::from(SECTOR_SIZE))
                .ok_or_else(|| Error::ExtentOffsetTooLarge {
                    name: partition.name.clone(),
                    index,
                })?;
            let size = extent
                .num_sectors
                .checked_mul(u64::from(SECTOR_SIZE))
                .ok_or_else(|| Error::PartitionSizeTooLarge {
                    name: DebugString::new(&partition.name),
                })?;

            spans.push((offset, size));
        }

        Ok(spans)
    }

    /// Extract the named partition's contents, returning the number of bytes
    /// written. The copy proceeds one logical block at a time; an extent
    /// whose remaining byte count drops below one block is rejected.
    pub fn extract_partition(
        &mut self,
        name: &str,
        mut writer: impl Write,
        cancel_signal: &AtomicBool,
    ) -> Result<u64> {
        let partition = self
            .metadata
            .partition(name)
            .ok_or_else(|| Error::PartitionNotFound(name.to_owned()))?;

        let spans = self.validate_extents(partition)?;
        let total_size = self.metadata.partition_size(partition)?;
        let block_size = u64::from(self.metadata.geometry.logical_block_size);

        for (index, (offset, size)) in spans.into_iter().enumerate() {
            self.reader
                .seek(SeekFrom::Start(offset))
                .map_err(|e| Error::DataRead("extent", e))?;

            let mut remaining = size;

            while remaining > 0 {
                if remaining < block_size {
                    return Err(Error::ExtentNotBlockAligned {
                        name: partition.name.clone(),
                        index,
                    });
                }

                stream::copy_n(&mut self.reader, &mut writer, block_size, cancel_signal)
                    .map_err(|e| Error::DataCopy("extent", e))?;

                remaining -= block_size;
            }
        }

        Ok(total_size)
    }
}
