//! Common utilities and types module.
// Shared newtypes, constants and small helpers used by both the builder and the reader.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of an uncompressed metadata page.
pub const METADATA_SIZE: usize = 8192;
/// Bit set in a metadata page header when the payload is stored uncompressed.
pub const METADATA_RAW_BIT: u16 = 0x8000;

/// Bytes reserved for the superblock at the start of every image.
pub const SUPERBLOCK_SIZE: u64 = 128;

pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Images are padded to a multiple of this so they can be attached to loop devices.
pub const DEVICE_ALIGN: u64 = 4096;

/// Bit set in a block-list or fragment size word when the block is stored uncompressed.
pub const BLOCK_RAW_BIT: u32 = 1 << 24;

/// An absolute byte offset inside the image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ImageOffset(pub u64);

impl ImageOffset {
    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn advance(self, bytes: u64) -> ImageOffset {
        ImageOffset(self.0 + bytes)
    }
}

impl fmt::Display for ImageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Location of a record inside a paged metadata table: the start of the
/// compressed page (relative to the table start) and the offset inside the
/// uncompressed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MetaRef {
    pub page: u64,
    pub offset: u16,
}

impl MetaRef {
    pub const fn new(page: u64, offset: u16) -> Self {
        Self { page, offset }
    }

    pub const fn pack(self) -> u64 {
        (self.page << 16) | self.offset as u64
    }

    pub const fn unpack(raw: u64) -> Self {
        Self { page: raw >> 16, offset: (raw & 0xffff) as u16 }
    }
}

impl fmt::Display for MetaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.offset)
    }
}

/// The type of a filesystem object, as recorded in inode and directory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Type code used in directory entries. Inode records extend it with the
    /// large-directory and large-file variants.
    pub const fn code(self) -> u16 {
        match self {
            FileKind::Directory => 1,
            FileKind::Regular => 2,
            FileKind::Symlink => 3,
            FileKind::BlockDevice => 4,
            FileKind::CharDevice => 5,
            FileKind::Fifo => 6,
            FileKind::Socket => 7,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => FileKind::Directory,
            2 => FileKind::Regular,
            3 => FileKind::Symlink,
            4 => FileKind::BlockDevice,
            5 => FileKind::CharDevice,
            6 => FileKind::Fifo,
            7 => FileKind::Socket,
            _ => return None,
        })
    }

    /// The `S_IFMT` bits for this kind.
    pub const fn mode_bits(self) -> u32 {
        match self {
            FileKind::Directory => 0o040000,
            FileKind::Regular => 0o100000,
            FileKind::Symlink => 0o120000,
            FileKind::BlockDevice => 0o060000,
            FileKind::CharDevice => 0o020000,
            FileKind::Fifo => 0o010000,
            FileKind::Socket => 0o140000,
        }
    }

    /// The `ls -l` style type character.
    pub const fn type_char(self) -> char {
        match self {
            FileKind::Directory => 'd',
            FileKind::Regular => '-',
            FileKind::Symlink => 'l',
            FileKind::BlockDevice => 'b',
            FileKind::CharDevice => 'c',
            FileKind::Fifo => 'p',
            FileKind::Socket => 's',
        }
    }
}

/// Where a file's tail lives inside a shared fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentRecord {
    pub index: u32,
    pub offset: u32,
    pub size: u32,
}

impl FragmentRecord {
    /// Sentinel meaning "this file has no fragment".
    pub const NONE: FragmentRecord = FragmentRecord { index: u32::MAX, offset: 0, size: 0 };

    pub const fn is_none(&self) -> bool {
        self.index == u32::MAX
    }
}

impl Default for FragmentRecord {
    fn default() -> Self {
        FragmentRecord::NONE
    }
}

/// One data block of a regular file as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockSize(pub u32);

impl BlockSize {
    pub const SPARSE: BlockSize = BlockSize(0);

    pub fn compressed(len: usize) -> Self {
        BlockSize(len as u32)
    }

    pub fn raw(len: usize) -> Self {
        BlockSize(len as u32 | BLOCK_RAW_BIT)
    }

    /// Number of bytes the block occupies in the image.
    pub const fn on_disk(self) -> u32 {
        self.0 & !BLOCK_RAW_BIT
    }

    pub const fn is_raw(self) -> bool {
        self.0 & BLOCK_RAW_BIT != 0
    }

    pub const fn is_sparse(self) -> bool {
        self.0 == 0
    }
}

/// BSD 16-bit rolling checksum. Cheap, and only ever used as a pre-filter
/// in front of a byte-exact comparison.
pub fn bsd_checksum(data: &[u8], mut sum: u16) -> u16 {
    for &b in data {
        sum = if sum & 1 != 0 { (sum >> 1) | 0x8000 } else { sum >> 1 };
        sum = sum.wrapping_add(b as u16);
    }
    sum
}

/// Returns `log2(value)` when `value` is a power of two.
pub fn exact_log2(value: u32) -> Option<u16> {
    if value.is_power_of_two() {
        Some(value.trailing_zeros() as u16)
    } else {
        None
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
