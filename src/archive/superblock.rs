use serde::Serialize;

use super::{LeReader, PutLe};
use crate::common::{exact_log2, MetaRef, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, SUPERBLOCK_SIZE};
use crate::compress::CompressionAlgo;
use crate::error::{ImageError, Result};

pub const MAGIC_BYTES: &[u8; 8] = b"BLZFSIMG";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Marks a table that is not present in the image.
pub const NO_TABLE: u64 = u64::MAX;

/// Bytes covered by the checksum; the crc itself follows them.
const CRC_OFFSET: usize = 124;

bitflags::bitflags! {
    /// Feature flags stored in the superblock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuperFlags: u32 {
        const UNCOMPRESSED_INODES = 1 << 0;
        const UNCOMPRESSED_DATA = 1 << 1;
        const UNCOMPRESSED_FRAGMENTS = 1 << 2;
        const NO_FRAGMENTS = 1 << 3;
        const ALWAYS_FRAGMENTS = 1 << 4;
        const DUPLICATES = 1 << 5;
        const EXPORTABLE = 1 << 6;
    }
}

impl Default for SuperFlags {
    fn default() -> Self {
        SuperFlags::empty()
    }
}

impl SuperFlags {
    /// Names of the set flags, lower case with dashes.
    pub fn names(self) -> Vec<String> {
        self.iter_names().map(|(name, _)| name.to_ascii_lowercase().replace('_', "-")).collect()
    }
}

fn serialize_flags<S: serde::Serializer>(flags: &SuperFlags, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(flags.names())
}

/// The fixed header at offset 0 of every image. Written as zeroes when the
/// build starts and patched once all tables are on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Superblock {
    pub version_major: u16,
    pub version_minor: u16,
    pub block_size: u32,
    pub block_log: u16,
    pub compressor: u16,
    /// Level or preset the image was built with; appends reuse it.
    pub compression_level: u32,
    #[serde(serialize_with = "serialize_flags")]
    pub flags: SuperFlags,
    pub mkfs_time: i64,
    pub inode_count: u32,
    pub fragment_count: u32,
    pub uid_count: u32,
    pub gid_count: u32,
    #[serde(serialize_with = "serialize_meta_ref")]
    pub root_inode: MetaRef,
    pub bytes_used: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub directory_table_end: u64,
    pub fragment_table_start: u64,
    pub lookup_table_start: u64,
    pub uid_table_start: u64,
    pub gid_table_start: u64,
}

fn serialize_meta_ref<S: serde::Serializer>(r: &MetaRef, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&r.to_string())
}

impl Superblock {
    pub fn new(block_size: u32, algo: CompressionAlgo, flags: SuperFlags) -> Self {
        Superblock {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            block_size,
            block_log: exact_log2(block_size).unwrap_or(0),
            compressor: algo.id(),
            compression_level: algo.level(),
            flags,
            mkfs_time: chrono::Utc::now().timestamp(),
            inode_count: 0,
            fragment_count: 0,
            uid_count: 0,
            gid_count: 0,
            root_inode: MetaRef::default(),
            bytes_used: 0,
            inode_table_start: 0,
            directory_table_start: 0,
            directory_table_end: 0,
            fragment_table_start: NO_TABLE,
            lookup_table_start: NO_TABLE,
            uid_table_start: NO_TABLE,
            gid_table_start: NO_TABLE,
        }
    }

    pub fn algo(&self) -> Result<CompressionAlgo> {
        CompressionAlgo::from_stored(self.compressor, self.compression_level)
    }

    pub fn has_lookup_table(&self) -> bool {
        self.lookup_table_start != NO_TABLE
    }

    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE as usize] {
        let mut buf = Vec::with_capacity(SUPERBLOCK_SIZE as usize);
        buf.extend_from_slice(MAGIC_BYTES);
        buf.put_u16(self.version_major);
        buf.put_u16(self.version_minor);
        buf.put_u32(self.block_size);
        buf.put_u16(self.block_log);
        buf.put_u16(self.compressor);
        buf.put_u32(self.flags.bits());
        buf.put_i64(self.mkfs_time);
        buf.put_u32(self.inode_count);
        buf.put_u32(self.fragment_count);
        buf.put_u32(self.uid_count);
        buf.put_u32(self.gid_count);
        buf.put_u64(self.root_inode.pack());
        buf.put_u64(self.bytes_used);
        buf.put_u64(self.inode_table_start);
        buf.put_u64(self.directory_table_start);
        buf.put_u64(self.directory_table_end);
        buf.put_u64(self.fragment_table_start);
        buf.put_u64(self.lookup_table_start);
        buf.put_u64(self.uid_table_start);
        buf.put_u64(self.gid_table_start);
        buf.put_u32(self.compression_level);
        debug_assert_eq!(buf.len(), CRC_OFFSET);
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);

        let mut out = [0u8; SUPERBLOCK_SIZE as usize];
        out[..buf.len()].copy_from_slice(&buf);
        out
    }

    /// Parse and validate a superblock. `image_len` is the size of the whole
    /// image and bounds every table offset.
    pub fn decode(bytes: &[u8], image_len: u64) -> Result<Self> {
        if bytes.len() < SUPERBLOCK_SIZE as usize {
            return Err(ImageError::corrupt("image is smaller than a superblock"));
        }
        if &bytes[..MAGIC_BYTES.len()] != MAGIC_BYTES {
            return Err(ImageError::corrupt("not a blitzfs image (bad magic)"));
        }
        let stored_crc = u32::from_le_bytes([
            bytes[CRC_OFFSET],
            bytes[CRC_OFFSET + 1],
            bytes[CRC_OFFSET + 2],
            bytes[CRC_OFFSET + 3],
        ]);
        if crc32fast::hash(&bytes[..CRC_OFFSET]) != stored_crc {
            return Err(ImageError::corrupt("superblock checksum mismatch"));
        }

        let mut r = LeReader::new(&bytes[MAGIC_BYTES.len()..CRC_OFFSET], "superblock");
        let sb = Superblock {
            version_major: r.u16()?,
            version_minor: r.u16()?,
            block_size: r.u32()?,
            block_log: r.u16()?,
            compressor: r.u16()?,
            flags: {
                let bits = r.u32()?;
                SuperFlags::from_bits(bits)
                    .ok_or_else(|| ImageError::Unsupported(format!("unknown flags {bits:#x}")))?
            },
            mkfs_time: r.i64()?,
            inode_count: r.u32()?,
            fragment_count: r.u32()?,
            uid_count: r.u32()?,
            gid_count: r.u32()?,
            root_inode: MetaRef::unpack(r.u64()?),
            bytes_used: r.u64()?,
            inode_table_start: r.u64()?,
            directory_table_start: r.u64()?,
            directory_table_end: r.u64()?,
            fragment_table_start: r.u64()?,
            lookup_table_start: r.u64()?,
            uid_table_start: r.u64()?,
            gid_table_start: r.u64()?,
            compression_level: r.u32()?,
        };
        sb.validate(image_len)?;
        Ok(sb)
    }

    fn validate(&self, image_len: u64) -> Result<()> {
        if self.version_major != VERSION_MAJOR {
            return Err(ImageError::Unsupported(format!(
                "image version {}.{}",
                self.version_major, self.version_minor
            )));
        }
        if exact_log2(self.block_size) != Some(self.block_log)
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(ImageError::corrupt(format!("invalid block size {}", self.block_size)));
        }
        self.algo()?;
        if self.bytes_used > image_len {
            return Err(ImageError::corrupt(format!(
                "image truncated: {} bytes used, file is {image_len}",
                self.bytes_used
            )));
        }
        let ordered = SUPERBLOCK_SIZE <= self.inode_table_start
            && self.inode_table_start <= self.directory_table_start
            && self.directory_table_start <= self.directory_table_end
            && self.directory_table_end <= self.bytes_used;
        if !ordered {
            return Err(ImageError::corrupt("metadata table offsets out of order"));
        }
        for start in [
            self.fragment_table_start,
            self.lookup_table_start,
            self.uid_table_start,
            self.gid_table_start,
        ] {
            if start != NO_TABLE && start > self.bytes_used {
                return Err(ImageError::corrupt("table offset beyond end of image"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        let mut sb = Superblock::new(4096, CompressionAlgo::default(), SuperFlags::DUPLICATES);
        sb.inode_count = 3;
        sb.root_inode = MetaRef::new(0, 40);
        sb.inode_table_start = 1024;
        sb.directory_table_start = 1100;
        sb.directory_table_end = 1200;
        sb.uid_table_start = 1300;
        sb.gid_table_start = 1400;
        sb.bytes_used = 1500;
        sb
    }

    #[test]
    fn encode_decode_keeps_fields() {
        let sb = sample();
        let bytes = sb.encode();
        assert_eq!(&bytes[..8], MAGIC_BYTES);
        assert_eq!(Superblock::decode(&bytes, 4096).unwrap(), sb);
    }

    #[test]
    fn compression_level_is_stored() {
        let algo = CompressionAlgo::Zstd { level: 7 };
        let sb = Superblock { compressor: algo.id(), compression_level: algo.level(), ..sample() };
        let bytes = sb.encode();
        assert_eq!(&bytes[120..124], &7u32.to_le_bytes());
        assert_eq!(Superblock::decode(&bytes, 4096).unwrap().algo().unwrap(), algo);

        let mut bytes = bytes;
        bytes[120..124].copy_from_slice(&40u32.to_le_bytes());
        let crc = crc32fast::hash(&bytes[..CRC_OFFSET]);
        bytes[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(Superblock::decode(&bytes, 4096), Err(ImageError::Unsupported(_))));
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let mut bytes = sample().encode();
        bytes[33] ^= 1;
        let err = Superblock::decode(&bytes, 4096).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let bytes = sample().encode();
        assert!(matches!(Superblock::decode(&bytes, 1000), Err(ImageError::Corrupt(_))));
    }

    #[test]
    fn flag_names() {
        let mut flags = SuperFlags::default();
        flags.set(SuperFlags::EXPORTABLE, true);
        flags.set(SuperFlags::NO_FRAGMENTS, true);
        flags.set(SuperFlags::NO_FRAGMENTS, false);
        assert_eq!(flags.names(), vec!["exportable"]);
        flags.insert(SuperFlags::UNCOMPRESSED_DATA);
        assert_eq!(flags.names(), vec!["uncompressed-data", "exportable"]);
    }

    #[test]
    fn unknown_flag_bits_are_unsupported() {
        let mut bytes = sample().encode();
        bytes[20..24].copy_from_slice(&(1u32 << 20).to_le_bytes());
        let crc = crc32fast::hash(&bytes[..CRC_OFFSET]);
        bytes[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(Superblock::decode(&bytes, 4096), Err(ImageError::Unsupported(_))));
    }
}
