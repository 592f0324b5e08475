//! # Codecs and build configuration
//!
//! The image format treats the compressor as a pluggable capability: every
//! data block, fragment block and metadata page goes through
//! [`CompressionAlgo::compress`], and anything that does not shrink is stored raw.
//!
//! This module also holds [`BuildOptions`], the validated configuration for
//! [`crate::build::build_image`].

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{exact_log2, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::error::{ImageError, Result};
use crate::progress::{ProgressState, DEFAULT_EMIT_INTERVAL};

pub const DEFAULT_ZSTD_LEVEL: i32 = 15;
pub const DEFAULT_LZMA_PRESET: u32 = 6;

/// Defines the available compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgo {
    /// Store everything uncompressed.
    None,
    /// Zstandard at the given level (1-22).
    Zstd { level: i32 },
    /// LZMA2 in an xz container with the given preset (0-9).
    Lzma { preset: u32 },
}

/// Result of compressing one block.
#[derive(Debug, PartialEq, Eq)]
pub enum Packed {
    Compressed(Vec<u8>),
    /// The block did not shrink below the limit; store the input verbatim.
    Raw,
}

impl Default for CompressionAlgo {
    fn default() -> Self {
        CompressionAlgo::Zstd { level: DEFAULT_ZSTD_LEVEL }
    }
}

impl CompressionAlgo {
    /// Identifier recorded in the superblock.
    pub const fn id(self) -> u16 {
        match self {
            CompressionAlgo::None => 0,
            CompressionAlgo::Zstd { .. } => 1,
            CompressionAlgo::Lzma { .. } => 2,
        }
    }

    /// Level or preset recorded next to the identifier; 0 for `None`.
    pub const fn level(self) -> u32 {
        match self {
            CompressionAlgo::None => 0,
            CompressionAlgo::Zstd { level } => level as u32,
            CompressionAlgo::Lzma { preset } => preset,
        }
    }

    /// Decoder for the identifier and level stored in a superblock.
    pub fn from_stored(id: u16, level: u32) -> Result<Self> {
        match (id, level) {
            (0, _) => Ok(CompressionAlgo::None),
            (1, 1..=22) => Ok(CompressionAlgo::Zstd { level: level as i32 }),
            (2, 0..=9) => Ok(CompressionAlgo::Lzma { preset: level }),
            (1 | 2, _) => Err(ImageError::Unsupported(format!("compression level {level} for compressor {id}"))),
            (other, _) => Err(ImageError::Unsupported(format!("compressor id {other}"))),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CompressionAlgo::None => "none",
            CompressionAlgo::Zstd { .. } => "zstd",
            CompressionAlgo::Lzma { .. } => "lzma",
        }
    }

    /// Compress `block`. Returns [`Packed::Raw`] when the codec is `None` or
    /// the output would not be strictly smaller than `max_out` bytes.
    pub fn compress(self, block: &[u8], max_out: usize) -> Result<Packed> {
        let out = match self {
            CompressionAlgo::None => return Ok(Packed::Raw),
            CompressionAlgo::Zstd { level } => zstd::bulk::compress(block, level)
                .map_err(|e| ImageError::Compression(format!("zstd: {e}")))?,
            CompressionAlgo::Lzma { preset } => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::with_capacity(block.len() / 2), preset);
                encoder
                    .write_all(block)
                    .map_err(|e| ImageError::Compression(format!("lzma: {e}")))?;
                encoder
                    .finish()
                    .map_err(|e| ImageError::Compression(format!("lzma: {e}")))?
            }
        };
        if out.len() >= max_out {
            Ok(Packed::Raw)
        } else {
            Ok(Packed::Compressed(out))
        }
    }

    /// Decompress a block produced by [`compress`](Self::compress). The result
    /// may not exceed `expected_size` bytes.
    pub fn decompress(self, bytes: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let out = match self {
            CompressionAlgo::None => {
                return Err(ImageError::corrupt("compressed block in an image built without a compressor"))
            }
            CompressionAlgo::Zstd { .. } => zstd::bulk::decompress(bytes, expected_size)
                .map_err(|e| ImageError::Compression(format!("zstd: {e}")))?,
            CompressionAlgo::Lzma { .. } => {
                let mut out = Vec::with_capacity(expected_size);
                xz2::read::XzDecoder::new(bytes)
                    .take(expected_size as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| ImageError::Compression(format!("lzma: {e}")))?;
                out
            }
        };
        if out.len() > expected_size {
            return Err(ImageError::corrupt(format!(
                "block decompressed to {} bytes, limit is {expected_size}",
                out.len()
            )));
        }
        Ok(out)
    }
}

impl fmt::Display for CompressionAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgo::None => f.write_str("none"),
            CompressionAlgo::Zstd { level } => write!(f, "zstd (level {level})"),
            CompressionAlgo::Lzma { preset } => write!(f, "lzma (preset {preset})"),
        }
    }
}

/// Receives progress snapshots while an image is being built.
pub type ProgressFn = Arc<dyn Fn(ProgressState) + Send + Sync>;

/// Holds all configuration options for a build.
#[derive(Clone)]
pub struct BuildOptions {
    /// Data block size; a power of two between 4 KiB and 1 MiB.
    pub block_size: u32,
    pub algo: CompressionAlgo,
    /// Compress inode and directory tables.
    pub compress_inodes: bool,
    pub compress_data: bool,
    pub compress_fragments: bool,
    pub dedup: bool,
    /// Pack file tails into shared fragment blocks.
    pub fragments: bool,
    /// Also fragment the tails of files larger than one block.
    pub always_fragments: bool,
    /// Write the inode lookup table.
    pub exportable: bool,
    /// Compressor threads; 0 picks the number of cores.
    pub workers: usize,
    /// Number of block buffers shared by the pipeline; 0 derives it from `workers`.
    pub arena_blocks: usize,
    /// Paths, relative to a source root, that are left out of the image.
    pub excludes: Vec<PathBuf>,
    pub force_uid: Option<u32>,
    pub force_gid: Option<u32>,
    /// Record every entry as owned by uid 0 / gid 0.
    pub all_root: bool,
    /// Add to an existing image instead of overwriting it.
    pub append: bool,
    pub progress: Option<ProgressFn>,
    /// Minimum time between two progress callbacks.
    pub progress_interval: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            algo: CompressionAlgo::default(),
            compress_inodes: true,
            compress_data: true,
            compress_fragments: true,
            dedup: true,
            fragments: true,
            always_fragments: false,
            exportable: true,
            workers: 0,
            arena_blocks: 0,
            excludes: Vec::new(),
            force_uid: None,
            force_gid: None,
            all_root: false,
            append: false,
            progress: None,
            progress_interval: DEFAULT_EMIT_INTERVAL,
        }
    }
}

impl fmt::Debug for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildOptions")
            .field("block_size", &self.block_size)
            .field("algo", &self.algo)
            .field("compress_inodes", &self.compress_inodes)
            .field("compress_data", &self.compress_data)
            .field("compress_fragments", &self.compress_fragments)
            .field("dedup", &self.dedup)
            .field("fragments", &self.fragments)
            .field("always_fragments", &self.always_fragments)
            .field("exportable", &self.exportable)
            .field("workers", &self.workers)
            .field("arena_blocks", &self.arena_blocks)
            .field("excludes", &self.excludes)
            .field("force_uid", &self.force_uid)
            .field("force_gid", &self.force_gid)
            .field("all_root", &self.all_root)
            .field("append", &self.append)
            .field("progress_interval", &self.progress_interval)
            .finish_non_exhaustive()
    }
}

impl BuildOptions {
    pub fn validate(&self) -> Result<()> {
        if exact_log2(self.block_size).is_none()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(ImageError::InvalidOptions(format!(
                "block size {} must be a power of two between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        match self.algo {
            CompressionAlgo::Zstd { level } if !(1..=22).contains(&level) => {
                return Err(ImageError::InvalidOptions(format!("zstd level {level} is outside 1-22")));
            }
            CompressionAlgo::Lzma { preset } if preset > 9 => {
                return Err(ImageError::InvalidOptions(format!("lzma preset {preset} is outside 0-9")));
            }
            _ => {}
        }
        if self.always_fragments && !self.fragments {
            return Err(ImageError::InvalidOptions(
                "--always-use-fragments conflicts with --no-fragments".into(),
            ));
        }
        if self.all_root && (self.force_uid.is_some() || self.force_gid.is_some()) {
            return Err(ImageError::InvalidOptions(
                "--all-root conflicts with --force-uid/--force-gid".into(),
            ));
        }
        Ok(())
    }

    /// Number of compressor threads to spawn.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    /// Number of block buffers in the pipeline arena.
    pub fn effective_arena_blocks(&self) -> usize {
        if self.arena_blocks == 0 {
            (self.effective_workers() * 4).max(8)
        } else {
            self.arena_blocks
        }
    }

    pub(crate) fn data_algo(&self) -> CompressionAlgo {
        if self.compress_data { self.algo } else { CompressionAlgo::None }
    }

    pub(crate) fn fragment_algo(&self) -> CompressionAlgo {
        if self.compress_fragments { self.algo } else { CompressionAlgo::None }
    }

    pub(crate) fn metadata_algo(&self) -> CompressionAlgo {
        if self.compress_inodes { self.algo } else { CompressionAlgo::None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_block() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. ".repeat(200)
    }

    #[test]
    fn zstd_and_lzma_shrink_text() {
        let block = text_block();
        for algo in [CompressionAlgo::Zstd { level: 3 }, CompressionAlgo::Lzma { preset: 1 }] {
            let Packed::Compressed(out) = algo.compress(&block, block.len()).unwrap() else {
                panic!("{algo} did not compress text");
            };
            assert_eq!(algo.decompress(&out, block.len()).unwrap(), block);
        }
    }

    #[test]
    fn incompressible_or_disabled_is_raw() {
        use rand::RngCore;
        let mut noise = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut noise);
        let zstd = CompressionAlgo::Zstd { level: 3 };
        assert_eq!(zstd.compress(&noise, noise.len()).unwrap(), Packed::Raw);
        assert_eq!(CompressionAlgo::None.compress(&text_block(), 1 << 20).unwrap(), Packed::Raw);
    }

    #[test]
    fn decompress_rejects_oversized_output() {
        let block = text_block();
        let algo = CompressionAlgo::Lzma { preset: 0 };
        let Packed::Compressed(out) = algo.compress(&block, block.len()).unwrap() else {
            panic!("expected compression");
        };
        assert!(algo.decompress(&out, 100).is_err());
    }

    #[test]
    fn validate_checks_block_size_and_conflicts() {
        let mut opts = BuildOptions::default();
        assert!(opts.validate().is_ok());
        opts.block_size = 3000;
        assert!(matches!(opts.validate(), Err(ImageError::InvalidOptions(_))));
        opts.block_size = 2 * MAX_BLOCK_SIZE;
        assert!(opts.validate().is_err());

        let opts = BuildOptions { fragments: false, always_fragments: true, ..Default::default() };
        assert!(opts.validate().is_err());
        let opts = BuildOptions { algo: CompressionAlgo::Lzma { preset: 12 }, ..Default::default() };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn stored_algo_keeps_its_level() {
        for algo in [CompressionAlgo::None, CompressionAlgo::Zstd { level: 3 }, CompressionAlgo::Lzma { preset: 1 }] {
            assert_eq!(CompressionAlgo::from_stored(algo.id(), algo.level()).unwrap(), algo);
        }
        assert!(CompressionAlgo::from_stored(9, 0).is_err());
        assert!(CompressionAlgo::from_stored(1, 0).is_err());
        assert!(CompressionAlgo::from_stored(2, 10).is_err());
    }
}
