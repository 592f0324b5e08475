use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::common::DEFAULT_BLOCK_SIZE;
use crate::compress::{BuildOptions, CompressionAlgo, DEFAULT_LZMA_PRESET, DEFAULT_ZSTD_LEVEL};
use crate::error::{ImageError, Result};
use crate::extract::ExtractOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Only print warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print debug output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Build an image from files and directories.
    #[command(alias = "b")]
    Build(BuildArgs),

    /// Extract an image, or selected paths from it.
    #[command(alias = "x")]
    Extract {
        /// The image to extract.
        #[arg(required = true)]
        image: PathBuf,

        /// Paths inside the image to extract. If empty, everything is extracted.
        paths: Vec<PathBuf>,

        /// Destination directory.
        #[arg(short, long)]
        output: PathBuf,

        /// Extract into a non-empty directory, replacing existing files.
        #[arg(long)]
        force: bool,

        /// Do not restore file owners (they are only restored as root anyway).
        #[arg(long)]
        no_owner: bool,

        /// Writer threads. [0 = auto-detect based on CPU cores]
        #[arg(long, env = "BLITZFS_WORKERS", default_value_t = 0)]
        workers: usize,
    },

    /// List the entries of an image.
    #[command(alias = "l")]
    List {
        #[arg(required = true)]
        image: PathBuf,

        /// Show mode, owner, size and time like `ls -l`.
        #[arg(short, long)]
        long: bool,
    },

    /// Print the superblock of an image.
    Info {
        #[arg(required = true)]
        image: PathBuf,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(ClapArgs, Clone, Debug)]
pub struct BuildArgs {
    /// One or more files or directories to put in the image.
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,

    /// The image file to write.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Data block size in bytes; a power of two between 4096 and 1048576.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,

    /// Compression algorithm.
    #[arg(long, value_enum, default_value_t = Codec::Zstd)]
    pub comp: Codec,

    /// Compression level (zstd 1-22, lzma 0-9). [default: zstd 15, lzma 6]
    #[arg(long)]
    pub level: Option<u32>,

    /// Store the inode and directory tables uncompressed.
    #[arg(long)]
    pub no_inode_compression: bool,

    /// Store data blocks uncompressed.
    #[arg(long)]
    pub no_data_compression: bool,

    /// Store fragment blocks uncompressed.
    #[arg(long)]
    pub no_fragment_compression: bool,

    /// Store duplicate files again instead of sharing their content.
    #[arg(long)]
    pub no_dedup: bool,

    /// Store file tails as blocks instead of packing them into fragments.
    #[arg(long)]
    pub no_fragments: bool,

    /// Also pack the tails of files larger than one block into fragments.
    #[arg(long, conflicts_with = "no_fragments")]
    pub always_use_fragments: bool,

    /// Leave out the inode lookup table.
    #[arg(long)]
    pub no_exports: bool,

    /// Compressor threads. [0 = auto-detect based on CPU cores]
    #[arg(long, env = "BLITZFS_WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Block buffers shared by the pipeline. [0 = derived from --workers]
    #[arg(long, default_value_t = 0, hide = true)]
    pub arena_blocks: usize,

    /// Leave out a path, relative to the source root. May be repeated.
    #[arg(long = "exclude", value_name = "PATH")]
    pub excludes: Vec<PathBuf>,

    /// Record this uid for every entry.
    #[arg(long)]
    pub force_uid: Option<u32>,

    /// Record this gid for every entry.
    #[arg(long)]
    pub force_gid: Option<u32>,

    /// Record every entry as owned by root.
    #[arg(long, conflicts_with_all = ["force_uid", "force_gid"])]
    pub all_root: bool,

    /// Add the sources to an existing image instead of overwriting it.
    #[arg(long)]
    pub append: bool,

    /// Show a progress bar.
    #[arg(long)]
    pub progress: bool,
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Codec {
    Zstd,
    Lzma,
    None,
}

impl BuildArgs {
    /// Map the flags onto [`BuildOptions`]; the progress callback is left
    /// to the caller.
    pub fn to_options(&self) -> Result<BuildOptions> {
        let algo = match (self.comp, self.level) {
            (Codec::Zstd, None) => CompressionAlgo::Zstd { level: DEFAULT_ZSTD_LEVEL },
            (Codec::Zstd, Some(level)) => CompressionAlgo::Zstd {
                level: i32::try_from(level).map_err(|_| ImageError::InvalidOptions(format!("bad level {level}")))?,
            },
            (Codec::Lzma, None) => CompressionAlgo::Lzma { preset: DEFAULT_LZMA_PRESET },
            (Codec::Lzma, Some(preset)) => CompressionAlgo::Lzma { preset },
            (Codec::None, None) => CompressionAlgo::None,
            (Codec::None, Some(_)) => {
                return Err(ImageError::InvalidOptions("--level has no meaning with --comp none".into()))
            }
        };
        let options = BuildOptions {
            block_size: self.block_size,
            algo,
            compress_inodes: !self.no_inode_compression,
            compress_data: !self.no_data_compression,
            compress_fragments: !self.no_fragment_compression,
            dedup: !self.no_dedup,
            fragments: !self.no_fragments,
            always_fragments: self.always_use_fragments,
            exportable: !self.no_exports,
            workers: self.workers,
            arena_blocks: self.arena_blocks,
            excludes: self.excludes.clone(),
            force_uid: self.force_uid,
            force_gid: self.force_gid,
            all_root: self.all_root,
            append: self.append,
            ..Default::default()
        };
        options.validate()?;
        Ok(options)
    }
}

/// Build [`ExtractOptions`] from the `extract` subcommand.
pub fn extract_options(paths: &[PathBuf], output: &std::path::Path, force: bool, no_owner: bool, workers: usize) -> ExtractOptions {
    ExtractOptions {
        dest: output.to_path_buf(),
        paths: paths.to_vec(),
        preserve_owner: !no_owner,
        force,
        workers,
    }
}

/// Parses command-line arguments using `clap`.
pub fn run() -> Args {
    Args::parse()
}
