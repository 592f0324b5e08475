//! # blitzfs
//!
//! Builds and reads compressed, deduplicated, read-only filesystem images.
//!
//! An image holds every file's content as independently compressed blocks,
//! small file tails packed together into shared fragment blocks, and paged
//! metadata tables for inodes and directories. Identical files are stored
//! once. Images can be extended in place with [`build::build_image`] in
//! append mode; a failed append leaves the image as it was.
//!
//! ## Key Modules
//!
//! - [`build`]: scanning sources and writing images.
//! - [`extract`]: reading images back, listing and extraction.
//! - [`workers`]: the threaded read/compress/write pipeline.
//! - [`archive`]: the on-disk format.
//! - [`compress`]: codecs and [`compress::BuildOptions`].
//!
//! ## Examples
//!
//! ```no_run
//! use blitzfs::build::build_image;
//! use blitzfs::compress::BuildOptions;
//! use blitzfs::interrupt::Interrupt;
//! use std::path::{Path, PathBuf};
//!
//! let summary = build_image(
//!     &[PathBuf::from("rootfs")],
//!     Path::new("rootfs.img"),
//!     &BuildOptions::default(),
//!     &Interrupt::new(),
//! )?;
//! println!("{} inodes, {} bytes", summary.inode_count, summary.bytes_used);
//! # Ok::<(), blitzfs::error::ImageError>(())
//! ```

pub mod archive;
pub mod build;
pub mod cli;
pub mod cli_runner;
pub mod common;
pub mod compress;
pub mod dedup;
pub mod error;
pub use error::ImageError;
pub mod extract;
pub mod interrupt;
pub mod memory_pool;
pub mod progress;
pub mod scan;
pub mod workers;

// Thin wrappers over POSIX calls
pub mod fsx;
