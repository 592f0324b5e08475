//! # Image Format
//!
//! On-disk structures of a blitzfs image and their little-endian encoders and
//! decoders. Layout, front to back:
//!
//! ```text
//! superblock (128 B) | data blocks + fragment blocks | inode table | directory table
//!   | fragment table | lookup table | uid table | gid table | padding to 4 KiB
//! ```
//!
//! Inode and directory tables are streams of records cut into 8 KiB pages,
//! each page compressed on its own ([`metadata`]). Records are addressed by a
//! [`MetaRef`](crate::common::MetaRef): the page's offset from the table start
//! plus the offset inside the decompressed page.

pub mod directory;
pub mod inode;
pub mod metadata;
pub mod superblock;
pub mod tables;

use crate::error::{ImageError, Result};

pub use superblock::{Superblock, SuperFlags, MAGIC_BYTES, NO_TABLE};

/// Little-endian append helpers for building records.
pub(crate) trait PutLe {
    fn put_u16(&mut self, v: u16);
    fn put_i16(&mut self, v: i16);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
    fn put_i64(&mut self, v: i64);
}

impl PutLe for Vec<u8> {
    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_le_bytes());
    }
    fn put_i16(&mut self, v: i16) {
        self.extend_from_slice(&v.to_le_bytes());
    }
    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_le_bytes());
    }
    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_le_bytes());
    }
    fn put_i64(&mut self, v: i64) {
        self.extend_from_slice(&v.to_le_bytes());
    }
}

/// Bounds-checked little-endian cursor over a byte slice. Running off the
/// end is reported as a corrupt image.
pub(crate) struct LeReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> LeReader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        LeReader { buf, pos: 0, what }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| ImageError::corrupt(format!("truncated {} at byte {}", self.what, self.pos)))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }
    pub fn i16(&mut self) -> Result<i16> {
        self.array().map(i16::from_le_bytes)
    }
    pub fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }
    pub fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_le_bytes)
    }
    pub fn i64(&mut self) -> Result<i64> {
        self.array().map(i64::from_le_bytes)
    }
}
