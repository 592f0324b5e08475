//! Indexed tables: fixed-size entries packed into metadata pages, followed by
//! an array of absolute `u64` page locations. The superblock points at that
//! array; the entry count comes from the superblock too.

use std::collections::HashMap;

use super::metadata::{decode_page, encode_page};
use super::{LeReader, PutLe};
use crate::common::{BlockSize, METADATA_SIZE};
use crate::compress::CompressionAlgo;
use crate::error::{ImageError, Result};

pub const FRAGMENT_ENTRY_SIZE: usize = 16;
pub const LOOKUP_ENTRY_SIZE: usize = 8;
pub const ID_ENTRY_SIZE: usize = 4;

/// Marks a lookup slot whose inode number is not used by any entry.
pub const LOOKUP_UNUSED: u64 = u64::MAX;

/// Encode `entries` as an indexed table that will be written at absolute
/// offset `base`. Returns the bytes to write and the absolute offset of the
/// page location array (the value stored in the superblock).
pub fn encode_indexed(algo: CompressionAlgo, entries: &[u8], base: u64) -> Result<(Vec<u8>, u64)> {
    let mut out = Vec::new();
    let mut locations = Vec::new();
    for page in entries.chunks(METADATA_SIZE) {
        locations.push(base + out.len() as u64);
        encode_page(algo, page, &mut out)?;
    }
    let index_start = base + out.len() as u64;
    for loc in locations {
        out.put_u64(loc);
    }
    Ok((out, index_start))
}

/// Read back `count` entries of `entry_size` bytes from an indexed table.
pub fn decode_indexed(
    algo: CompressionAlgo,
    image: &[u8],
    index_start: u64,
    count: usize,
    entry_size: usize,
) -> Result<Vec<u8>> {
    let total = count
        .checked_mul(entry_size)
        .ok_or_else(|| ImageError::corrupt("table entry count overflows"))?;
    if total == 0 {
        return Ok(Vec::new());
    }
    let pages = total.div_ceil(METADATA_SIZE);
    let index = image
        .get(index_start as usize..)
        .and_then(|rest| rest.get(..pages * 8))
        .ok_or_else(|| ImageError::corrupt("table index runs past the image"))?;
    let mut r = LeReader::new(index, "table index");
    let mut out = Vec::with_capacity(total);
    for _ in 0..pages {
        let loc = r.u64()? as usize;
        let page = image
            .get(loc..)
            .ok_or_else(|| ImageError::corrupt(format!("table page at {loc} is outside the image")))?;
        out.extend_from_slice(&decode_page(algo, page)?);
    }
    if out.len() < total {
        return Err(ImageError::corrupt(format!("table holds {} bytes, expected {total}", out.len())));
    }
    out.truncate(total);
    Ok(out)
}

/// Location of one fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentEntry {
    pub start: u64,
    pub size: BlockSize,
}

impl FragmentEntry {
    pub fn encode_all(entries: &[FragmentEntry]) -> Vec<u8> {
        let mut out = Vec::with_capacity(entries.len() * FRAGMENT_ENTRY_SIZE);
        for e in entries {
            out.put_u64(e.start);
            out.put_u32(e.size.0);
            out.put_u32(0);
        }
        out
    }

    pub fn decode_all(bytes: &[u8]) -> Result<Vec<FragmentEntry>> {
        let mut r = LeReader::new(bytes, "fragment table");
        let mut out = Vec::with_capacity(bytes.len() / FRAGMENT_ENTRY_SIZE);
        while r.remaining() > 0 {
            let start = r.u64()?;
            let size = BlockSize(r.u32()?);
            r.u32()?;
            out.push(FragmentEntry { start, size });
        }
        Ok(out)
    }
}

pub fn encode_u64s(values: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    values.iter().for_each(|&v| out.put_u64(v));
    out
}

pub fn decode_u64s(bytes: &[u8]) -> Result<Vec<u64>> {
    let mut r = LeReader::new(bytes, "lookup table");
    (0..bytes.len() / 8).map(|_| r.u64()).collect()
}

/// Interned uid or gid values. Inodes store a 16-bit index into this table.
#[derive(Debug, Clone, Default)]
pub struct IdTable {
    ids: Vec<u32>,
    index: HashMap<u32, u16>,
}

impl IdTable {
    pub fn from_ids(ids: Vec<u32>) -> Self {
        let index = ids.iter().enumerate().map(|(i, &id)| (id, i as u16)).collect();
        IdTable { ids, index }
    }

    pub fn intern(&mut self, id: u32) -> Result<u16> {
        if let Some(&idx) = self.index.get(&id) {
            return Ok(idx);
        }
        let idx = u16::try_from(self.ids.len())
            .map_err(|_| ImageError::Unsupported("more than 65536 distinct owner ids".into()))?;
        self.ids.push(id);
        self.index.insert(id, idx);
        Ok(idx)
    }

    pub fn get(&self, idx: u16) -> Result<u32> {
        self.ids
            .get(idx as usize)
            .copied()
            .ok_or_else(|| ImageError::corrupt(format!("id index {idx} out of range")))
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ids.len() * ID_ENTRY_SIZE);
        self.ids.iter().for_each(|&id| out.put_u32(id));
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(bytes, "id table");
        let ids = (0..bytes.len() / ID_ENTRY_SIZE).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
        Ok(IdTable::from_ids(ids))
    }
}
