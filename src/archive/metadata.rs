//! Paged metadata tables.
//!
//! Records are appended to an 8 KiB staging page. A full page is compressed
//! and appended to the table behind a 2-byte header: bit 15 set means the
//! payload is stored raw, bits 0..14 give the payload length on disk.
//!
//! A table is addressed two ways. Callers writing records only need the
//! *logical* position (bytes appended so far); a [`MetaRef`] for it is the
//! compressed start of the page holding that byte plus the offset inside the
//! page. The mapping is known for every page that has been or is being filled.

use std::collections::HashMap;

use crate::common::{MetaRef, METADATA_RAW_BIT, METADATA_SIZE};
use crate::compress::{CompressionAlgo, Packed};
use crate::error::{ImageError, Result};

/// Accumulates records and emits compressed metadata pages.
#[derive(Debug, Clone)]
pub struct MetadataWriter {
    algo: CompressionAlgo,
    staging: Vec<u8>,
    /// Compressed pages written so far, headers included.
    table: Vec<u8>,
    /// Compressed start of every flushed page, in order.
    page_starts: Vec<u64>,
}

impl MetadataWriter {
    pub fn new(algo: CompressionAlgo) -> Self {
        MetadataWriter {
            algo,
            staging: Vec::with_capacity(METADATA_SIZE),
            table: Vec::new(),
            page_starts: Vec::new(),
        }
    }

    /// Continue an existing table. The last page is decompressed back into
    /// staging so new records follow the old ones without a gap; every
    /// reference into the old table stays valid.
    pub fn resume(algo: CompressionAlgo, decode_algo: CompressionAlgo, table: &[u8]) -> Result<Self> {
        let pages = split_pages(table)?;
        let mut writer = MetadataWriter::new(algo);
        let Some((&(last_start, _), full)) = pages.split_last() else {
            return Ok(writer);
        };
        let last = decode_page(decode_algo, &table[last_start as usize..])?;
        writer.table.extend_from_slice(&table[..last_start as usize]);
        writer.page_starts = full.iter().map(|&(start, _)| start).collect();
        if last.len() == METADATA_SIZE {
            // A full last page is kept as is.
            writer.table.extend_from_slice(&table[last_start as usize..]);
            writer.page_starts.push(last_start);
        } else {
            writer.staging = last;
        }
        Ok(writer)
    }

    /// Number of record bytes appended over the table's lifetime.
    pub fn logical_len(&self) -> u64 {
        self.page_starts.len() as u64 * METADATA_SIZE as u64 + self.staging.len() as u64
    }

    /// Reference to the next byte that will be appended.
    pub fn position(&self) -> MetaRef {
        MetaRef::new(self.table.len() as u64, self.staging.len() as u16)
    }

    /// Compressed start of logical page `index`; the page being filled starts
    /// at the current end of the table.
    pub fn page_start(&self, index: u64) -> u64 {
        self.page_starts
            .get(index as usize)
            .copied()
            .unwrap_or(self.table.len() as u64)
    }

    /// [`MetaRef`] of a logical position that has already been appended.
    pub fn reference(&self, logical: u64) -> MetaRef {
        let page = logical / METADATA_SIZE as u64;
        MetaRef::new(self.page_start(page), (logical % METADATA_SIZE as u64) as u16)
    }

    pub fn append(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let room = METADATA_SIZE - self.staging.len();
            let take = room.min(bytes.len());
            self.staging.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.staging.len() == METADATA_SIZE {
                self.flush_page()?;
            }
        }
        Ok(())
    }

    fn flush_page(&mut self) -> Result<()> {
        self.page_starts.push(self.table.len() as u64);
        encode_page(self.algo, &self.staging, &mut self.table)?;
        self.staging.clear();
        Ok(())
    }

    /// Flush the partial page and return the compressed table.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if !self.staging.is_empty() {
            self.flush_page()?;
        }
        Ok(self.table)
    }

    /// Like [`finish`](Self::finish) but leaves `self` usable, so a snapshot
    /// of the writer is not consumed.
    pub fn finished_bytes(&self) -> Result<Vec<u8>> {
        self.clone().finish()
    }
}

/// Compress one page of at most [`METADATA_SIZE`] bytes and append it, with
/// its header, to `out`.
pub fn encode_page(algo: CompressionAlgo, page: &[u8], out: &mut Vec<u8>) -> Result<()> {
    debug_assert!(!page.is_empty() && page.len() <= METADATA_SIZE);
    match algo.compress(page, page.len())? {
        Packed::Compressed(packed) => {
            out.extend_from_slice(&(packed.len() as u16).to_le_bytes());
            out.extend_from_slice(&packed);
        }
        Packed::Raw => {
            out.extend_from_slice(&(page.len() as u16 | METADATA_RAW_BIT).to_le_bytes());
            out.extend_from_slice(page);
        }
    }
    Ok(())
}

/// Walk page headers, returning `(start, on_disk_len)` per page.
fn split_pages(table: &[u8]) -> Result<Vec<(u64, usize)>> {
    let mut pages = Vec::new();
    let mut pos = 0usize;
    while pos < table.len() {
        let (len, _) = page_header(&table[pos..])?;
        if pos + 2 + len > table.len() {
            return Err(ImageError::corrupt(format!("metadata page at {pos} runs past the table")));
        }
        pages.push((pos as u64, 2 + len));
        pos += 2 + len;
    }
    Ok(pages)
}

fn page_header(bytes: &[u8]) -> Result<(usize, bool)> {
    if bytes.len() < 2 {
        return Err(ImageError::corrupt("truncated metadata page header"));
    }
    let header = u16::from_le_bytes([bytes[0], bytes[1]]);
    let len = (header & !METADATA_RAW_BIT) as usize;
    if len == 0 || len > METADATA_SIZE {
        return Err(ImageError::corrupt(format!("metadata page length {len}")));
    }
    Ok((len, header & METADATA_RAW_BIT != 0))
}

/// Decode the single page starting at the beginning of `bytes`.
pub fn decode_page(algo: CompressionAlgo, bytes: &[u8]) -> Result<Vec<u8>> {
    let (len, raw) = page_header(bytes)?;
    let payload = bytes
        .get(2..2 + len)
        .ok_or_else(|| ImageError::corrupt("truncated metadata page"))?;
    if raw {
        Ok(payload.to_vec())
    } else {
        algo.decompress(payload, METADATA_SIZE)
    }
}

/// A fully decoded metadata table: the concatenated record stream plus the
/// map from compressed page start to logical offset.
#[derive(Debug, Default)]
pub struct DecodedTable {
    pub bytes: Vec<u8>,
    pages: HashMap<u64, usize>,
    end: u64,
}

impl DecodedTable {
    pub fn decode(algo: CompressionAlgo, table: &[u8]) -> Result<Self> {
        let mut out = DecodedTable::default();
        for (start, _) in split_pages(table)? {
            let page = decode_page(algo, &table[start as usize..])?;
            out.pages.insert(start, out.bytes.len());
            // Only the last page may be short.
            if out.bytes.len() % METADATA_SIZE != 0 {
                return Err(ImageError::corrupt("short metadata page before the end of a table"));
            }
            out.bytes.extend_from_slice(&page);
        }
        out.end = table.len() as u64;
        Ok(out)
    }

    /// Logical offset of a reference.
    pub fn offset(&self, r: MetaRef) -> Result<usize> {
        // Empty records written last point just past the final page.
        if r.page == self.end && r.offset == 0 {
            return Ok(self.bytes.len());
        }
        let base = self
            .pages
            .get(&r.page)
            .ok_or_else(|| ImageError::corrupt(format!("reference {r} does not start a metadata page")))?;
        let off = base + r.offset as usize;
        if off > self.bytes.len() {
            return Err(ImageError::corrupt(format!("reference {r} points past the table")));
        }
        Ok(off)
    }

    /// Bytes from `r` to the end of the table.
    pub fn slice_from(&self, r: MetaRef) -> Result<&[u8]> {
        Ok(&self.bytes[self.offset(r)?..])
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}
