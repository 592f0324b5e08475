//! Directory listings.
//!
//! A listing is a sequence of runs. Each run has a header naming the
//! inode-table page shared by its entries and a base inode number; entries
//! store their in-page offset and a signed delta from the base. A run holds
//! at most 256 entries and never continues across a directory-table page,
//! so a large directory's index can point at any run header.

use std::cmp::Ordering;

use super::{LeReader, PutLe};
use crate::common::{FileKind, MetaRef, METADATA_SIZE};
use crate::error::{ImageError, Result};

pub const MAX_RUN: usize = 256;
const HEADER_SIZE: usize = 12;
const MAX_DELTA: i64 = 32767;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: Vec<u8>,
    pub kind: FileKind,
    pub number: u32,
    pub inode: MetaRef,
}

/// A run header emitted while encoding: where it sits in the listing, the
/// logical directory-table position it will land at, and its first name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStart {
    pub listing_offset: u32,
    pub logical: u64,
    pub first_name: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct EncodedListing {
    pub bytes: Vec<u8>,
    pub runs: Vec<RunStart>,
}

struct Run {
    header_at: usize,
    count: u32,
    inode_page: u64,
    base: u32,
    logical_page: u64,
}

/// Whether `name` can stand as one path component: not empty, not `.` or
/// `..`, and free of `/` and NUL.
pub fn is_valid_name(name: &[u8]) -> bool {
    !name.is_empty() && name != b"." && name != b".." && !name.iter().any(|&b| b == b'/' || b == 0)
}

/// Encode sorted `entries` as a listing that will be appended to the
/// directory table at logical position `start_logical`.
pub fn encode_listing(entries: &[ListingEntry], start_logical: u64) -> Result<EncodedListing> {
    let mut out = EncodedListing::default();
    let mut run: Option<Run> = None;
    let page_of = |len: usize| (start_logical + len as u64) / METADATA_SIZE as u64;

    for entry in entries {
        if !is_valid_name(&entry.name) || entry.name.len() > u16::MAX as usize + 1 {
            return Err(ImageError::InvalidOptions(format!(
                "unusable entry name {:?}",
                String::from_utf8_lossy(&entry.name)
            )));
        }
        let needs_new = match &run {
            None => true,
            Some(r) => {
                r.count as usize == MAX_RUN
                    || r.inode_page != entry.inode.page
                    || (entry.number as i64 - r.base as i64).abs() > MAX_DELTA
                    || page_of(out.bytes.len()) != r.logical_page
            }
        };
        if needs_new {
            if let Some(r) = run.take() {
                patch_count(&mut out.bytes, &r);
            }
            let header_at = out.bytes.len();
            out.runs.push(RunStart {
                listing_offset: header_at as u32,
                logical: start_logical + header_at as u64,
                first_name: entry.name.clone(),
            });
            let inode_page = u32::try_from(entry.inode.page)
                .map_err(|_| ImageError::Unsupported("inode table larger than 4 GiB".into()))?;
            out.bytes.put_u32(0);
            out.bytes.put_u32(inode_page);
            out.bytes.put_u32(entry.number);
            run = Some(Run {
                header_at,
                count: 0,
                inode_page: entry.inode.page,
                base: entry.number,
                logical_page: page_of(header_at),
            });
        }
        if let Some(r) = run.as_mut() {
            out.bytes.put_u16(entry.inode.offset);
            out.bytes.put_i16((entry.number as i64 - r.base as i64) as i16);
            out.bytes.put_u16(entry.kind.code());
            out.bytes.put_u16((entry.name.len() - 1) as u16);
            out.bytes.extend_from_slice(&entry.name);
            r.count += 1;
        }
    }
    if let Some(r) = run {
        patch_count(&mut out.bytes, &r);
    }
    Ok(out)
}

fn patch_count(bytes: &mut [u8], run: &Run) {
    bytes[run.header_at..run.header_at + 4].copy_from_slice(&(run.count - 1).to_le_bytes());
}

/// Iterator over the entries of a listing, starting at a run header.
pub struct ListingReader<'a> {
    r: LeReader<'a>,
    left_in_run: u32,
    inode_page: u64,
    base: i64,
}

impl<'a> ListingReader<'a> {
    /// `bytes` must start at a run header and end where the listing ends.
    pub fn new(bytes: &'a [u8]) -> Self {
        ListingReader { r: LeReader::new(bytes, "directory listing"), left_in_run: 0, inode_page: 0, base: 0 }
    }

    fn next_entry(&mut self) -> Result<Option<ListingEntry>> {
        if self.left_in_run == 0 {
            if self.r.remaining() == 0 {
                return Ok(None);
            }
            if self.r.remaining() < HEADER_SIZE {
                return Err(ImageError::corrupt("truncated directory run header"));
            }
            let count = self.r.u32()? as usize + 1;
            if count > MAX_RUN {
                return Err(ImageError::corrupt(format!("directory run of {count} entries")));
            }
            self.left_in_run = count as u32;
            self.inode_page = self.r.u32()? as u64;
            self.base = self.r.u32()? as i64;
        }
        let offset = self.r.u16()?;
        let delta = self.r.i16()? as i64;
        let code = self.r.u16()?;
        let name_len = self.r.u16()? as usize + 1;
        let name = self.r.bytes(name_len)?.to_vec();
        if !is_valid_name(&name) {
            return Err(ImageError::corrupt(format!(
                "directory entry with unsafe name {:?}",
                String::from_utf8_lossy(&name)
            )));
        }
        let kind = FileKind::from_code(code)
            .ok_or_else(|| ImageError::corrupt(format!("directory entry with type {code}")))?;
        let number = u32::try_from(self.base + delta)
            .map_err(|_| ImageError::corrupt("directory entry inode number out of range"))?;
        self.left_in_run -= 1;
        Ok(Some(ListingEntry { name, kind, number, inode: MetaRef::new(self.inode_page, offset) }))
    }
}

impl Iterator for ListingReader<'_> {
    type Item = Result<ListingEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

pub fn decode_listing(bytes: &[u8]) -> Result<Vec<ListingEntry>> {
    ListingReader::new(bytes).collect()
}

/// Find `name` in a sorted listing, scanning from the run header at
/// `from_offset` and stopping as soon as names sort past it.
pub fn find_entry(bytes: &[u8], from_offset: usize, name: &[u8]) -> Result<Option<ListingEntry>> {
    let start = bytes
        .get(from_offset..)
        .ok_or_else(|| ImageError::corrupt("directory index offset past listing"))?;
    for entry in ListingReader::new(start) {
        let entry = entry?;
        match entry.name.as_slice().cmp(name) {
            Ordering::Less => continue,
            Ordering::Equal => return Ok(Some(entry)),
            Ordering::Greater => return Ok(None),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, number: u32, page: u64) -> ListingEntry {
        ListingEntry { name: name.as_bytes().to_vec(), kind: FileKind::Regular, number, inode: MetaRef::new(page, 40) }
    }

    #[test]
    fn runs_split_on_page_and_delta() {
        let entries = vec![
            entry("a", 10, 0),
            entry("b", 11, 0),
            entry("c", 12, 900),
            entry("d", 12 + 40_000, 900),
        ];
        let listing = encode_listing(&entries, 0).unwrap();
        assert_eq!(listing.runs.len(), 3);
        assert_eq!(listing.runs[1].first_name, b"c");
        assert_eq!(decode_listing(&listing.bytes).unwrap(), entries);
    }

    #[test]
    fn run_never_exceeds_256_entries() {
        let entries: Vec<_> = (0..600).map(|i| entry(&format!("f{i:04}"), 100 + i, 0)).collect();
        let listing = encode_listing(&entries, 0).unwrap();
        assert_eq!(listing.runs.len(), 3);
        for run in &listing.runs {
            let count = u32::from_le_bytes(listing.bytes[run.listing_offset as usize..][..4].try_into().unwrap());
            assert!(count < MAX_RUN as u32);
        }
        assert_eq!(decode_listing(&listing.bytes).unwrap(), entries);
    }

    #[test]
    fn runs_restart_at_directory_page_boundary() {
        let entries: Vec<_> = (0..20).map(|i| entry(&format!("n{i:02}"), 5 + i, 0)).collect();
        let listing = encode_listing(&entries, METADATA_SIZE as u64 - 30).unwrap();
        assert_eq!(listing.runs.len(), 2);
        assert!(listing.runs[1].logical >= METADATA_SIZE as u64);
    }

    #[test]
    fn unsafe_names_are_rejected() {
        for bad in ["..", ".", "a/b", "../z", "nul\0"] {
            assert!(!is_valid_name(bad.as_bytes()), "{bad:?}");
            assert!(encode_listing(&[entry(bad, 2, 0)], 0).is_err(), "{bad:?}");

            // Same-length stand-in, patched on the wire afterwards.
            let stand_in = "q".repeat(bad.len());
            let mut listing = encode_listing(&[entry(&stand_in, 2, 0)], 0).unwrap();
            let at = listing.bytes.len() - bad.len();
            listing.bytes[at..].copy_from_slice(bad.as_bytes());
            assert!(matches!(decode_listing(&listing.bytes), Err(ImageError::Corrupt(_))), "{bad:?}");
        }
        assert!(is_valid_name(b"..."));
        assert!(is_valid_name(b".hidden"));
    }

    #[test]
    fn find_stops_past_name() {
        let entries: Vec<_> = ["alpha", "beta", "gamma"].iter().enumerate().map(|(i, n)| entry(n, i as u32 + 2, 0)).collect();
        let listing = encode_listing(&entries, 0).unwrap();
        assert_eq!(find_entry(&listing.bytes, 0, b"beta").unwrap().unwrap().number, 3);
        assert!(find_entry(&listing.bytes, 0, b"b").unwrap().is_none());
        assert!(find_entry(&listing.bytes, 0, b"zeta").unwrap().is_none());
    }
}
