//! Content deduplication.
//!
//! Every stored file is registered under its size. When a new file finishes
//! streaming, entries of the same size are candidates; a candidate only
//! matches after its block list is identical, cheap 16-bit checksums agree,
//! and the stored bytes compare equal. Checksums of registered entries are
//! computed on first need and cached.
//!
//! The index lock is only held to copy candidates out and to store computed
//! checksums, never while reading from the image.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::common::{bsd_checksum, BlockSize, FragmentRecord};
use crate::error::Result;

/// Where a stored file's content lives in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    pub size: u64,
    pub start: u64,
    pub blocks: Vec<BlockSize>,
    pub fragment: FragmentRecord,
    pub block_checksum: Option<u16>,
    pub fragment_checksum: Option<u16>,
}

impl DedupEntry {
    pub fn stored_len(&self) -> u64 {
        self.blocks.iter().map(|b| b.on_disk() as u64).sum()
    }
}

/// A file that has just been streamed and is looking for an earlier copy.
/// Its blocks are already in the image; its tail (if any) is still in memory.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub size: u64,
    pub start: u64,
    pub blocks: &'a [BlockSize],
    pub tail: Option<&'a [u8]>,
}

/// Read access to stored content, used to checksum and verify candidates.
pub trait ContentSource {
    /// Stored (possibly compressed) bytes at an absolute image offset.
    fn read_stored(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Uncompressed bytes of a file's fragment.
    fn fragment_bytes(&self, fragment: FragmentRecord) -> Result<Vec<u8>>;
}

/// Checksum over a file's stored blocks, read block by block.
fn stored_checksum(source: &dyn ContentSource, start: u64, blocks: &[BlockSize]) -> Result<u16> {
    let mut sum = 0u16;
    let mut offset = start;
    for block in blocks.iter().filter(|b| !b.is_sparse()) {
        let bytes = source.read_stored(offset, block.on_disk() as usize)?;
        sum = bsd_checksum(&bytes, sum);
        offset += block.on_disk() as u64;
    }
    Ok(sum)
}

fn stored_equal(source: &dyn ContentSource, a: u64, b: u64, blocks: &[BlockSize]) -> Result<bool> {
    let (mut a, mut b) = (a, b);
    for block in blocks.iter().filter(|b| !b.is_sparse()) {
        let len = block.on_disk() as usize;
        if source.read_stored(a, len)? != source.read_stored(b, len)? {
            return Ok(false);
        }
        a += len as u64;
        b += len as u64;
    }
    Ok(true)
}

#[derive(Debug, Default)]
struct Buckets {
    by_size: HashMap<u64, Vec<DedupEntry>>,
    entries: usize,
}

/// Index of stored content keyed by file size.
#[derive(Debug, Default)]
pub struct DedupIndex {
    inner: Mutex<Buckets>,
}

impl Clone for DedupIndex {
    fn clone(&self) -> Self {
        let buckets = self.lock();
        DedupIndex {
            inner: Mutex::new(Buckets { by_size: buckets.by_size.clone(), entries: buckets.entries }),
        }
    }
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Buckets> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any stored file has this size.
    pub fn probe_by_size(&self, size: u64) -> bool {
        self.lock().by_size.get(&size).is_some_and(|b| !b.is_empty())
    }

    /// Whether a stored file has this size and, as far as is known, this
    /// fragment checksum. Entries whose checksum was not computed yet count
    /// as possible matches.
    pub fn probe_by_size_and_fragment_checksum(&self, size: u64, checksum: u16) -> bool {
        self.lock()
            .by_size
            .get(&size)
            .is_some_and(|bucket| bucket.iter().any(|e| e.fragment_checksum.map_or(true, |c| c == checksum)))
    }

    pub fn register(&self, entry: DedupEntry) {
        let mut buckets = self.lock();
        buckets.by_size.entry(entry.size).or_default().push(entry);
        buckets.entries += 1;
    }

    fn cache_checksums(&self, size: u64, position: usize, block: Option<u16>, fragment: Option<u16>) {
        let mut buckets = self.lock();
        if let Some(entry) = buckets.by_size.get_mut(&size).and_then(|b| b.get_mut(position)) {
            if block.is_some() {
                entry.block_checksum = block;
            }
            if fragment.is_some() {
                entry.fragment_checksum = fragment;
            }
        }
    }

    /// Find a stored file with exactly the candidate's content.
    pub fn resolve(&self, candidate: &Candidate<'_>, source: &dyn ContentSource) -> Result<Option<DedupEntry>> {
        let entries: Vec<(usize, DedupEntry)> = match self.lock().by_size.get(&candidate.size) {
            Some(bucket) => bucket
                .iter()
                .enumerate()
                .filter(|(_, e)| e.blocks == candidate.blocks && e.fragment.is_none() == candidate.tail.is_none())
                .map(|(i, e)| (i, e.clone()))
                .collect(),
            None => return Ok(None),
        };
        if entries.is_empty() {
            return Ok(None);
        }

        let has_data = candidate.blocks.iter().any(|b| !b.is_sparse());
        let mut own_block_sum = None;
        let own_fragment_sum = candidate.tail.map(|t| bsd_checksum(t, 0));

        for (position, entry) in entries {
            let mut block_sum = entry.block_checksum;
            let mut fragment_sum = entry.fragment_checksum;

            if has_data {
                let own = match own_block_sum {
                    Some(sum) => sum,
                    None => {
                        let sum = stored_checksum(source, candidate.start, candidate.blocks)?;
                        own_block_sum = Some(sum);
                        sum
                    }
                };
                let theirs = match block_sum {
                    Some(sum) => sum,
                    None => stored_checksum(source, entry.start, &entry.blocks)?,
                };
                block_sum = Some(theirs);
                if theirs != own {
                    self.cache_checksums(candidate.size, position, block_sum, None);
                    continue;
                }
            }

            let mut their_fragment = None;
            if let Some(own) = own_fragment_sum {
                let theirs = match fragment_sum {
                    Some(sum) => sum,
                    None => {
                        let bytes = source.fragment_bytes(entry.fragment)?;
                        let sum = bsd_checksum(&bytes, 0);
                        their_fragment = Some(bytes);
                        sum
                    }
                };
                fragment_sum = Some(theirs);
                if theirs != own {
                    self.cache_checksums(candidate.size, position, block_sum, fragment_sum);
                    continue;
                }
            }
            self.cache_checksums(candidate.size, position, block_sum, fragment_sum);

            if has_data && !stored_equal(source, candidate.start, entry.start, candidate.blocks)? {
                continue;
            }
            if let Some(tail) = candidate.tail {
                let theirs = match their_fragment {
                    Some(bytes) => bytes,
                    None => source.fragment_bytes(entry.fragment)?,
                };
                if theirs != tail {
                    continue;
                }
            }
            return Ok(Some(DedupEntry { block_checksum: block_sum, fragment_checksum: fragment_sum, ..entry }));
        }
        Ok(None)
    }
}
