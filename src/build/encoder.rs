//! Post-order encoding of the scanned tree.
//!
//! Children are encoded before their directory so every directory entry can
//! carry the final reference of its child's inode record. Regular files are
//! taken from the pipeline in the same order the reader streamed them.

use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::{debug, trace, warn};

use super::{BuildState, ImageSource};
use crate::archive::directory::{encode_listing, ListingEntry};
use crate::archive::inode::{DirIndexEntry, DirInfo, FileInfo, Inode, InodeBody};
use crate::common::{bsd_checksum, FileKind, FragmentRecord, MetaRef, METADATA_SIZE};
use crate::compress::BuildOptions;
use crate::dedup::{Candidate, DedupEntry};
use crate::error::{ImageError, Result};
use crate::fsx;
use crate::progress::ProgressTracker;
use crate::scan::{Entry, EntryMeta, InodeId, InodeInfo};
use crate::workers::{FileData, Pipeline};

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EncodeCounts {
    pub files: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub bytes_read: u64,
}

pub(crate) struct Encoder<'a, 'scope> {
    state: &'a mut BuildState,
    inodes: &'a mut [InodeInfo],
    pipeline: &'a mut Pipeline<'scope>,
    options: &'a BuildOptions,
    image: &'a File,
    image_path: &'a Path,
    progress: &'a ProgressTracker,
    counts: EncodeCounts,
}

impl<'a, 'scope> Encoder<'a, 'scope> {
    pub fn new(
        state: &'a mut BuildState,
        inodes: &'a mut [InodeInfo],
        pipeline: &'a mut Pipeline<'scope>,
        options: &'a BuildOptions,
        image: &'a File,
        image_path: &'a Path,
        progress: &'a ProgressTracker,
    ) -> Self {
        Encoder { state, inodes, pipeline, options, image, image_path, progress, counts: EncodeCounts::default() }
    }

    /// Encode the whole tree. Returns the root's inode reference.
    pub fn encode(mut self, root: &Entry) -> Result<(MetaRef, EncodeCounts)> {
        let root_ref = self.encode_dir(root, 0)?;
        if self.pipeline.next_file()?.is_some() {
            return Err(ImageError::Other("pipeline streamed a file nobody asked for".into()));
        }
        Ok((root_ref, self.counts))
    }

    fn encode_dir(&mut self, dir: &Entry, parent: u32) -> Result<MetaRef> {
        let number = self.inodes[dir.inode].number;
        for child in &dir.children {
            let info = &self.inodes[child.inode];
            if info.existing || info.inode_ref.is_some() || info.failed {
                continue;
            }
            if info.kind == FileKind::Directory {
                self.encode_dir(child, number)?;
            } else {
                self.encode_leaf(child.inode)?;
            }
        }
        self.pipeline.interrupt().check()?;

        let entries: Vec<ListingEntry> = dir
            .children
            .iter()
            .filter_map(|c| {
                let info = &self.inodes[c.inode];
                info.inode_ref.map(|inode| ListingEntry {
                    name: c.name.as_bytes().to_vec(),
                    kind: info.kind,
                    number: info.number,
                    inode,
                })
            })
            .collect();

        let table = &mut self.state.dir_table;
        let start_logical = table.logical_len();
        let listing_ref = table.position();
        let listing = encode_listing(&entries, start_logical)?;
        table.append(&listing.bytes)?;

        let size = listing.bytes.len() as u64;
        let page = METADATA_SIZE as u64;
        let spans_pages = size > 0 && start_logical / page != (start_logical + size - 1) / page;
        let index = if spans_pages {
            listing
                .runs
                .iter()
                .map(|run| {
                    let dir_page = u32::try_from(table.page_start(run.logical / page))
                        .map_err(|_| ImageError::Unsupported("directory table larger than 4 GiB".into()))?;
                    Ok(DirIndexEntry { listing_offset: run.listing_offset, dir_page, name: run.first_name.clone() })
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        let listing_size = u32::try_from(size)
            .map_err(|_| ImageError::Unsupported("directory listing larger than 4 GiB".into()))?;
        trace!(number, entries = entries.len(), listing_size, indexed = !index.is_empty(), "directory listing");

        let body = InodeBody::Dir(DirInfo { listing: listing_ref, listing_size, parent, index });
        self.write_inode(dir.inode, body)
    }

    fn encode_leaf(&mut self, id: InodeId) -> Result<()> {
        let kind = self.inodes[id].kind;
        let body = match kind {
            FileKind::Regular => match self.store_file(id)? {
                Some(file) => InodeBody::File(file),
                None => return Ok(()),
            },
            FileKind::Symlink => {
                let info = &self.inodes[id];
                let target = info
                    .symlink_target
                    .clone()
                    .ok_or_else(|| ImageError::Other(format!("symlink {} has no target", info.source.display()).into()))?;
                InodeBody::Symlink(target)
            }
            FileKind::BlockDevice | FileKind::CharDevice => {
                let rdev = self.inodes[id].meta.rdev;
                InodeBody::Device { major: fsx::major(rdev), minor: fsx::minor(rdev) }
            }
            FileKind::Fifo | FileKind::Socket => InodeBody::Ipc,
            FileKind::Directory => return Err(ImageError::Other("directory passed as a leaf".into())),
        };
        self.write_inode(id, body)?;
        Ok(())
    }

    fn owner(&mut self, meta: &EntryMeta) -> Result<(u16, u16)> {
        let (uid, gid) = if self.options.all_root {
            (0, 0)
        } else {
            (self.options.force_uid.unwrap_or(meta.uid), self.options.force_gid.unwrap_or(meta.gid))
        };
        Ok((self.state.uids.intern(uid)?, self.state.gids.intern(gid)?))
    }

    /// Append the inode record and remember where it went.
    fn write_inode(&mut self, id: InodeId, body: InodeBody) -> Result<MetaRef> {
        let meta = self.inodes[id].meta.clone();
        let (uid_idx, gid_idx) = self.owner(&meta)?;
        let info = &self.inodes[id];
        let inode = Inode {
            kind: info.kind,
            mode: meta.mode,
            uid_idx,
            gid_idx,
            mtime: meta.mtime,
            number: info.number,
            nlink: info.nlink,
            body,
        };
        let mut record = Vec::new();
        inode.encode(&mut record)?;

        let inode_ref = self.state.inode_table.position();
        self.state.inode_table.append(&record)?;
        if let Some(slot) = (inode.number as usize).checked_sub(1).and_then(|i| self.state.lookup.get_mut(i)) {
            *slot = inode_ref.pack();
        }
        self.inodes[id].inode_ref = Some(inode_ref);
        Ok(inode_ref)
    }

    /// Take the next file from the pipeline and decide where its content
    /// lives. `None` when the file could not be read.
    fn store_file(&mut self, id: InodeId) -> Result<Option<FileInfo>> {
        let size = self.inodes[id].meta.size;
        if size == 0 {
            self.counts.files += 1;
            self.progress.record_file(0, false);
            return Ok(Some(FileInfo { start: 0, size: 0, sparse: 0, fragment: FragmentRecord::NONE, blocks: Vec::new() }));
        }

        let data = self
            .pipeline
            .next_file()?
            .ok_or_else(|| ImageError::Other("pipeline ran out of files".into()))?;
        if data.inode != id {
            return Err(ImageError::Other(format!("pipeline returned inode {} instead of {id}", data.inode).into()));
        }
        if let Some(error) = &data.error {
            debug!(path = %self.inodes[id].source.display(), error, "leaving unreadable file out of the image");
            self.inodes[id].failed = true;
            self.counts.failed += 1;
            self.progress.record_file(size, false);
            return Ok(None);
        }
        self.counts.files += 1;
        self.counts.bytes_read += size;

        let duplicate = if self.options.dedup { self.find_duplicate(&data)? } else { None };
        let is_duplicate = duplicate.is_some();
        let file = match duplicate {
            Some(hit) => {
                if !self.pipeline.discard(&data) {
                    warn!(path = %self.inodes[id].source.display(), "duplicate blocks could not be reclaimed");
                }
                trace!(path = %self.inodes[id].source.display(), start = hit.start, "duplicate content");
                self.counts.duplicates += 1;
                FileInfo { start: hit.start, size, sparse: data.sparse, fragment: hit.fragment, blocks: hit.blocks }
            }
            None => {
                let tail = data.tail.as_deref();
                let fragment = match tail {
                    Some(tail) => self.pipeline.add_tail(tail)?,
                    None => FragmentRecord::NONE,
                };
                if self.options.dedup {
                    self.state.dedup.register(DedupEntry {
                        size,
                        start: data.start.get(),
                        blocks: data.blocks.clone(),
                        fragment,
                        block_checksum: None,
                        fragment_checksum: tail.map(|t| bsd_checksum(t, 0)),
                    });
                }
                FileInfo { start: data.start.get(), size, sparse: data.sparse, fragment, blocks: data.blocks }
            }
        };
        self.progress.record_file(size, is_duplicate);
        Ok(Some(file))
    }

    fn find_duplicate(&self, data: &FileData) -> Result<Option<DedupEntry>> {
        let tail = data.tail.as_deref();
        let worth_checking = if data.blocks.is_empty() {
            tail.is_some_and(|t| self.state.dedup.probe_by_size_and_fragment_checksum(data.size, bsd_checksum(t, 0)))
        } else {
            self.state.dedup.probe_by_size(data.size)
        };
        if !worth_checking {
            return Ok(None);
        }
        // The candidate's blocks must be on disk before they are compared.
        self.pipeline.sync()?;
        let source = ImageSource {
            file: self.image,
            path: self.image_path,
            packer: self.pipeline.packer(),
            algo: self.options.algo,
            block_size: self.options.block_size,
            interrupt: self.pipeline.interrupt(),
        };
        let candidate = Candidate { size: data.size, start: data.start.get(), blocks: &data.blocks, tail };
        self.state.dedup.resolve(&candidate, &source)
    }
}
