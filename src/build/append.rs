//! Adding entries to an existing image.
//!
//! The old image is loaded into a [`BuildState`]: its metadata tables are
//! resumed, its fragments and owner ids are kept and its files seed the dedup
//! index. New data then overwrites the old tables, which are rewritten after
//! it. Before anything is written the superblock and everything from the old
//! inode table to the end of the file is saved, so a failed append can put
//! the image back byte for byte.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use scopeguard::ScopeGuard;
use tracing::{debug, error, warn};

use super::{flags_for, write_image, BuildState, BuildSummary};
use crate::archive::directory::ListingEntry;
use crate::archive::metadata::MetadataWriter;
use crate::archive::tables::LOOKUP_UNUSED;
use crate::common::{ImageOffset, SUPERBLOCK_SIZE};
use crate::compress::BuildOptions;
use crate::dedup::{DedupEntry, DedupIndex};
use crate::error::{ImageError, Result};
use crate::extract::reader::ImageReader;
use crate::interrupt::Interrupt;
use crate::scan::{add_child, Entry, EntryMeta, InodeInfo, Tree};
use crate::workers::fragments::FragmentTable;

/// What is kept from the image being appended to.
struct Existing {
    state: BuildState,
    options: BuildOptions,
    root_number: u32,
    root_meta: EntryMeta,
    root_entries: Vec<ListingEntry>,
}

/// Bytes needed to undo an append.
struct Snapshot {
    state: BuildState,
    header: Vec<u8>,
    tail_start: u64,
    tail: Vec<u8>,
    len: u64,
}

impl Snapshot {
    fn take(state: &BuildState, file: &File, path: &Path) -> Result<Self> {
        let io = |e| ImageError::io(e, path);
        let len = file.metadata().map_err(io)?.len();
        let tail_start = state.data_start.get();
        let mut header = vec![0u8; SUPERBLOCK_SIZE as usize];
        file.read_exact_at(&mut header, 0).map_err(io)?;
        let mut tail = vec![0u8; len.saturating_sub(tail_start) as usize];
        file.read_exact_at(&mut tail, tail_start).map_err(io)?;
        Ok(Snapshot { state: state.clone(), header, tail_start, tail, len })
    }

    fn restore(self, file: &File, path: &Path) -> Result<BuildState> {
        let io = |e| ImageError::io(e, path);
        file.write_all_at(&self.tail, self.tail_start).map_err(io)?;
        file.set_len(self.len).map_err(io)?;
        file.write_all_at(&self.header, 0).map_err(io)?;
        file.sync_all().map_err(io)?;
        Ok(self.state)
    }
}

pub(super) fn append_to_image(
    tree: Tree,
    output: &Path,
    options: &BuildOptions,
    interrupt: &Arc<Interrupt>,
    started: Instant,
) -> Result<BuildSummary> {
    if !output.is_file() {
        return Err(ImageError::InvalidOptions(format!(
            "cannot append: {} is not an existing image",
            output.display()
        )));
    }
    // The reader's mapping is gone once `load` returns; the file is about
    // to be rewritten and truncated.
    let Existing { mut state, options, root_number, root_meta, root_entries } = load(output, options)?;
    let old_count = state.superblock.inode_count;

    let mut tree = tree;
    merge(&mut tree, root_meta, root_entries);
    let inode_count = tree.assign_numbers(old_count + 1, Some(root_number)).max(old_count);
    debug!(old = old_count, total = inode_count, "merged into existing root");

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(output)
        .map_err(|e| ImageError::io(e, output))?;
    let file = Arc::new(file);
    let snapshot = Snapshot::take(&state, &file, output)?;
    // Dropped after `rollback`, so a forced exit waits for the restore too.
    let _shield = interrupt.shield();
    let rollback = scopeguard::guard(snapshot, |snapshot| match snapshot.restore(&file, output) {
        Ok(restored) => {
            warn!(path = %output.display(), inodes = restored.superblock.inode_count, "append failed, image restored")
        }
        Err(e) => error!(path = %output.display(), error = %e, "could not restore image after failed append"),
    });

    let fragments = FragmentTable::with_existing(&state.fragments);
    let summary = write_image(&mut state, tree, inode_count, &file, output, &options, fragments, interrupt, started)?;
    ScopeGuard::into_inner(rollback);
    Ok(summary)
}

/// Read the image at `path` and prepare a state that continues it.
fn load(path: &Path, requested: &BuildOptions) -> Result<Existing> {
    let reader = ImageReader::open(path)?;
    let old = reader.superblock().clone();
    let old_algo = reader.algo();

    let mut options = requested.clone();
    if options.block_size != old.block_size {
        debug!(image = old.block_size, requested = options.block_size, "using the image's block size");
        options.block_size = old.block_size;
    }
    if options.algo != old_algo {
        warn!(image = %old_algo, requested = %options.algo, "appending with the image's compressor");
        options.algo = old_algo;
    }

    let root = reader.root()?;
    let root_entries = reader.read_dir(&root)?;
    let root_meta = EntryMeta {
        mode: root.mode,
        uid: reader.uid(&root)?,
        gid: reader.gid(&root)?,
        mtime: root.mtime,
        size: 0,
        rdev: 0,
    };

    let dedup = DedupIndex::new();
    let mut lookup = match reader.lookup_table() {
        Some(table) => table.to_vec(),
        None => vec![LOOKUP_UNUSED; old.inode_count as usize],
    };
    let rebuild_lookup = options.exportable && reader.lookup_table().is_none();
    let slot = |number: u32| (number as usize).checked_sub(1);
    if rebuild_lookup {
        if let Some(entry) = slot(root.number).and_then(|i| lookup.get_mut(i)) {
            *entry = old.root_inode.pack();
        }
    }
    if options.dedup || rebuild_lookup {
        let mut seen = HashSet::new();
        reader.walk(&root, Path::new(""), |_, entry, inode| {
            if rebuild_lookup {
                if let Some(target) = slot(entry.number).and_then(|i| lookup.get_mut(i)) {
                    *target = entry.inode.pack();
                }
            }
            match inode.as_file() {
                Some(file) if options.dedup && file.size > 0 && seen.insert(inode.number) => {
                    dedup.register(DedupEntry {
                        size: file.size,
                        start: file.start,
                        blocks: file.blocks.clone(),
                        fragment: file.fragment,
                        block_checksum: None,
                        fragment_checksum: None,
                    });
                }
                _ => {}
            }
            Ok(())
        })?;
    }
    if !options.exportable {
        lookup.clear();
    }

    let metadata_algo = options.metadata_algo();
    let mut superblock = old.clone();
    superblock.compressor = options.algo.id();
    superblock.flags = flags_for(&options);
    let state = BuildState {
        superblock,
        inode_table: MetadataWriter::resume(metadata_algo, old_algo, reader.inode_table_bytes())?,
        dir_table: MetadataWriter::resume(metadata_algo, old_algo, reader.directory_table_bytes())?,
        uids: reader.uids().clone(),
        gids: reader.gids().clone(),
        lookup,
        fragments: reader.fragments().to_vec(),
        dedup,
        data_start: ImageOffset(old.inode_table_start),
    };
    debug!(
        path = %path.display(),
        inodes = old.inode_count,
        fragments = state.fragments.len(),
        dedup_entries = state.dedup.len(),
        "loaded image for append"
    );
    Ok(Existing { state, options, root_number: root.number, root_meta, root_entries })
}

/// Put the old root entries under the scanned root. The old entries keep
/// their names; new ones that collide are renamed.
fn merge(tree: &mut Tree, root_meta: EntryMeta, old_entries: Vec<ListingEntry>) {
    let root = tree.root.inode;
    tree.inodes[root].meta = root_meta;
    let new_children = std::mem::take(&mut tree.root.children);
    for old in old_entries {
        let id = tree.inodes.len();
        tree.inodes.push(InodeInfo::existing(old.kind, old.number, old.inode));
        tree.root.children.push(Entry { name: OsString::from_vec(old.name), inode: id, children: Vec::new() });
    }
    for child in new_children {
        add_child(&mut tree.root, child);
    }
    tree.finish_dir_links();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::build_image;
    use std::fs;

    #[test]
    fn snapshot_restores_every_byte() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("a"), b"alpha").unwrap();
        let img = dir.path().join("img");
        let opts = BuildOptions { block_size: 4096, workers: 1, ..Default::default() };
        build_image(&[src], &img, &opts, &Interrupt::new()).unwrap();
        let before = fs::read(&img).unwrap();

        let Existing { state, .. } = load(&img, &opts).unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&img).unwrap();
        let snapshot = Snapshot::take(&state, &file, &img).unwrap();
        file.write_all_at(&[0xAA; 300], state.data_start.get()).unwrap();
        file.write_all_at(&[0u8; 16], 0).unwrap();
        file.set_len(before.len() as u64 + 8192).unwrap();
        snapshot.restore(&file, &img).unwrap();
        assert_eq!(fs::read(&img).unwrap(), before);
    }

    #[test]
    fn merge_renames_colliding_names() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("docs")).unwrap();
        let mut tree = crate::scan::Scanner::new(&[]).scan(&[src]).unwrap();
        let old = vec![ListingEntry {
            name: b"docs".to_vec(),
            kind: crate::common::FileKind::Directory,
            number: 2,
            inode: crate::common::MetaRef::new(0, 40),
        }];
        let meta = EntryMeta { mode: 0o700, ..Default::default() };
        merge(&mut tree, meta.clone(), old);

        let names: Vec<_> = tree.root.children.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec![OsString::from("docs"), OsString::from("docs_1")]);
        assert!(tree.inode(&tree.root.children[0]).existing);
        assert_eq!(tree.inode(&tree.root).meta, meta);
        assert_eq!(tree.inode(&tree.root).nlink, 4);
    }
}
