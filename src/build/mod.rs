//! Image creation.
//!
//! A build scans the sources into a [`Tree`], streams file content through
//! the [`Pipeline`](crate::workers::Pipeline) while the encoder writes inode
//! and directory records in post-order, then appends the metadata tables and
//! finally the superblock. The superblock is written last, so an image whose
//! build did not finish never looks valid.
//!
//! With [`BuildOptions::append`] the existing image is loaded first and the
//! new tree is merged into its root; see [`append`].

mod append;
mod encoder;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use scopeguard::ScopeGuard;
use serde::Serialize;
use tracing::{debug, info, warn};

use self::encoder::{EncodeCounts, Encoder};
use crate::archive::metadata::MetadataWriter;
use crate::archive::tables::{encode_indexed, encode_u64s, FragmentEntry, IdTable, LOOKUP_UNUSED};
use crate::archive::{SuperFlags, Superblock, NO_TABLE};
use crate::common::{round_up, FragmentRecord, ImageOffset, DEVICE_ALIGN, SUPERBLOCK_SIZE};
use crate::compress::{BuildOptions, CompressionAlgo};
use crate::dedup::{ContentSource, DedupIndex};
use crate::error::{ImageError, Result};
use crate::interrupt::Interrupt;
use crate::progress::ProgressTracker;
use crate::scan::{Scanner, Tree};
use crate::workers::fragments::{FragmentPacker, FragmentTable};
use crate::workers::{FileJob, Pipeline, PipelineConfig};

/// What a finished build produced.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub output: PathBuf,
    pub inode_count: u32,
    /// Regular files stored, duplicates included.
    pub files: u64,
    pub duplicates: u64,
    /// Files left out because their content could not be read.
    pub failed: u64,
    pub bytes_read: u64,
    pub bytes_used: u64,
    pub fragment_blocks: u64,
    pub appended: bool,
    pub elapsed: Duration,
}

/// Everything about an image that is not file data: the superblock fields,
/// the metadata tables being built and the dedup index. Cloned before an
/// append so a failed append can be rolled back.
#[derive(Debug, Clone)]
pub(crate) struct BuildState {
    pub superblock: Superblock,
    pub inode_table: MetadataWriter,
    pub dir_table: MetadataWriter,
    pub uids: IdTable,
    pub gids: IdTable,
    /// Inode number minus one to packed inode reference.
    pub lookup: Vec<u64>,
    pub fragments: Vec<FragmentEntry>,
    pub dedup: DedupIndex,
    /// Where new file data starts.
    pub data_start: ImageOffset,
}

impl BuildState {
    fn fresh(options: &BuildOptions) -> Self {
        BuildState {
            superblock: Superblock::new(options.block_size, options.algo, flags_for(options)),
            inode_table: MetadataWriter::new(options.metadata_algo()),
            dir_table: MetadataWriter::new(options.metadata_algo()),
            uids: IdTable::default(),
            gids: IdTable::default(),
            lookup: Vec::new(),
            fragments: Vec::new(),
            dedup: DedupIndex::new(),
            data_start: ImageOffset(SUPERBLOCK_SIZE),
        }
    }
}

pub(crate) fn flags_for(options: &BuildOptions) -> SuperFlags {
    let mut flags = SuperFlags::default();
    flags.set(SuperFlags::UNCOMPRESSED_INODES, !options.compress_inodes);
    flags.set(SuperFlags::UNCOMPRESSED_DATA, !options.compress_data);
    flags.set(SuperFlags::UNCOMPRESSED_FRAGMENTS, !options.compress_fragments);
    flags.set(SuperFlags::NO_FRAGMENTS, !options.fragments);
    flags.set(SuperFlags::ALWAYS_FRAGMENTS, options.always_fragments);
    flags.set(SuperFlags::DUPLICATES, options.dedup);
    flags.set(SuperFlags::EXPORTABLE, options.exportable);
    flags
}

/// Build an image at `output` from `sources`, or add them to it when
/// `options.append` is set.
///
/// A failed fresh build removes the partial output; a failed append restores
/// the image to its previous state.
pub fn build_image(
    sources: &[PathBuf],
    output: &Path,
    options: &BuildOptions,
    interrupt: &Arc<Interrupt>,
) -> Result<BuildSummary> {
    options.validate()?;
    if sources.is_empty() {
        return Err(ImageError::InvalidOptions("no source paths given".into()));
    }
    let started = Instant::now();
    let tree = Scanner::new(&options.excludes).scan(sources)?;
    interrupt.check()?;

    if options.append {
        return append::append_to_image(tree, output, options, interrupt, started);
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .map_err(|e| ImageError::io(e, output))?;
    let file = Arc::new(file);
    let cleanup = scopeguard::guard(output.to_path_buf(), |path| {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "could not remove partial image");
        }
    });

    let mut tree = tree;
    let inode_count = tree.assign_numbers(1, None);
    let mut state = BuildState::fresh(options);
    let fragments = FragmentTable::with_existing(&[]);
    let summary = write_image(&mut state, tree, inode_count, &file, output, options, fragments, interrupt, started)?;

    ScopeGuard::into_inner(cleanup);
    Ok(summary)
}

/// Stream content, encode the tree and write every table and the
/// superblock. `state` holds whatever the image already contains.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_image(
    state: &mut BuildState,
    tree: Tree,
    inode_count: u32,
    file: &Arc<File>,
    path: &Path,
    options: &BuildOptions,
    fragments: Arc<FragmentTable>,
    interrupt: &Arc<Interrupt>,
    started: Instant,
) -> Result<BuildSummary> {
    let progress = ProgressTracker::new(options.progress.clone(), options.progress_interval);
    let (total_files, total_bytes) = tree.content_totals();
    progress.set_totals(total_files, total_bytes);

    let jobs: Vec<FileJob> = tree
        .content_order()
        .into_iter()
        .map(|id| (id, &tree.inodes[id]))
        .filter(|(_, info)| info.meta.size > 0)
        .map(|(id, info)| FileJob { inode: id, path: info.source.clone(), size: info.meta.size })
        .collect();
    debug!(files = total_files, bytes = total_bytes, streamed = jobs.len(), "encoding tree");

    if options.exportable {
        state.lookup.resize(inode_count as usize, LOOKUP_UNUSED);
    }
    let Tree { root, mut inodes } = tree;
    let config = PipelineConfig::from_options(options);

    let (root_ref, counts, stats, data_end) = thread::scope(|s| -> Result<_> {
        let mut pipeline = Pipeline::start(
            s,
            jobs,
            config,
            Arc::clone(file),
            path,
            state.data_start,
            Arc::clone(&fragments),
            interrupt,
        );
        let encoded = Encoder::new(state, &mut inodes, &mut pipeline, options, file, path, &progress).encode(&root);
        let (encoded, outcome) = match encoded {
            Ok(done) => (Some(done), Ok(())),
            Err(e) => (None, Err(e)),
        };
        let stats = pipeline.finish(outcome)?;
        let (root_ref, counts) = encoded.ok_or_else(|| ImageError::Other("encoder returned no root".into()))?;
        Ok((root_ref, counts, stats, pipeline.cursor().position()))
    })?;
    progress.finish();
    interrupt.check()?;

    state.fragments = fragments.entries()?;
    let sb = &mut state.superblock;
    sb.inode_count = inode_count;
    sb.root_inode = root_ref;
    sb.fragment_count = state.fragments.len() as u32;
    sb.flags.set(SuperFlags::EXPORTABLE, options.exportable);

    let bytes_used = write_tables(state, file, path, data_end, options.metadata_algo())?;
    commit(&state.superblock, file, path)?;

    let EncodeCounts { files, duplicates, failed, bytes_read } = counts;
    info!(
        path = %path.display(),
        inodes = inode_count,
        files,
        duplicates,
        bytes_used,
        "image written"
    );
    Ok(BuildSummary {
        output: path.to_path_buf(),
        inode_count,
        files,
        duplicates,
        failed,
        bytes_read,
        bytes_used,
        fragment_blocks: stats.fragment_blocks,
        appended: options.append,
        elapsed: started.elapsed(),
    })
}

/// Appends tables one after another from a starting offset.
struct TableWriter<'a> {
    file: &'a File,
    path: &'a Path,
    pos: u64,
}

impl TableWriter<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<u64> {
        let at = self.pos;
        self.file.write_all_at(bytes, at).map_err(|e| ImageError::io(e, self.path))?;
        self.pos += bytes.len() as u64;
        Ok(at)
    }

    /// Write an indexed table and return the offset of its page index.
    fn put_indexed(&mut self, algo: CompressionAlgo, entries: &[u8]) -> Result<u64> {
        let (bytes, index_start) = encode_indexed(algo, entries, self.pos)?;
        self.put(&bytes)?;
        Ok(index_start)
    }
}

/// Write the tables after the data, in image order, and fill in their
/// locations. Returns the number of bytes the image uses.
fn write_tables(state: &mut BuildState, file: &File, path: &Path, data_end: ImageOffset, algo: CompressionAlgo) -> Result<u64> {
    let mut out = TableWriter { file, path, pos: data_end.get() };
    let sb = &mut state.superblock;

    sb.inode_table_start = out.put(&state.inode_table.finished_bytes()?)?;
    sb.directory_table_start = out.put(&state.dir_table.finished_bytes()?)?;
    sb.directory_table_end = out.pos;
    sb.fragment_table_start = if state.fragments.is_empty() {
        NO_TABLE
    } else {
        out.put_indexed(algo, &FragmentEntry::encode_all(&state.fragments))?
    };
    sb.lookup_table_start = if sb.flags.contains(SuperFlags::EXPORTABLE) && sb.inode_count > 0 {
        state.lookup.resize(sb.inode_count as usize, LOOKUP_UNUSED);
        out.put_indexed(algo, &encode_u64s(&state.lookup))?
    } else {
        NO_TABLE
    };
    sb.uid_count = state.uids.len() as u32;
    sb.uid_table_start = out.put_indexed(algo, &state.uids.encode())?;
    sb.gid_count = state.gids.len() as u32;
    sb.gid_table_start = out.put_indexed(algo, &state.gids.encode())?;
    sb.bytes_used = out.pos;
    debug!(
        inode_table = sb.inode_table_start,
        directory_table = sb.directory_table_start,
        bytes_used = sb.bytes_used,
        "tables written"
    );
    Ok(sb.bytes_used)
}

/// Zero the padding, write the superblock and flush the image to disk.
fn commit(superblock: &Superblock, file: &File, path: &Path) -> Result<()> {
    let io = |e| ImageError::io(e, path);
    let end = round_up(superblock.bytes_used, DEVICE_ALIGN);
    let pad = (end - superblock.bytes_used) as usize;
    if pad > 0 {
        file.write_all_at(&vec![0u8; pad], superblock.bytes_used).map_err(io)?;
    }
    file.set_len(end).map_err(io)?;
    file.write_all_at(&superblock.encode(), 0).map_err(io)?;
    file.sync_all().map_err(io)
}

/// Reads back content that is already part of the image being built, so
/// the dedup index can verify candidates.
pub(crate) struct ImageSource<'a> {
    pub file: &'a File,
    pub path: &'a Path,
    pub packer: &'a FragmentPacker,
    pub algo: CompressionAlgo,
    pub block_size: u32,
    pub interrupt: &'a Interrupt,
}

impl ContentSource for ImageSource<'_> {
    fn read_stored(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset).map_err(|e| ImageError::io(e, self.path))?;
        Ok(buf)
    }

    fn fragment_bytes(&self, fragment: FragmentRecord) -> Result<Vec<u8>> {
        if let Some(bytes) = self.packer.unwritten_bytes(fragment) {
            return Ok(bytes.to_vec());
        }
        let entry = self.packer.table().wait_written(fragment.index, self.interrupt)?;
        let stored = self.read_stored(entry.start, entry.size.on_disk() as usize)?;
        let block = if entry.size.is_raw() {
            stored
        } else {
            self.algo.decompress(&stored, self.block_size as usize)?
        };
        block
            .get(fragment.offset as usize..)
            .and_then(|rest| rest.get(..fragment.size as usize))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| ImageError::corrupt(format!("fragment {} is too short", fragment.index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::reader::ImageReader;
    use std::fs;

    fn options() -> BuildOptions {
        BuildOptions { block_size: 4096, workers: 2, ..Default::default() }
    }

    #[test]
    fn empty_directory_builds_a_valid_image() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        let img = dir.path().join("out.img");

        let summary = build_image(&[src], &img, &options(), &Interrupt::new()).unwrap();
        assert_eq!(summary.inode_count, 1);
        assert_eq!(fs::metadata(&img).unwrap().len() % DEVICE_ALIGN, 0);

        let reader = ImageReader::open(&img).unwrap();
        let root = reader.root().unwrap();
        assert!(reader.read_dir(&root).unwrap().is_empty());
        assert_eq!(reader.superblock().fragment_table_start, NO_TABLE);
    }

    #[test]
    fn flags_follow_options() {
        let opts = BuildOptions { compress_data: false, fragments: false, exportable: false, ..Default::default() };
        let flags = flags_for(&opts);
        assert!(flags.contains(SuperFlags::UNCOMPRESSED_DATA));
        assert!(flags.contains(SuperFlags::NO_FRAGMENTS));
        assert!(!flags.contains(SuperFlags::EXPORTABLE));
        assert!(!flags.contains(SuperFlags::UNCOMPRESSED_INODES));
    }

    #[test]
    fn failed_build_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("f"), vec![7u8; 20_000]).unwrap();
        let img = dir.path().join("out.img");

        let int = Interrupt::new();
        int.raise();
        assert!(matches!(build_image(&[src], &img, &options(), &int), Err(ImageError::Interrupted)));
        assert!(!img.exists());
    }
}
