//! Streaming build pipeline.
//!
//! ```text
//! reader ──► compressor workers ──► consumer ──► writer
//!                                      │   ▲
//!                                      ▼   │
//!                              fragment compressor
//! ```
//!
//! The reader cuts files into block-sized buffers drawn from a bounded
//! arena, so memory use is fixed no matter how large the input is. Workers
//! compress in any order; the consumer puts items back into reader order,
//! reserves image space for each block and hands it to the writer. Results
//! are therefore identical for any worker count.

pub mod fragments;
pub mod queue;
pub mod writer;

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{Scope, ScopedJoinHandle};

use tracing::{debug, warn};

use self::fragments::{compress_fragments, FragmentPacker, FragmentTable};
use self::queue::BoundedQueue;
use self::writer::{writer_channel, WriteCursor, WriteData, WriterHandle};
use crate::common::{BlockSize, FragmentRecord, ImageOffset};
use crate::compress::{BuildOptions, CompressionAlgo, Packed};
use crate::error::{ImageError, Result};
use crate::interrupt::Interrupt;
use crate::memory_pool::{Buffer, BufferPool};
use crate::scan::InodeId;

/// Fragment blocks that may be open, compressing or waiting for the writer.
const FRAGMENT_BUFFERS: usize = 4;

/// A regular file to stream into the image.
#[derive(Debug, Clone)]
pub struct FileJob {
    pub inode: InodeId,
    pub path: PathBuf,
    pub size: u64,
}

/// The subset of [`BuildOptions`] the pipeline needs.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub block_size: u32,
    pub data_algo: CompressionAlgo,
    pub fragment_algo: CompressionAlgo,
    pub fragments: bool,
    pub always_fragments: bool,
    pub workers: usize,
    pub arena_blocks: usize,
}

impl PipelineConfig {
    pub fn from_options(options: &BuildOptions) -> Self {
        PipelineConfig {
            block_size: options.block_size,
            data_algo: options.data_algo(),
            fragment_algo: options.fragment_algo(),
            fragments: options.fragments,
            always_fragments: options.always_fragments,
            workers: options.effective_workers(),
            arena_blocks: options.effective_arena_blocks(),
        }
    }

    /// Length of the tail that goes to a fragment for a file of `size` bytes;
    /// zero when the last partial block is stored as a block.
    fn tail_len(&self, size: u64) -> u64 {
        let bs = self.block_size as u64;
        let rest = size % bs;
        if self.fragments && rest > 0 && (size < bs || self.always_fragments) {
            rest
        } else {
            0
        }
    }
}

enum ReadItem {
    Block(Buffer),
    Tail(Buffer),
    End(Option<String>),
}

enum Processed {
    Block(Buffer, BlockSize),
    Sparse(usize),
    Tail(Buffer),
    End(Option<String>),
}

struct Sequenced<T> {
    seq: u64,
    item: T,
}

/// One file after streaming. Its blocks are already queued for writing.
#[derive(Debug)]
pub struct FileData {
    pub inode: InodeId,
    pub size: u64,
    pub start: ImageOffset,
    pub blocks: Vec<BlockSize>,
    pub sparse: u64,
    pub tail: Option<Buffer>,
    /// Set when the file could not be read; nothing of it remains stored.
    pub error: Option<String>,
}

impl FileData {
    pub fn end(&self) -> ImageOffset {
        self.start.advance(self.blocks.iter().map(|b| b.on_disk() as u64).sum())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub bytes_written: u64,
    pub fragment_blocks: u64,
}

/// Consumer end of the pipeline, owned by the thread that builds the image.
pub struct Pipeline<'scope> {
    jobs: VecDeque<(InodeId, u64)>,
    results: BoundedQueue<Sequenced<Processed>>,
    parked: HashMap<u64, Processed>,
    next_seq: u64,
    cursor: Arc<WriteCursor>,
    writer: WriterHandle,
    packer: FragmentPacker,
    threads: Vec<(&'static str, ScopedJoinHandle<'scope, Result<()>>)>,
    writer_thread: Option<ScopedJoinHandle<'scope, Result<u64>>>,
    interrupt: Arc<Interrupt>,
    done: bool,
}

impl<'scope> Pipeline<'scope> {
    /// Spawn every pipeline thread inside `scope`. New data is placed from
    /// byte `start` of `file` onwards.
    #[allow(clippy::too_many_arguments)]
    pub fn start<'env>(
        scope: &'scope Scope<'scope, 'env>,
        jobs: Vec<FileJob>,
        config: PipelineConfig,
        file: Arc<File>,
        path: &Path,
        start: ImageOffset,
        fragments: Arc<FragmentTable>,
        parent: &Arc<Interrupt>,
    ) -> Self {
        let interrupt = parent.child();
        let arena = BufferPool::new(config.block_size as usize, config.arena_blocks, Arc::clone(&interrupt));
        let fragment_pool = BufferPool::new(config.block_size as usize, FRAGMENT_BUFFERS, Arc::clone(&interrupt));
        debug!(workers = config.workers, arena_blocks = config.arena_blocks, "starting pipeline");

        let (writer, writer_side) = writer_channel(
            file,
            path.to_path_buf(),
            config.arena_blocks + FRAGMENT_BUFFERS,
            Arc::clone(&interrupt),
        );
        let writer_thread = scope.spawn(move || writer_side.run());

        let mut threads = Vec::with_capacity(config.workers + 2);
        let job_list: VecDeque<_> = jobs.iter().map(|j| (j.inode, j.size)).collect();

        let reads = BoundedQueue::new(config.arena_blocks, Arc::clone(&interrupt));
        let mut results = BoundedQueue::new(config.arena_blocks, Arc::clone(&interrupt));

        for _ in 0..config.workers {
            let (input, output, int) = (reads.clone(), results.clone(), Arc::clone(&interrupt));
            let algo = config.data_algo;
            threads.push(("compressor", scope.spawn(move || compress_blocks(algo, input, output, int))));
        }
        {
            let int = Arc::clone(&interrupt);
            threads.push(("reader", scope.spawn(move || read_files(jobs, config, arena, reads, int))));
        }
        results.close();

        let to_compress = BoundedQueue::new(FRAGMENT_BUFFERS, Arc::clone(&interrupt));
        let mut compressed = BoundedQueue::new(FRAGMENT_BUFFERS, Arc::clone(&interrupt));
        {
            let (input, output, int) = (to_compress.clone(), compressed.clone(), Arc::clone(&interrupt));
            let algo = config.fragment_algo;
            threads.push(("fragment compressor", scope.spawn(move || compress_fragments(algo, input, output, int))));
        }
        compressed.close();
        let packer = FragmentPacker::new(fragment_pool, fragments, to_compress, compressed);

        Pipeline {
            jobs: job_list,
            results,
            parked: HashMap::new(),
            next_seq: 0,
            cursor: Arc::new(WriteCursor::new(start)),
            writer,
            packer,
            threads,
            writer_thread: Some(writer_thread),
            interrupt,
            done: false,
        }
    }

    pub fn cursor(&self) -> &WriteCursor {
        &self.cursor
    }

    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    pub fn packer(&self) -> &FragmentPacker {
        &self.packer
    }

    pub fn interrupt(&self) -> &Arc<Interrupt> {
        &self.interrupt
    }

    /// Add a tail to the open fragment block.
    pub fn add_tail(&mut self, tail: &[u8]) -> Result<FragmentRecord> {
        self.packer.add(tail, &self.cursor, &self.writer)
    }

    /// Wait for every queued write to reach the image.
    pub fn sync(&self) -> Result<()> {
        self.writer.sync()
    }

    fn next_item(&mut self) -> Result<Option<Processed>> {
        loop {
            if let Some(item) = self.parked.remove(&self.next_seq) {
                self.next_seq += 1;
                return Ok(Some(item));
            }
            match self.results.get()? {
                Some(Sequenced { seq, item }) if seq == self.next_seq => {
                    self.next_seq += 1;
                    return Ok(Some(item));
                }
                Some(Sequenced { seq, item }) => {
                    self.parked.insert(seq, item);
                }
                None if self.parked.is_empty() => return Ok(None),
                None => return Err(ImageError::Other("pipeline lost a block".into())),
            }
        }
    }

    /// Stream the next file. Its data blocks are placed contiguously from
    /// the current cursor; a file that failed to read leaves nothing behind.
    pub fn next_file(&mut self) -> Result<Option<FileData>> {
        let Some((inode, size)) = self.jobs.pop_front() else {
            return Ok(None);
        };

        let start = self.cursor.position();
        let mut file = FileData { inode, size, start, blocks: Vec::new(), sparse: 0, tail: None, error: None };
        loop {
            let item = self
                .next_item()?
                .ok_or_else(|| ImageError::Other("reader stopped before the last file".into()))?;
            match item {
                Processed::Block(data, block) => {
                    let offset = self.cursor.reserve(block.on_disk() as u64);
                    self.writer.submit(offset, WriteData::Block(data))?;
                    file.blocks.push(block);
                }
                Processed::Sparse(len) => {
                    file.blocks.push(BlockSize::SPARSE);
                    file.sparse += len as u64;
                }
                Processed::Tail(data) => file.tail = Some(data),
                Processed::End(None) => return Ok(Some(file)),
                Processed::End(Some(error)) => {
                    let end = file.end();
                    if !self.cursor.rewind_if(end, start) {
                        warn!(inode, "could not reclaim space of unreadable file");
                    }
                    file.blocks.clear();
                    file.sparse = 0;
                    file.tail = None;
                    file.error = Some(error);
                    return Ok(Some(file));
                }
            }
        }
    }

    /// Drop a file's blocks again (it turned out to be a duplicate).
    /// Returns whether the space was reclaimed.
    pub fn discard(&self, file: &FileData) -> bool {
        self.cursor.rewind_if(file.end(), file.start)
    }

    /// Stop the pipeline. On success every fragment is placed and all data
    /// is written; on failure the threads are cancelled. The returned error
    /// is the most specific one seen by any stage.
    pub fn finish(&mut self, outcome: Result<()>) -> Result<PipelineStats> {
        let outcome = outcome.and_then(|()| {
            if !self.jobs.is_empty() {
                return Err(ImageError::Other("pipeline finished with files left".into()));
            }
            self.packer.finish(&self.cursor, &self.writer)
        });
        if outcome.is_err() {
            self.interrupt.raise();
        }
        self.done = true;
        self.writer.close();

        let mut error = outcome.err();
        let mut keep = |e: ImageError| {
            if error.as_ref().map_or(true, |cur| matches!(cur, ImageError::Interrupted)) {
                error = Some(e);
            }
        };
        for (name, handle) in self.threads.drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => keep(e),
                Err(_) => keep(ImageError::Other(format!("{name} thread panicked").into())),
            }
        }
        let mut bytes_written = 0;
        if let Some(handle) = self.writer_thread.take() {
            match handle.join() {
                Ok(Ok(bytes)) => bytes_written = bytes,
                Ok(Err(e)) => keep(e),
                Err(_) => keep(ImageError::Other("writer thread panicked".into())),
            }
        }
        match error {
            Some(e) => Err(e),
            None => Ok(PipelineStats { bytes_written, fragment_blocks: self.packer.blocks_written() }),
        }
    }
}

impl Drop for Pipeline<'_> {
    fn drop(&mut self) {
        // Scoped threads are joined when the scope ends; make sure they exit.
        if !self.done {
            self.interrupt.raise();
        }
    }
}

struct Emitter {
    next: u64,
    out: BoundedQueue<Sequenced<ReadItem>>,
}

impl Emitter {
    fn send(&mut self, item: ReadItem) -> Result<()> {
        self.out.put(Sequenced { seq: self.next, item })?;
        self.next += 1;
        Ok(())
    }
}

fn read_files(
    jobs: Vec<FileJob>,
    config: PipelineConfig,
    arena: BufferPool,
    out: BoundedQueue<Sequenced<ReadItem>>,
    interrupt: Arc<Interrupt>,
) -> Result<()> {
    let mut emitter = Emitter { next: 0, out };
    let result = (|| {
        for job in &jobs {
            interrupt.check()?;
            match read_one(job, &config, &arena, &mut emitter) {
                Ok(()) => emitter.send(ReadItem::End(None))?,
                Err(ImageError::Interrupted) => return Err(ImageError::Interrupted),
                Err(e @ ImageError::OutOfMemory) => return Err(e),
                Err(e) => {
                    warn!(path = %job.path.display(), error = %e, "skipping unreadable file");
                    emitter.send(ReadItem::End(Some(e.to_string())))?;
                }
            }
        }
        Ok(())
    })();
    if result.is_err() {
        interrupt.raise();
    }
    result
}

fn read_one(job: &FileJob, config: &PipelineConfig, arena: &BufferPool, emitter: &mut Emitter) -> Result<()> {
    let mut file = File::open(&job.path).map_err(|e| ImageError::io(e, &job.path))?;
    let tail = config.tail_len(job.size);
    let mut remaining = job.size;
    while remaining > 0 {
        let len = remaining.min(config.block_size as u64);
        let mut buf = arena.acquire()?;
        buf.as_vec_mut().resize(len as usize, 0);
        file.read_exact(&mut buf).map_err(|e| ImageError::io(e, &job.path))?;
        remaining -= len;
        if remaining == 0 && tail > 0 {
            emitter.send(ReadItem::Tail(buf))?;
        } else {
            emitter.send(ReadItem::Block(buf))?;
        }
    }
    Ok(())
}

fn compress_blocks(
    algo: CompressionAlgo,
    mut input: BoundedQueue<Sequenced<ReadItem>>,
    output: BoundedQueue<Sequenced<Processed>>,
    interrupt: Arc<Interrupt>,
) -> Result<()> {
    input.close();
    let result = (|| {
        while let Some(Sequenced { seq, item }) = input.get()? {
            let item = match item {
                ReadItem::Block(buf) if buf.iter().all(|&b| b == 0) => Processed::Sparse(buf.len()),
                ReadItem::Block(mut buf) => match algo.compress(&buf, buf.len())? {
                    Packed::Compressed(bytes) => {
                        buf.replace_with(&bytes);
                        Processed::Block(buf, BlockSize::compressed(bytes.len()))
                    }
                    Packed::Raw => {
                        let size = BlockSize::raw(buf.len());
                        Processed::Block(buf, size)
                    }
                },
                ReadItem::Tail(buf) => Processed::Tail(buf),
                ReadItem::End(error) => Processed::End(error),
            };
            output.put(Sequenced { seq, item })?;
        }
        Ok(())
    })();
    if result.is_err() {
        interrupt.raise();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(workers: usize) -> PipelineConfig {
        PipelineConfig {
            block_size: 4096,
            data_algo: CompressionAlgo::Zstd { level: 3 },
            fragment_algo: CompressionAlgo::Zstd { level: 3 },
            fragments: true,
            always_fragments: false,
            workers,
            arena_blocks: 8,
        }
    }

    type Streamed = (ImageOffset, Vec<BlockSize>, Option<Vec<u8>>, bool);

    fn stream(dir: &Path, jobs: Vec<FileJob>, workers: usize) -> (Vec<Streamed>, Vec<u8>) {
        let path = dir.join(format!("img-{workers}"));
        let file = Arc::new(File::create(&path).unwrap());
        let int = Interrupt::new();
        let table = Arc::new(FragmentTable::default());
        let files = thread::scope(|s| {
            let mut p = Pipeline::start(s, jobs, config(workers), file, &path, ImageOffset(0), table, &int);
            let mut out = Vec::new();
            while let Some(f) = p.next_file().unwrap() {
                out.push((f.start, f.blocks.clone(), f.tail.as_ref().map(|t| t.to_vec()), f.error.is_some()));
            }
            p.finish(Ok(())).unwrap();
            out
        });
        (files, std::fs::read(&path).unwrap())
    }

    fn jobs(dir: &Path) -> Vec<FileJob> {
        let mut jobs = Vec::new();
        let contents: Vec<Vec<u8>> = vec![
            (0..10_000u32).map(|i| (i % 251) as u8).collect(),
            vec![0u8; 8192],
            b"short tail".to_vec(),
        ];
        for (i, data) in contents.iter().enumerate() {
            let p = dir.join(format!("f{i}"));
            std::fs::write(&p, data).unwrap();
            jobs.push(FileJob { inode: i, path: p, size: data.len() as u64 });
        }
        jobs.push(FileJob { inode: 3, path: dir.join("missing"), size: 100 });
        jobs
    }

    #[test]
    fn output_does_not_depend_on_worker_count() {
        let dir = tempfile::tempdir().unwrap();
        let (one, image_one) = stream(dir.path(), jobs(dir.path()), 1);
        let (many, image_many) = stream(dir.path(), jobs(dir.path()), 4);
        assert_eq!(one, many);
        assert_eq!(image_one, image_many);

        // 10000 bytes = two full blocks plus a partial block kept as a block
        assert_eq!(one[0].1.len(), 3);
        assert!(one[0].2.is_none());
        // all-zero blocks are sparse and take no space
        assert_eq!(one[1].1, vec![BlockSize::SPARSE, BlockSize::SPARSE]);
        assert_eq!(one[2].2.as_deref(), Some(&b"short tail"[..]));
        assert!(one[3].3);
    }
}
