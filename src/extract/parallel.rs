//! Parallel file writes.
//!
//! Every regular file is reassembled and written by one rayon task. The
//! image is memory-mapped, so tasks share the [`ImageReader`] and read their
//! blocks without any coordination. Sparse runs become holes: the writer
//! seeks past them and the final `set_len` covers a trailing one.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use tracing::trace;

use super::apply_attributes;
use super::reader::{Chunk, ImageReader};
use crate::archive::inode::Inode;
use crate::error::{ImageError, Result};
use crate::interrupt::Interrupt;

/// A regular file to write.
pub(super) struct FileTask<'a> {
    pub path: PathBuf,
    pub inode: &'a Inode,
}

/// Write every task's content and attributes. Returns the number of
/// content bytes written.
pub(super) fn write_files(
    reader: &ImageReader,
    tasks: &[FileTask<'_>],
    owners: bool,
    workers: usize,
    interrupt: &Interrupt,
) -> Result<u64> {
    let threads = if workers == 0 { num_cpus::get().max(1) } else { workers };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("extract-{i}"))
        .build()
        .map_err(|e| ImageError::Other(Box::new(e)))?;
    let written = AtomicU64::new(0);

    pool.install(|| {
        tasks.par_iter().try_for_each(|task| -> Result<()> {
            interrupt.check()?;
            let bytes = write_one(reader, task)?;
            apply_attributes(reader, &task.path, task.inode, owners)?;
            written.fetch_add(bytes, Ordering::Relaxed);
            Ok(())
        })
    })?;
    Ok(written.into_inner())
}

fn write_one(reader: &ImageReader, task: &FileTask<'_>) -> Result<u64> {
    let file_info = task
        .inode
        .as_file()
        .ok_or_else(|| ImageError::corrupt(format!("inode {} is not a regular file", task.inode.number)))?;
    let io = |e| ImageError::io(e, &task.path);
    let file = File::create(&task.path).map_err(io)?;
    let mut out = BufWriter::new(file);
    reader.for_each_chunk(file_info, |chunk| {
        match chunk {
            Chunk::Data(bytes) => out.write_all(bytes).map_err(io)?,
            Chunk::Hole(len) => {
                out.seek(SeekFrom::Current(len as i64)).map_err(io)?;
            }
        }
        Ok(())
    })?;
    let file = out.into_inner().map_err(|e| io(e.into_error()))?;
    file.set_len(file_info.size).map_err(io)?;
    trace!(path = %task.path.display(), size = file_info.size, "file written");
    Ok(file_info.size)
}
