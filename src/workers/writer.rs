//! The writer thread and the shared write cursor.
//!
//! Space in the image is reserved by bumping [`WriteCursor`]; the bytes are
//! then handed to the writer thread, which performs positional writes in
//! whatever order requests arrive. A `None` request is a sync point: the
//! writer acknowledges it once every earlier request is on disk.

use std::fs::File;
use std::ops::Deref;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, trace};

use super::queue::BoundedQueue;
use crate::common::ImageOffset;
use crate::error::{ImageError, Result};
use crate::interrupt::Interrupt;
use crate::memory_pool::Buffer;

/// Next free byte of the image.
#[derive(Debug)]
pub struct WriteCursor {
    pos: Mutex<ImageOffset>,
}

impl WriteCursor {
    pub fn new(start: ImageOffset) -> Self {
        WriteCursor { pos: Mutex::new(start) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ImageOffset> {
        match self.pos.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reserve `len` bytes and return their offset.
    pub fn reserve(&self, len: u64) -> ImageOffset {
        let mut pos = self.lock();
        let at = *pos;
        *pos = at.advance(len);
        at
    }

    pub fn position(&self) -> ImageOffset {
        *self.lock()
    }

    /// Move the cursor back to `to`, but only if nothing was reserved after
    /// `end`. Returns whether it moved.
    pub fn rewind_if(&self, end: ImageOffset, to: ImageOffset) -> bool {
        let mut pos = self.lock();
        if *pos == end {
            *pos = to;
            true
        } else {
            false
        }
    }
}

/// Bytes to be written.
pub enum WriteData {
    Block(Buffer),
    Bytes(Vec<u8>),
}

impl Deref for WriteData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            WriteData::Block(b) => b,
            WriteData::Bytes(v) => v,
        }
    }
}

pub struct WriteRequest {
    pub offset: ImageOffset,
    pub data: WriteData,
}

/// Producer side of the writer thread.
#[derive(Clone)]
pub struct WriterHandle {
    queue: BoundedQueue<Option<WriteRequest>>,
    acks: Receiver<()>,
    interrupt: Arc<Interrupt>,
}

impl WriterHandle {
    pub fn submit(&self, offset: ImageOffset, data: WriteData) -> Result<()> {
        self.queue.put(Some(WriteRequest { offset, data }))
    }

    /// Block until every request submitted so far has been written.
    pub fn sync(&self) -> Result<()> {
        self.queue.put(None)?;
        select! {
            recv(self.acks) -> ack => ack.map_err(|_| ImageError::Interrupted),
            recv(self.interrupt.signal()) -> _ => Err(ImageError::Interrupted),
        }
    }

    /// Stop accepting requests from this handle; the writer exits once all
    /// handles are closed and the queue is drained.
    pub fn close(&mut self) {
        self.queue.close();
    }
}

/// Thread side of the writer.
pub struct Writer {
    file: Arc<File>,
    path: PathBuf,
    queue: BoundedQueue<Option<WriteRequest>>,
    acks: Sender<()>,
    interrupt: Arc<Interrupt>,
}

/// Create the writer's two halves. The returned [`Writer`] is meant to be
/// moved into a thread running [`Writer::run`].
pub fn writer_channel(
    file: Arc<File>,
    path: PathBuf,
    capacity: usize,
    interrupt: Arc<Interrupt>,
) -> (WriterHandle, Writer) {
    let mut queue = BoundedQueue::new(capacity, Arc::clone(&interrupt));
    let handle_queue = queue.clone();
    queue.close();
    let (ack_tx, ack_rx) = bounded(1);
    (
        WriterHandle { queue: handle_queue, acks: ack_rx, interrupt: Arc::clone(&interrupt) },
        Writer { file, path, queue, acks: ack_tx, interrupt },
    )
}

impl Writer {
    /// Write requests until every handle is closed. Returns the number of
    /// bytes written.
    pub fn run(self) -> Result<u64> {
        let mut written = 0u64;
        let result = (|| {
            while let Some(request) = self.queue.get()? {
                match request {
                    Some(WriteRequest { offset, data }) => {
                        trace!(offset = offset.get(), len = data.len(), "write");
                        self.file
                            .write_all_at(&data, offset.get())
                            .map_err(|e| ImageError::io(e, &self.path))?;
                        written += data.len() as u64;
                    }
                    None => {
                        if self.acks.send(()).is_err() {
                            return Err(ImageError::Interrupted);
                        }
                    }
                }
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                debug!(bytes = written, "writer finished");
                Ok(written)
            }
            Err(e) => {
                self.interrupt.raise();
                Err(e)
            }
        }
    }
}
