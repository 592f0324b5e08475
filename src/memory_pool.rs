use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::error::{ImageError, Result};
use crate::interrupt::Interrupt;

/// A fixed-capacity pool of reusable byte buffers.
///
/// The pool hands out at most `count` buffers of `buf_size` bytes each, so
/// `count * buf_size` bounds the memory held by whoever shares the pool.
/// [`BufferPool::acquire`] blocks while every buffer is in use; a buffer is
/// returned (and one waiter woken) when the [`Buffer`] is dropped, on every
/// exit path including errors and panics.
///
/// Buffers are allocated lazily on first use, so a generous `count` costs
/// nothing until the pipeline actually fills up.
///
/// It is purposely `Clone + Send + Sync` so every pipeline stage can hold a handle.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    buf_size: usize,
    count: usize,
    interrupt: Arc<Interrupt>,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `buf_size` bytes. Blocked
    /// `acquire` calls give up with `Interrupted` once `interrupt` is raised.
    pub fn new(buf_size: usize, count: usize, interrupt: Arc<Interrupt>) -> Self {
        let count = count.max(1);
        let (free_tx, free_rx) = bounded(count);
        for _ in 0..count {
            // Cannot fail: the channel has exactly `count` slots.
            let _ = free_tx.try_send(Vec::new());
        }
        BufferPool {
            inner: Arc::new(PoolInner { free_tx, free_rx, buf_size, count, interrupt }),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.count
    }

    /// Number of buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.inner.count - self.inner.free_rx.len()
    }

    /// Take a buffer from the pool, blocking while the pool is exhausted.
    pub fn acquire(&self) -> Result<Buffer> {
        self.inner.interrupt.check()?;
        let data = select! {
            recv(self.inner.free_rx) -> slot => slot.map_err(|_| ImageError::Interrupted)?,
            recv(self.inner.interrupt.signal()) -> _ => return Err(ImageError::Interrupted),
        };
        self.wrap(data)
    }

    fn wrap(&self, mut data: Vec<u8>) -> Result<Buffer> {
        data.clear();
        if data.capacity() < self.inner.buf_size {
            if data.try_reserve_exact(self.inner.buf_size).is_err() {
                // Give the slot back so the pool stays consistent for the unwinding path.
                let _ = self.inner.free_tx.try_send(Vec::new());
                return Err(ImageError::OutOfMemory);
            }
        }
        Ok(Buffer { data, pool: Arc::clone(&self.inner), on_release: None })
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buf_size", &self.inner.buf_size)
            .field("count", &self.inner.count)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`]. Dereferences to its filled bytes.
pub struct Buffer {
    data: Vec<u8>,
    pool: Arc<PoolInner>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl Buffer {
    /// Maximum number of bytes this buffer is meant to hold.
    pub fn capacity(&self) -> usize {
        self.pool.buf_size
    }

    /// Bytes still free before the buffer reaches its nominal capacity.
    pub fn remaining(&self) -> usize {
        self.pool.buf_size.saturating_sub(self.data.len())
    }

    pub fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Replace the content with `bytes`, keeping the allocation.
    pub fn replace_with(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Run `callback` when this buffer is released back to the pool.
    /// Used to tie an upstream resource's lifetime to the buffer's last consumer.
    pub fn set_release_callback<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_release = Some(Box::new(callback));
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.data.len()).finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(callback) = self.on_release.take() {
            callback();
        }
        let data = std::mem::take(&mut self.data);
        // The pool never has more outstanding slots than channel capacity.
        let _ = self.pool.free_tx.try_send(data);
    }
}
