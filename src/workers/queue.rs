//! Bounded FIFO channel whose blocking operations give up on interrupt.

use std::sync::Arc;

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::error::{ImageError, Result};
use crate::interrupt::Interrupt;

/// A bounded multi-producer, multi-consumer queue.
///
/// `put` blocks while the queue is full and `get` while it is empty; both
/// return `Err(Interrupted)` as soon as the attached interrupt is raised.
/// `get` returns `Ok(None)` once every producer handle has been dropped
/// and the queue has drained.
pub struct BoundedQueue<T> {
    tx: Option<Sender<T>>,
    rx: Receiver<T>,
    interrupt: Arc<Interrupt>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, interrupt: Arc<Interrupt>) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        BoundedQueue { tx: Some(tx), rx, interrupt }
    }

    pub fn put(&self, item: T) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(ImageError::Interrupted)?;
        self.interrupt.check()?;
        select! {
            send(tx, item) -> res => res.map_err(|_| ImageError::Interrupted),
            recv(self.interrupt.signal()) -> _ => Err(ImageError::Interrupted),
        }
    }

    pub fn get(&self) -> Result<Option<T>> {
        // select! picks among ready arms at random; queued items must not win.
        self.interrupt.check()?;
        select! {
            recv(self.rx) -> item => Ok(item.ok()),
            recv(self.interrupt.signal()) -> _ => Err(ImageError::Interrupted),
        }
    }

    /// Drop this handle's producer side. Consumers see end-of-stream once
    /// every clone has closed (or been dropped).
    pub fn close(&mut self) {
        self.tx = None;
    }
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        BoundedQueue {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            interrupt: Arc::clone(&self.interrupt),
        }
    }
}
