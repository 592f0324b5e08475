//! Cooperative cancellation shared by every pipeline stage.
//!
//! An [`Interrupt`] is raised from outside (the Ctrl-C handler thread in the CLI,
//! or a test) and polled at well-defined points. Raising it also disconnects an
//! internal channel, so any thread parked in a queue or buffer-pool wait wakes up
//! immediately instead of waiting for its peer.
//!
//! Interrupts form a tree: a pipeline creates a child of the user-facing
//! interrupt so it can stop its own threads on a fatal error without marking
//! the whole operation as user-cancelled.
//!
//! Work that must run to completion once started, such as restoring an image
//! after a failed append, holds a [`Shield`]; the CLI waits for it before a
//! forced exit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{ImageError, Result};

#[derive(Debug)]
pub struct Interrupt {
    raised: AtomicUsize,
    waker: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
    children: Mutex<Vec<Weak<Interrupt>>>,
    shields: AtomicUsize,
}

/// Held while work that must not be cut short is running.
#[must_use]
#[derive(Debug)]
pub struct Shield<'a>(&'a Interrupt);

impl Drop for Shield<'_> {
    fn drop(&mut self) {
        self.0.shields.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Interrupt {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = bounded(0);
        Arc::new(Interrupt {
            raised: AtomicUsize::new(0),
            waker: Mutex::new(Some(tx)),
            signal: rx,
            children: Mutex::new(Vec::new()),
            shields: AtomicUsize::new(0),
        })
    }

    /// Create an interrupt that is raised whenever `self` is raised, but can
    /// also be raised on its own.
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        let child = Interrupt::new();
        let mut children = lock(&self.children);
        // Checked under the lock so a concurrent `raise` cannot miss the child.
        if self.is_raised() {
            drop(children);
            child.raise();
        } else {
            children.retain(|w| w.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        child
    }

    /// Raise the interrupt. Returns how many times it has been raised so far.
    pub fn raise(&self) -> usize {
        let count = self.raised.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            // Dropping the only sender disconnects `signal`, waking every select.
            lock(&self.waker).take();
            let children: Vec<_> = lock(&self.children).drain(..).collect();
            for child in children.iter().filter_map(Weak::upgrade) {
                child.raise();
            }
        }
        count
    }

    pub fn count(&self) -> usize {
        self.raised.load(Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.count() > 0
    }

    /// Poll point: returns `Err(Interrupted)` once raised.
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(ImageError::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn shield(&self) -> Shield<'_> {
        self.shields.fetch_add(1, Ordering::SeqCst);
        Shield(self)
    }

    pub fn is_shielded(&self) -> bool {
        self.shields.load(Ordering::SeqCst) > 0
    }

    /// Block until no [`Shield`] is held.
    pub fn wait_unshielded(&self) {
        while self.is_shielded() {
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// A receiver that never yields a value and becomes disconnected when the
    /// interrupt is raised. Meant to be used as an arm of `select!`.
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::select;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[test]
    fn raise_counts_and_checks() {
        let int = Interrupt::new();
        assert!(int.check().is_ok());
        assert_eq!(int.raise(), 1);
        assert_eq!(int.raise(), 2);
        assert!(matches!(int.check(), Err(ImageError::Interrupted)));
    }

    #[test]
    fn child_follows_parent_but_not_reverse() {
        let parent = Interrupt::new();
        let child = parent.child();
        child.raise();
        assert!(!parent.is_raised());

        let other = parent.child();
        parent.raise();
        assert!(other.is_raised());
        // created after the parent was raised
        assert!(parent.child().is_raised());
    }

    #[test]
    fn raise_wakes_blocked_select() {
        let int = Interrupt::new();
        let (_tx, rx) = bounded::<u32>(1);
        let waiter = {
            let int = Arc::clone(&int);
            thread::spawn(move || {
                select! {
                    recv(rx) -> _ => false,
                    recv(int.signal()) -> _ => true,
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        int.raise();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn forced_exit_waits_for_shield() {
        let int = Interrupt::new();
        assert!(!int.is_shielded());
        let done = Arc::new(AtomicBool::new(false));
        let shield = int.shield();
        let waiter = {
            let (int, done) = (Arc::clone(&int), Arc::clone(&done));
            thread::spawn(move || {
                int.wait_unshielded();
                done.load(Ordering::SeqCst)
            })
        };
        let started = Instant::now();
        thread::sleep(Duration::from_millis(30));
        done.store(true, Ordering::SeqCst);
        drop(shield);
        assert!(waiter.join().unwrap(), "waiter returned before the shield was dropped");
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!int.is_shielded());
    }
}
