//! Progress tracking for image builds.
//!
//! The consumer side of the build pipeline records every finished file; the
//! tracker turns those counters into throttled [`ProgressState`] snapshots for
//! whatever callback the caller installed (the CLI draws a bar from them).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::compress::ProgressFn;

pub const DEFAULT_EMIT_INTERVAL: Duration = Duration::from_millis(200);

/// Current progress of a build.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub total_files: u64,
    pub processed_files: u64,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    /// Files whose content was already present in the image.
    pub duplicate_files: u64,
    pub elapsed_time: Duration,
    pub speed_mbps: f32,
    pub progress_percent: f32,
}

impl ProgressState {
    /// Calculate estimated time remaining based on current speed
    pub fn estimated_time_remaining(&self) -> Duration {
        if self.speed_mbps <= 0.0 {
            return Duration::from_secs(0);
        }
        let remaining_bytes = self.total_bytes.saturating_sub(self.processed_bytes);
        let remaining_mb = remaining_bytes as f32 / (1024.0 * 1024.0);
        Duration::from_secs_f32((remaining_mb / self.speed_mbps).max(0.0))
    }
}

pub struct ProgressTracker {
    total_files: AtomicU64,
    total_bytes: AtomicU64,
    processed_files: AtomicU64,
    processed_bytes: AtomicU64,
    duplicate_files: AtomicU64,
    start_time: Instant,
    last_emit_time: Mutex<Instant>,
    emit_interval: Duration,
    callback: Option<ProgressFn>,
}

impl ProgressTracker {
    pub fn new(callback: Option<ProgressFn>, emit_interval: Duration) -> Self {
        let now = Instant::now();
        ProgressTracker {
            total_files: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            processed_files: AtomicU64::new(0),
            processed_bytes: AtomicU64::new(0),
            duplicate_files: AtomicU64::new(0),
            start_time: now,
            last_emit_time: Mutex::new(now),
            emit_interval,
            callback,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    pub fn set_totals(&self, files: u64, bytes: u64) {
        self.total_files.store(files, Ordering::Relaxed);
        self.total_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn record_file(&self, size: u64, duplicate: bool) {
        self.processed_files.fetch_add(1, Ordering::Relaxed);
        self.processed_bytes.fetch_add(size, Ordering::Relaxed);
        if duplicate {
            self.duplicate_files.fetch_add(1, Ordering::Relaxed);
        }
        self.maybe_emit();
    }

    /// Emit a final snapshot with every counter at its total.
    pub fn finish(&self) {
        if let Some(callback) = &self.callback {
            let mut state = self.state();
            state.progress_percent = 100.0;
            state.processed_files = state.total_files;
            state.processed_bytes = state.total_bytes;
            callback(state);
        }
    }

    fn maybe_emit(&self) {
        let Some(callback) = &self.callback else { return };
        let now = Instant::now();
        {
            let mut last = match self.last_emit_time.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if now.duration_since(*last) < self.emit_interval {
                return;
            }
            *last = now;
        }
        callback(self.state());
    }

    pub fn state(&self) -> ProgressState {
        let total_files = self.total_files.load(Ordering::Relaxed);
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        let processed_files = self.processed_files.load(Ordering::Relaxed);
        let processed_bytes = self.processed_bytes.load(Ordering::Relaxed);
        let elapsed_time = self.start_time.elapsed();

        let speed_mbps = if elapsed_time.as_secs_f32() > 0.0 {
            processed_bytes as f32 / (1024.0 * 1024.0) / elapsed_time.as_secs_f32()
        } else {
            0.0
        };
        // Weighted: bytes 70%, files 30%. Empty files still move the bar.
        let ratio = |done: u64, total: u64| if total > 0 { done as f32 / total as f32 * 100.0 } else { 0.0 };
        let progress_percent = if total_bytes == 0 {
            ratio(processed_files, total_files)
        } else {
            ratio(processed_bytes, total_bytes) * 0.7 + ratio(processed_files, total_files) * 0.3
        }
        .min(100.0);

        ProgressState {
            total_files,
            processed_files,
            total_bytes,
            processed_bytes,
            duplicate_files: self.duplicate_files.load(Ordering::Relaxed),
            elapsed_time,
            speed_mbps,
            progress_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_progress_tracker() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let tracker = ProgressTracker::new(
            Some(Arc::new(move |s: ProgressState| sink.lock().unwrap().push(s))),
            Duration::ZERO,
        );
        tracker.set_totals(4, 1024);
        tracker.record_file(512, false);
        tracker.record_file(512, true);

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates[1].progress_percent > updates[0].progress_percent);
        assert_eq!(updates[1].duplicate_files, 1);
        assert_eq!(updates[1].processed_bytes, 1024);
    }

    #[test]
    fn test_throttled_and_finish() {
        let count = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&count);
        let tracker = ProgressTracker::new(
            Some(Arc::new(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            })),
            Duration::from_secs(3600),
        );
        tracker.set_totals(100, 0);
        for _ in 0..50 {
            tracker.record_file(0, false);
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tracker.finish();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.state().processed_files, 50);
    }
}
