//! Progress reporting and cancellation for long-running scans and rewrites.
//!
//! Every operation that walks the archive file takes a
//! `&mut dyn ProgressReporter`. It is consulted at each buffer refill (scan)
//! or buffer write (export, rewrite, backup): progress is reported in bytes,
//! and a pending cancellation aborts the operation with
//! [`MboxError::Cancelled`](crate::error::MboxError::Cancelled).
//!
//! ```rust,ignore
//! let progress = AtomicProgress::shared();
//! let handle = Arc::clone(&progress);
//! std::thread::spawn(move || { /* ... */ handle.cancel(); });
//! let session = ArchiveSession::open(path, &config, &mut progress.clone())?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{MboxError, Result};

/// Receives byte-level progress and may request cancellation.
pub trait ProgressReporter {
    /// Called periodically with `(bytes_processed, total_bytes)`.
    fn on_progress(&mut self, processed: u64, total: u64) {
        let _ = (processed, total);
    }

    /// Checked after every progress report. Returning `true` aborts the operation.
    fn should_cancel(&self) -> bool {
        false
    }
}

/// No-op reporter.
impl ProgressReporter for () {}

/// A thread-safe progress reporter using atomics.
///
/// Share it with `Arc` so a UI thread can poll the position and call
/// [`AtomicProgress::cancel`] while a worker thread runs the operation.
#[derive(Debug, Default)]
pub struct AtomicProgress {
    processed: AtomicU64,
    total: AtomicU64,
    cancelled: AtomicBool,
}

impl AtomicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared atomic progress reporter.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Requests cancellation. Takes effect at the next buffer boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Clears the cancellation flag and counters so the reporter can be reused.
    pub fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
    }

    /// Completion percentage (0.0 - 100.0).
    pub fn percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.processed() as f64 / total as f64 * 100.0
        }
    }
}

impl ProgressReporter for AtomicProgress {
    fn on_progress(&mut self, processed: u64, total: u64) {
        self.processed.store(processed, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    fn should_cancel(&self) -> bool {
        self.is_cancelled()
    }
}

impl ProgressReporter for Arc<AtomicProgress> {
    fn on_progress(&mut self, processed: u64, total: u64) {
        self.processed.store(processed, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    fn should_cancel(&self) -> bool {
        self.is_cancelled()
    }
}

/// Adapts a closure `(processed, total) -> bool`; returning `false` cancels.
pub struct ProgressFn<F> {
    callback: F,
    cancelled: bool,
}

impl<F> ProgressFn<F>
where
    F: FnMut(u64, u64) -> bool,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            cancelled: false,
        }
    }
}

impl<F> ProgressReporter for ProgressFn<F>
where
    F: FnMut(u64, u64) -> bool,
{
    fn on_progress(&mut self, processed: u64, total: u64) {
        if !(self.callback)(processed, total) {
            self.cancelled = true;
        }
    }

    fn should_cancel(&self) -> bool {
        self.cancelled
    }
}

/// Report progress, then fail with `Cancelled` if the reporter asks to stop.
pub(crate) fn checkpoint(
    reporter: &mut dyn ProgressReporter,
    processed: u64,
    total: u64,
) -> Result<()> {
    reporter.on_progress(processed, total);
    if reporter.should_cancel() {
        return Err(MboxError::Cancelled);
    }
    Ok(())
}
