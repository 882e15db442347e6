//! Progress reporting and cooperative cancellation.
//!
//! A [`ConversionControl`] travels with every conversion. It carries the
//! [`CancellationToken`] the service trips when a request exceeds its
//! deadline, and an optional [`ProgressCallback`] that observes how many
//! output frames have been produced.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gifsmith::{ConversionStage, ProgressCallback, ProgressInfo, UploadRequest};
//!
//! struct PrintProgress;
//!
//! impl ProgressCallback for PrintProgress {
//!     fn on_progress(&self, info: &ProgressInfo) {
//!         if let Some(pct) = info.percentage {
//!             println!("[{:?}] {pct:.1}%", info.stage);
//!         }
//!     }
//! }
//!
//! let request = UploadRequest::from_bytes(std::fs::read("clip.mp4")?)
//!     .with_progress(Arc::new(PrintProgress));
//! # Ok::<(), std::io::Error>(())
//! ```

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use crate::error::ConversionError;

/// Where a conversion request currently is.
///
/// Requests move strictly forward:
/// `Received → Staged → Probed → Converting → Registered`, or to `Failed`
/// from any stage after `Received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionStage {
    Received,
    Staged,
    Probed,
    Converting,
    Registered,
    Failed,
}

/// A snapshot of conversion progress.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// The stage that produced this report.
    pub stage: ConversionStage,
    /// Output frames produced so far.
    pub current: u64,
    /// Output frames planned, if known.
    pub total: Option<u64>,
    /// Completion percentage (0.0 – 100.0), if `total` is known.
    pub percentage: Option<f32>,
    /// Wall-clock time since the stage started.
    pub elapsed: Duration,
    /// Estimated time remaining, based on current throughput.
    pub estimated_remaining: Option<Duration>,
    /// Source timestamp of the most recent output frame.
    pub current_timestamp: Option<Duration>,
}

/// Receives progress updates during a conversion.
///
/// Callbacks run on the conversion's worker thread, so implementations must
/// be [`Send`] and [`Sync`] and should return quickly. They observe but
/// cannot halt the work; cancellation goes through [`CancellationToken`].
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, info: &ProgressInfo);
}

pub(crate) struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _info: &ProgressInfo) {}
}

/// Cooperative cancellation flag shared between threads.
///
/// Clones observe the same state. The transcoder checks the token between
/// every packet and every emitted frame.
///
/// ```
/// use gifsmith::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_view = token.clone();
/// token.cancel();
/// assert!(worker_view.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<(), ConversionError> {
        if self.is_cancelled() {
            Err(ConversionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation and progress plumbing for one conversion.
#[derive(Clone)]
pub struct ConversionControl {
    pub(crate) cancellation: CancellationToken,
    pub(crate) progress: Arc<dyn ProgressCallback>,
    pub(crate) batch_size: u64,
}

impl Debug for ConversionControl {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ConversionControl")
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl Default for ConversionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionControl {
    /// A fresh token, no progress callback, reporting every frame.
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            progress: Arc::new(NoOpProgress),
            batch_size: 1,
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Report every `size` frames. Clamped to a minimum of 1.
    #[must_use]
    pub fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Shorthand for `self.cancellation().check()`.
    pub fn check_cancelled(&self) -> Result<(), ConversionError> {
        self.cancellation.check()
    }

    pub(crate) fn tracker(&self, stage: ConversionStage, total: Option<u64>) -> ProgressTracker {
        ProgressTracker::new(Arc::clone(&self.progress), stage, total, self.batch_size)
    }
}

/// Counts produced items and emits batched callbacks.
pub(crate) struct ProgressTracker {
    callback: Arc<dyn ProgressCallback>,
    stage: ConversionStage,
    total: Option<u64>,
    current: u64,
    batch_size: u64,
    start_time: Instant,
    since_last_report: u64,
}

impl ProgressTracker {
    pub(crate) fn new(
        callback: Arc<dyn ProgressCallback>,
        stage: ConversionStage,
        total: Option<u64>,
        batch_size: u64,
    ) -> Self {
        Self {
            callback,
            stage,
            total,
            current: 0,
            batch_size: batch_size.max(1),
            start_time: Instant::now(),
            since_last_report: 0,
        }
    }

    pub(crate) fn advance(&mut self, timestamp: Option<Duration>) {
        self.current += 1;
        self.since_last_report += 1;

        if self.since_last_report >= self.batch_size {
            self.report(timestamp);
            self.since_last_report = 0;
        }
    }

    pub(crate) fn finish(&mut self) {
        self.report(None);
    }

    fn report(&self, timestamp: Option<Duration>) {
        let elapsed = self.start_time.elapsed();

        let percentage = self
            .total
            .filter(|&total| total > 0)
            .map(|total| (self.current.min(total) as f32 / total as f32) * 100.0);

        let estimated_remaining = if self.current > 0 {
            self.total.map(|total| {
                let remaining = total.saturating_sub(self.current);
                elapsed.mul_f64(remaining as f64 / self.current as f64)
            })
        } else {
            None
        };

        self.callback.on_progress(&ProgressInfo {
            stage: self.stage,
            current: self.current,
            total: self.total,
            percentage,
            elapsed,
            estimated_remaining,
            current_timestamp: timestamp,
        });
    }
}
