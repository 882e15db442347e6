//! The conversion orchestrator.
//!
//! [`ConversionService`] is the public entry point. For each
//! [`UploadRequest`] it waits for a worker slot, then on tokio's blocking
//! pool stages the bytes, probes them, plans the conversion, transcodes,
//! and registers the GIF. A request moves through
//! `Received → Staged → Probed → Converting → Registered`; any failure after
//! `Received` ends it in `Failed`. Every path out of the pipeline drops the
//! [`StagedSource`], which deletes the staged bytes.
//!
//! # Example
//!
//! ```no_run
//! use gifsmith::{ConversionOptions, ConversionService, ServiceConfig, UploadRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let service = ConversionService::new(ServiceConfig::from_env()?)?;
//! let request = UploadRequest::from_file("clip.mp4")
//!     .with_filename("clip.mp4")
//!     .with_options(ConversionOptions::new().with_target_width(320));
//!
//! let artifact = service.submit(request).await?;
//! let gif = service.fetch(&artifact.id)?;
//! println!("{} bytes, {} frames", gif.len(), artifact.metadata.frame_count);
//! # Ok(())
//! # }
//! ```

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::configuration::{ConversionLimits, ConversionOptions, ServiceConfig};
use crate::error::ConversionError;
use crate::probe::{FfmpegProber, FormatProber, MediaInfo};
use crate::progress::{ConversionControl, ConversionStage, ProgressCallback, ProgressInfo};
use crate::resample::ConversionPlan;
use crate::storage::{
    ArtifactId, ArtifactMetadata, ConversionArtifact, EvictionReport, NewArtifact, StorageManager,
    suggested_gif_name,
};
use crate::transcode::{GifTranscoder, Transcoder};
use crate::validation::{ValidationReport, validate_media_info};

enum UploadBody {
    Bytes(Vec<u8>),
    Reader(Box<dyn Read + Send>),
    File(PathBuf),
}

/// One upload to convert.
///
/// The filename is advisory: it only seeds the suggested download name and
/// never influences format detection or storage paths.
pub struct UploadRequest {
    body: UploadBody,
    filename: Option<String>,
    options: ConversionOptions,
    progress: Option<Arc<dyn ProgressCallback>>,
}

impl Debug for UploadRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let body = match &self.body {
            UploadBody::Bytes(bytes) => format!("{} bytes", bytes.len()),
            UploadBody::Reader(_) => "stream".to_string(),
            UploadBody::File(path) => path.display().to_string(),
        };
        f.debug_struct("UploadRequest")
            .field("body", &body)
            .field("filename", &self.filename)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl UploadRequest {
    fn with_body(body: UploadBody) -> Self {
        Self {
            body,
            filename: None,
            options: ConversionOptions::default(),
            progress: None,
        }
    }

    /// An upload already held in memory.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::with_body(UploadBody::Bytes(bytes.into()))
    }

    /// An upload streamed from any reader, e.g. a request body.
    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        Self::with_body(UploadBody::Reader(Box::new(reader)))
    }

    /// An upload read from a local file. The file is opened when staging
    /// begins.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::with_body(UploadBody::File(path.into()))
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: ConversionOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }
}

fn open_body(body: UploadBody) -> Result<Box<dyn Read + Send>, ConversionError> {
    Ok(match body {
        UploadBody::Bytes(bytes) => Box::new(Cursor::new(bytes)),
        UploadBody::Reader(reader) => reader,
        UploadBody::File(path) => Box::new(File::open(&path).map_err(|error| {
            ConversionError::InternalStorageError(format!(
                "Failed to open upload {}: {error}",
                path.display()
            ))
        })?),
    })
}

/// Bounded worker pool: a semaphore plus a capped waiting queue.
#[derive(Debug)]
struct ConversionLimiter {
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    max_waiting: usize,
    max_wait: Duration,
}

impl ConversionLimiter {
    fn new(config: &ServiceConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_conversions.max(1))),
            waiting: AtomicUsize::new(0),
            max_waiting: config.max_queued_conversions,
            max_wait: config.queue_wait,
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, ConversionError> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(permit);
        }

        let ahead = self.waiting.fetch_add(1, Ordering::SeqCst);
        if ahead >= self.max_waiting {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(ConversionError::Overloaded(
                "all conversion workers are busy; retry later".to_string(),
            ));
        }

        // A permit may have been released while joining the queue.
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Ok(permit);
        }

        let result = if self.max_wait.is_zero() {
            Err(ConversionError::Overloaded(
                "all conversion workers are busy; retry later".to_string(),
            ))
        } else {
            match tokio::time::timeout(self.max_wait, Arc::clone(&self.semaphore).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(ConversionError::Overloaded(
                    "conversion service is shutting down".to_string(),
                )),
                Err(_) => Err(ConversionError::Overloaded(format!(
                    "no conversion worker became free within {:.0}s",
                    self.max_wait.as_secs_f64()
                ))),
            }
        };

        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Logs state transitions of one request and mirrors them to its progress
/// callback.
struct RequestTrace {
    number: u64,
    stage: Mutex<ConversionStage>,
    progress: Option<Arc<dyn ProgressCallback>>,
    started: Instant,
}

impl RequestTrace {
    fn new(number: u64, progress: Option<Arc<dyn ProgressCallback>>) -> Self {
        log::info!("Request #{number}: {:?}", ConversionStage::Received);
        Self {
            number,
            stage: Mutex::new(ConversionStage::Received),
            progress,
            started: Instant::now(),
        }
    }

    fn enter(&self, stage: ConversionStage) {
        log::info!("Request #{}: {stage:?}", self.number);
        self.record(stage);
    }

    fn fail(&self, error: &ConversionError) {
        let reached = *self.stage.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        log::warn!(
            "Request #{}: {:?} at {reached:?} after {:.2}s: {error}",
            self.number,
            ConversionStage::Failed,
            self.started.elapsed().as_secs_f64(),
        );
        self.record(ConversionStage::Failed);
    }

    fn record(&self, stage: ConversionStage) {
        *self.stage.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = stage;
        if let Some(callback) = &self.progress {
            callback.on_progress(&ProgressInfo {
                stage,
                current: 0,
                total: None,
                percentage: None,
                elapsed: self.started.elapsed(),
                estimated_remaining: None,
                current_timestamp: None,
            });
        }
    }
}

struct ServiceInner {
    config: ServiceConfig,
    limits: ConversionLimits,
    storage: StorageManager,
    prober: Arc<dyn FormatProber>,
    transcoder: Arc<dyn Transcoder>,
    limiter: ConversionLimiter,
    requests: AtomicU64,
}

/// Builds a [`ConversionService`] with custom collaborators.
///
/// ```no_run
/// use gifsmith::{ConversionService, FfmpegProber, ServiceConfig};
///
/// let service = ConversionService::builder(ServiceConfig::new("/var/lib/gifsmith"))
///     .with_prober(FfmpegProber::new().with_probe_size(2 * 1024 * 1024))
///     .build()?;
/// # Ok::<(), gifsmith::ConversionError>(())
/// ```
pub struct ServiceBuilder {
    config: ServiceConfig,
    prober: Arc<dyn FormatProber>,
    transcoder: Arc<dyn Transcoder>,
}

impl ServiceBuilder {
    #[must_use]
    pub fn with_prober<P: FormatProber + 'static>(mut self, prober: P) -> Self {
        self.prober = Arc::new(prober);
        self
    }

    #[must_use]
    pub fn with_transcoder<T: Transcoder + 'static>(mut self, transcoder: T) -> Self {
        self.transcoder = Arc::new(transcoder);
        self
    }

    /// Open storage and assemble the service.
    pub fn build(self) -> Result<ConversionService, ConversionError> {
        let storage = StorageManager::open(&self.config)?;
        log::info!(
            "Conversion service ready: {} workers, queue depth {}, timeout {:.0}s",
            self.config.max_concurrent_conversions,
            self.config.max_queued_conversions,
            self.config.conversion_timeout.as_secs_f64(),
        );
        Ok(ConversionService {
            inner: Arc::new(ServiceInner {
                limits: self.config.limits(),
                limiter: ConversionLimiter::new(&self.config),
                config: self.config,
                storage,
                prober: self.prober,
                transcoder: self.transcoder,
                requests: AtomicU64::new(0),
            }),
        })
    }
}

/// Video upload to animated GIF conversion.
///
/// Cheap to clone; clones share storage, workers, and collaborators.
#[derive(Clone)]
pub struct ConversionService {
    inner: Arc<ServiceInner>,
}

impl Debug for ConversionService {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ConversionService")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ConversionService {
    /// A service using the FFmpeg prober and transcoder.
    pub fn new(config: ServiceConfig) -> Result<Self, ConversionError> {
        Self::builder(config).build()
    }

    pub fn builder(config: ServiceConfig) -> ServiceBuilder {
        ServiceBuilder {
            config,
            prober: Arc::new(FfmpegProber::new()),
            transcoder: Arc::new(GifTranscoder::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &StorageManager {
        &self.inner.storage
    }

    /// Convert one upload.
    ///
    /// Waits for a worker slot, then runs the whole pipeline on the blocking
    /// pool under the configured deadline. On timeout the conversion is
    /// cancelled and this call returns only after its staged bytes and any
    /// partial output are gone.
    ///
    /// # Errors
    ///
    /// Any [`ConversionError`]; see the variant docs. The service never
    /// retries.
    pub async fn submit(&self, request: UploadRequest) -> Result<ConversionArtifact, ConversionError> {
        let number = self.inner.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let trace = Arc::new(RequestTrace::new(number, request.progress.clone()));

        let permit = match self.inner.limiter.acquire().await {
            Ok(permit) => permit,
            Err(error) => {
                trace.fail(&error);
                return Err(error);
            }
        };

        let mut control = ConversionControl::new();
        if let Some(callback) = &request.progress {
            control = control.with_progress(Arc::clone(callback));
        }
        let token = control.cancellation().clone();

        let inner = Arc::clone(&self.inner);
        let worker_trace = Arc::clone(&trace);
        let mut task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            inner.run_pipeline(request, &control, &worker_trace)
        });

        let deadline = self.inner.config.conversion_timeout;
        let result = match tokio::time::timeout(deadline, &mut task).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                token.cancel();
                log::warn!(
                    "Request #{number} exceeded {:.1}s; cancelling",
                    deadline.as_secs_f64()
                );
                match flatten(task.await) {
                    // Finished between the deadline and the cancellation.
                    Ok(artifact) => Ok(artifact),
                    Err(_) => Err(ConversionError::ConversionTimeout {
                        seconds: deadline.as_secs_f64(),
                    }),
                }
            }
        };

        match &result {
            Ok(artifact) => log::info!(
                "Request #{number}: {:?} as artifact {} in {:.2}s",
                ConversionStage::Registered,
                artifact.id,
                trace.started.elapsed().as_secs_f64(),
            ),
            Err(error) => trace.fail(error),
        }
        result
    }

    /// Stage and probe an upload without converting it.
    ///
    /// Subject to the same worker limit as [`submit`](Self::submit). The
    /// staged bytes are deleted before this returns.
    pub async fn inspect(
        &self,
        request: UploadRequest,
    ) -> Result<(MediaInfo, ValidationReport), ConversionError> {
        let permit = self.inner.limiter.acquire().await?;
        let inner = Arc::clone(&self.inner);
        flatten(
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let reader = open_body(request.body)?;
                let source = inner.storage.stage(reader)?;
                let info = inner.prober.probe(&source)?;
                let report = validate_media_info(&info, &inner.limits);
                Ok((info, report))
            })
            .await,
        )
    }

    /// GIF bytes of a registered artifact.
    pub fn fetch(&self, id: &ArtifactId) -> Result<Vec<u8>, ConversionError> {
        self.inner.storage.fetch(id)
    }

    /// Open a registered artifact for streaming.
    pub fn open(&self, id: &ArtifactId) -> Result<File, ConversionError> {
        self.inner.storage.open_artifact(id)
    }

    pub fn metadata(&self, id: &ArtifactId) -> Result<ArtifactMetadata, ConversionError> {
        self.inner.storage.metadata(id)
    }

    /// Fetch an artifact and release it, for one-shot downloads.
    pub fn take(&self, id: &ArtifactId) -> Result<Vec<u8>, ConversionError> {
        let bytes = self.inner.storage.fetch(id)?;
        self.inner.storage.release(id)?;
        Ok(bytes)
    }

    /// Delete an artifact. Unknown identifiers are a no-op.
    pub fn release(&self, id: &ArtifactId) -> Result<(), ConversionError> {
        self.inner.storage.release(id)
    }

    /// Apply the retention policy once.
    pub fn evict(&self) -> Result<EvictionReport, ConversionError> {
        self.inner.storage.evict()
    }

    /// Remove staged uploads left behind by a previous process.
    ///
    /// Files younger than `max_age` are kept, since they may belong to
    /// conversions still running in this process.
    pub fn sweep_orphaned_staging(&self, max_age: Duration) -> Result<usize, ConversionError> {
        self.inner.storage.sweep_orphaned_staging(max_age)
    }

    /// Run [`evict`](Self::evict) every `interval` on the current tokio
    /// runtime until the handle is aborted.
    pub fn spawn_janitor(&self, interval: Duration) -> JoinHandle<()> {
        let storage = self.inner.storage.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pass = storage.clone();
                match tokio::task::spawn_blocking(move || pass.evict()).await {
                    Ok(Ok(report)) => {
                        log::debug!("Janitor pass removed {} artifacts", report.removed())
                    }
                    Ok(Err(error)) => log::warn!("Janitor pass failed: {error}"),
                    Err(error) => log::warn!("Janitor pass panicked: {error}"),
                }
            }
        })
    }
}

impl ServiceInner {
    fn run_pipeline(
        &self,
        request: UploadRequest,
        control: &ConversionControl,
        trace: &RequestTrace,
    ) -> Result<ConversionArtifact, ConversionError> {
        let UploadRequest {
            body,
            filename,
            options,
            ..
        } = request;

        let reader = open_body(body)?;
        let source = self
            .storage
            .stage_with_cancellation(reader, control.cancellation())?;
        trace.enter(ConversionStage::Staged);
        control.check_cancelled()?;

        let info = self.prober.probe(&source)?;
        trace.enter(ConversionStage::Probed);
        control.check_cancelled()?;

        let plan = ConversionPlan::resolve(&info, &options, &self.limits)?;
        for clamp in &plan.clamps {
            log::info!("Request #{}: clamped {clamp:?}", trace.number);
        }

        trace.enter(ConversionStage::Converting);
        let rendered = self.transcoder.convert(&source, &info, &plan, control)?;
        control.check_cancelled()?;

        let artifact = self.storage.register_artifact(
            &rendered.bytes,
            NewArtifact {
                frame_count: rendered.frame_count,
                width: rendered.width,
                height: rendered.height,
                frame_rate: plan.frame_rate,
                looping: plan.looping,
                source_id: source.id(),
                clamps: plan.clamps,
                suggested_filename: suggested_gif_name(filename.as_deref()),
            },
        )?;
        trace.record(ConversionStage::Registered);
        source.release();
        Ok(artifact)
    }
}

fn flatten<T>(
    joined: Result<Result<T, ConversionError>, tokio::task::JoinError>,
) -> Result<T, ConversionError> {
    match joined {
        Ok(result) => result,
        Err(error) if error.is_panic() => Err(ConversionError::DecodeFailure(
            "conversion worker panicked".to_string(),
        )),
        Err(error) => Err(ConversionError::InternalStorageError(format!(
            "conversion worker stopped: {error}"
        ))),
    }
}
