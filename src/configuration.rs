//! Service and per-request configuration.
//!
//! [`ServiceConfig`] holds the process-level limits (upload size, output
//! width, concurrency, retention) and can be read from the environment with
//! [`ServiceConfig::from_env`]. [`ConversionOptions`] is the per-request
//! builder a front end fills in from its form fields.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use gifsmith::{ConversionOptions, FrameRate, ServiceConfig};
//!
//! let config = ServiceConfig::from_env()?
//!     .with_max_concurrent_conversions(4)
//!     .with_conversion_timeout(Duration::from_secs(90));
//!
//! let options = ConversionOptions::new()
//!     .with_target_width(480)
//!     .with_frame_rate(FrameRate::whole(12))
//!     .with_start_offset(Duration::from_secs(2))
//!     .with_duration(Duration::from_secs(5));
//! # Ok::<(), gifsmith::ConfigError>(())
//! ```

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use figment::Figment;
use figment::providers::Env;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConversionError};

/// Environment variables read by [`ServiceConfig::from_env`].
const ENVIRONMENT_KEYS: [&str; 12] = [
    "ARTIFACT_STORAGE_ROOT",
    "MAX_UPLOAD_BYTES",
    "MAX_CONVERSION_DURATION_SECONDS",
    "MAX_OUTPUT_WIDTH",
    "MAX_FRAME_RATE",
    "MAX_CONCURRENT_CONVERSIONS",
    "MAX_QUEUED_CONVERSIONS",
    "QUEUE_WAIT_SECONDS",
    "CONVERSION_TIMEOUT_SECONDS",
    "ARTIFACT_TTL_SECONDS",
    "MAX_ARTIFACT_COUNT",
    "MAX_FRAME_BUFFER_BYTES",
];

/// Default upload ceiling: 100 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
/// Default longest clip that will be converted.
pub const DEFAULT_MAX_CONVERSION_DURATION: Duration = Duration::from_secs(60);
/// Default widest output GIF.
pub const DEFAULT_MAX_OUTPUT_WIDTH: u32 = 640;
/// Default highest output frame rate.
pub const DEFAULT_MAX_FRAME_RATE: u32 = 30;
/// Default artifact retention: 24 hours.
pub const DEFAULT_ARTIFACT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default decoded-frame budget: 512 MiB of RGBA pixels.
pub const DEFAULT_MAX_FRAME_BUFFER_BYTES: u64 = 512 * 1024 * 1024;
/// Default per-request wall-clock deadline.
pub const DEFAULT_CONVERSION_TIMEOUT: Duration = Duration::from_secs(120);
/// Default time a queued request may wait for a worker.
pub const DEFAULT_QUEUE_WAIT: Duration = Duration::from_secs(30);

/// GIF frame delays are whole centiseconds and most decoders treat delays
/// below 2 cs as 10 cs, so output never exceeds 50 fps.
pub const GIF_MAX_FRAME_RATE: u32 = 50;

/// A positive rational frame rate, e.g. `30000/1001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    numerator: u32,
    denominator: u32,
}

impl FrameRate {
    /// Build a frame rate from a numerator and denominator.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidOptions`] if either part is zero.
    ///
    /// The ratio is stored in lowest terms, so `60/2 == 30/1`.
    pub fn new(numerator: u32, denominator: u32) -> Result<Self, ConversionError> {
        if numerator == 0 || denominator == 0 {
            return Err(ConversionError::InvalidOptions(format!(
                "frame rate {numerator}/{denominator} must be positive"
            )));
        }
        Ok(Self {
            numerator,
            denominator,
        }
        .reduced())
    }

    /// A whole-number frame rate. `0` is bumped to `1`.
    pub fn whole(frames_per_second: u32) -> Self {
        Self {
            numerator: frames_per_second.max(1),
            denominator: 1,
        }
    }

    /// Approximate a floating-point rate with millisecond precision,
    /// rounding down so the result never exceeds `value`.
    ///
    /// Returns `None` for non-finite or non-positive input.
    pub fn from_f64_floor(value: f64) -> Option<Self> {
        if !value.is_finite() || value <= 0.0 {
            return None;
        }
        let numerator = (value * 1000.0).floor();
        if numerator < 1.0 || numerator > u32::MAX as f64 {
            return None;
        }
        Some(Self {
            numerator: numerator as u32,
            denominator: 1000,
        }
        .reduced())
    }

    pub fn numerator(self) -> u32 {
        self.numerator
    }

    pub fn denominator(self) -> u32 {
        self.denominator
    }

    /// Frames per second as a float.
    pub fn as_f64(self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Seconds between consecutive frames.
    pub fn interval_seconds(self) -> f64 {
        self.denominator as f64 / self.numerator as f64
    }

    /// The smaller of two rates, compared exactly.
    pub fn min(self, other: FrameRate) -> FrameRate {
        if self.exceeds(other) { other } else { self }
    }

    /// `true` if `self` is strictly faster than `other`.
    pub fn exceeds(self, other: FrameRate) -> bool {
        (self.numerator as u64) * (other.denominator as u64)
            > (other.numerator as u64) * (self.denominator as u64)
    }

    fn reduced(self) -> Self {
        let divisor = gcd(self.numerator, self.denominator);
        Self {
            numerator: self.numerator / divisor,
            denominator: self.denominator / divisor,
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

impl Display for FrameRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if self.denominator == 1 {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

impl FromStr for FrameRate {
    type Err = ConversionError;

    /// Accepts `"12"`, `"29.97"`, or `"30000/1001"`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let invalid = || ConversionError::InvalidOptions(format!("invalid frame rate {trimmed:?}"));

        if let Some((numerator, denominator)) = trimmed.split_once('/') {
            let numerator = numerator.trim().parse::<u32>().map_err(|_| invalid())?;
            let denominator = denominator.trim().parse::<u32>().map_err(|_| invalid())?;
            return FrameRate::new(numerator, denominator);
        }
        if let Ok(whole) = trimmed.parse::<u32>() {
            return FrameRate::new(whole, 1);
        }
        let float = trimmed.parse::<f64>().map_err(|_| invalid())?;
        FrameRate::from_f64_floor(float).ok_or_else(invalid)
    }
}

/// Per-request conversion parameters.
///
/// Every field is optional; unset fields are derived from the probed source
/// and the service limits when the conversion is planned. Values that
/// exceed a limit are clamped (and the clamp reported) rather than rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOptions {
    /// Output width in pixels. Height follows the source aspect ratio.
    pub target_width: Option<u32>,
    /// Output frame rate.
    pub frame_rate: Option<FrameRate>,
    /// Where in the source the clip starts.
    pub start_offset: Option<Duration>,
    /// How much of the source to convert, starting at `start_offset`.
    pub duration: Option<Duration>,
    /// Loop forever (`true`, the default) or play once.
    pub looping: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            target_width: None,
            frame_rate: None,
            start_offset: None,
            duration: None,
            looping: true,
        }
    }
}

impl ConversionOptions {
    /// Options that convert the whole clip at source resolution and rate,
    /// subject to the service limits.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_target_width(mut self, width: u32) -> Self {
        self.target_width = Some(width);
        self
    }

    #[must_use]
    pub fn with_frame_rate(mut self, frame_rate: FrameRate) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    #[must_use]
    pub fn with_start_offset(mut self, offset: Duration) -> Self {
        self.start_offset = Some(offset);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Set `start_offset` and `duration` from a start and end timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidOptions`] if `end` is not after
    /// `start`.
    pub fn with_time_range(mut self, start: Duration, end: Duration) -> Result<Self, ConversionError> {
        if end <= start {
            return Err(ConversionError::InvalidOptions(format!(
                "end time {:.3}s must be after start time {:.3}s",
                end.as_secs_f64(),
                start.as_secs_f64(),
            )));
        }
        self.start_offset = Some(start);
        self.duration = Some(end - start);
        Ok(self)
    }

    /// Loop forever (`true`) or play once (`false`).
    #[must_use]
    pub fn with_loop(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Reject values that are invalid regardless of the source.
    pub(crate) fn check(&self) -> Result<(), ConversionError> {
        if self.target_width == Some(0) {
            return Err(ConversionError::InvalidOptions(
                "target width must be greater than zero".to_string(),
            ));
        }
        if self.duration == Some(Duration::ZERO) {
            return Err(ConversionError::InvalidOptions(
                "duration must be greater than zero".to_string(),
            ));
        }
        if let Some(rate) = self.frame_rate {
            // Re-validate: the fields are private but serde can build anything.
            FrameRate::new(rate.numerator, rate.denominator)?;
        }
        Ok(())
    }
}

/// The resource ceilings the planner clamps against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionLimits {
    pub max_output_width: u32,
    pub max_frame_rate: FrameRate,
    pub max_duration: Duration,
    /// Ceiling on `width × height × 4 × frame_count`.
    pub max_frame_buffer_bytes: u64,
}

impl Default for ConversionLimits {
    fn default() -> Self {
        ServiceConfig::default().limits()
    }
}

/// Process-level configuration for the conversion service.
///
/// Recognised environment variables (see [`from_env`](ServiceConfig::from_env)):
///
/// | Variable | Default |
/// |----------|---------|
/// | `ARTIFACT_STORAGE_ROOT` | `./gifsmith-data` |
/// | `MAX_UPLOAD_BYTES` | 100 MiB |
/// | `MAX_CONVERSION_DURATION_SECONDS` | 60 |
/// | `MAX_OUTPUT_WIDTH` | 640 |
/// | `MAX_FRAME_RATE` | 30 |
/// | `MAX_CONCURRENT_CONVERSIONS` | available parallelism |
/// | `MAX_QUEUED_CONVERSIONS` | 0 (reject when busy) |
/// | `QUEUE_WAIT_SECONDS` | 30 |
/// | `CONVERSION_TIMEOUT_SECONDS` | 120 |
/// | `ARTIFACT_TTL_SECONDS` | 86400 |
/// | `MAX_ARTIFACT_COUNT` | unlimited |
/// | `MAX_FRAME_BUFFER_BYTES` | 512 MiB |
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub storage_root: PathBuf,
    pub max_upload_bytes: u64,
    pub max_conversion_duration: Duration,
    pub max_output_width: u32,
    pub max_frame_rate: u32,
    pub max_concurrent_conversions: usize,
    /// Requests allowed to wait for a worker. `0` rejects immediately.
    pub max_queued_conversions: usize,
    pub queue_wait: Duration,
    pub conversion_timeout: Duration,
    pub artifact_ttl: Duration,
    /// `None` means no count-based eviction.
    pub max_artifact_count: Option<usize>,
    pub max_frame_buffer_bytes: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("gifsmith-data"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_conversion_duration: DEFAULT_MAX_CONVERSION_DURATION,
            max_output_width: DEFAULT_MAX_OUTPUT_WIDTH,
            max_frame_rate: DEFAULT_MAX_FRAME_RATE,
            max_concurrent_conversions: std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(2),
            max_queued_conversions: 0,
            queue_wait: DEFAULT_QUEUE_WAIT,
            conversion_timeout: DEFAULT_CONVERSION_TIMEOUT,
            artifact_ttl: DEFAULT_ARTIFACT_TTL,
            max_artifact_count: None,
            max_frame_buffer_bytes: DEFAULT_MAX_FRAME_BUFFER_BYTES,
        }
    }
}

impl ServiceConfig {
    /// Defaults, rooted at `storage_root`.
    pub fn new<P: Into<PathBuf>>(storage_root: P) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    /// The environment provider behind [`from_env`](ServiceConfig::from_env).
    ///
    /// Only the variables in the table above are read. Tests and embedders
    /// can merge further providers on top before calling
    /// [`from_figment`](ServiceConfig::from_figment).
    pub fn figment() -> Figment {
        Figment::new().merge(Env::raw().only(&ENVIRONMENT_KEYS))
    }

    /// Read the configuration from process environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Environment`] if a variable cannot be parsed
    /// and [`ConfigError::InvalidValue`] if it is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment())
    }

    /// Build the configuration from an arbitrary figment.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let raw: RawEnvironment = figment.extract()?;
        let mut config = Self::default();

        if let Some(root) = raw.artifact_storage_root {
            config.storage_root = root;
        }
        if let Some(bytes) = positive("MAX_UPLOAD_BYTES", raw.max_upload_bytes)? {
            config.max_upload_bytes = bytes;
        }
        if let Some(seconds) =
            positive("MAX_CONVERSION_DURATION_SECONDS", raw.max_conversion_duration_seconds)?
        {
            config.max_conversion_duration = Duration::from_secs(seconds);
        }
        if let Some(width) = positive("MAX_OUTPUT_WIDTH", raw.max_output_width)? {
            config.max_output_width = width.min(u16::MAX as u32);
        }
        if let Some(rate) = positive("MAX_FRAME_RATE", raw.max_frame_rate)? {
            config.max_frame_rate = rate;
        }
        if let Some(workers) = positive("MAX_CONCURRENT_CONVERSIONS", raw.max_concurrent_conversions)? {
            config.max_concurrent_conversions = workers;
        }
        if let Some(depth) = raw.max_queued_conversions {
            config.max_queued_conversions = depth;
        }
        if let Some(seconds) = raw.queue_wait_seconds {
            config.queue_wait = Duration::from_secs(seconds);
        }
        if let Some(seconds) = positive("CONVERSION_TIMEOUT_SECONDS", raw.conversion_timeout_seconds)? {
            config.conversion_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = positive("ARTIFACT_TTL_SECONDS", raw.artifact_ttl_seconds)? {
            config.artifact_ttl = Duration::from_secs(seconds);
        }
        if let Some(count) = positive("MAX_ARTIFACT_COUNT", raw.max_artifact_count)? {
            config.max_artifact_count = Some(count);
        }
        if let Some(bytes) = positive("MAX_FRAME_BUFFER_BYTES", raw.max_frame_buffer_bytes)? {
            config.max_frame_buffer_bytes = bytes;
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_storage_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.storage_root = root.into();
        self
    }

    #[must_use]
    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_max_conversion_duration(mut self, duration: Duration) -> Self {
        self.max_conversion_duration = duration;
        self
    }

    /// Clamped to the GIF limit of 65535 pixels.
    #[must_use]
    pub fn with_max_output_width(mut self, width: u32) -> Self {
        self.max_output_width = width.clamp(1, u16::MAX as u32);
        self
    }

    #[must_use]
    pub fn with_max_frame_rate(mut self, frames_per_second: u32) -> Self {
        self.max_frame_rate = frames_per_second.max(1);
        self
    }

    /// Clamped to a minimum of 1.
    #[must_use]
    pub fn with_max_concurrent_conversions(mut self, workers: usize) -> Self {
        self.max_concurrent_conversions = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_max_queued_conversions(mut self, depth: usize) -> Self {
        self.max_queued_conversions = depth;
        self
    }

    #[must_use]
    pub fn with_queue_wait(mut self, wait: Duration) -> Self {
        self.queue_wait = wait;
        self
    }

    #[must_use]
    pub fn with_conversion_timeout(mut self, timeout: Duration) -> Self {
        self.conversion_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_artifact_ttl(mut self, ttl: Duration) -> Self {
        self.artifact_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_artifact_count(mut self, count: Option<usize>) -> Self {
        self.max_artifact_count = count;
        self
    }

    #[must_use]
    pub fn with_max_frame_buffer_bytes(mut self, bytes: u64) -> Self {
        self.max_frame_buffer_bytes = bytes;
        self
    }

    /// The ceilings handed to the conversion planner.
    pub fn limits(&self) -> ConversionLimits {
        ConversionLimits {
            max_output_width: self.max_output_width.clamp(1, u16::MAX as u32),
            max_frame_rate: FrameRate::whole(self.max_frame_rate.min(GIF_MAX_FRAME_RATE)),
            max_duration: self.max_conversion_duration,
            max_frame_buffer_bytes: self.max_frame_buffer_bytes,
        }
    }
}

/// Environment values as figment sees them. Keys are lowercased by [`Env`].
#[derive(Debug, Default, Deserialize)]
struct RawEnvironment {
    artifact_storage_root: Option<PathBuf>,
    max_upload_bytes: Option<u64>,
    max_conversion_duration_seconds: Option<u64>,
    max_output_width: Option<u32>,
    max_frame_rate: Option<u32>,
    max_concurrent_conversions: Option<usize>,
    max_queued_conversions: Option<usize>,
    queue_wait_seconds: Option<u64>,
    conversion_timeout_seconds: Option<u64>,
    artifact_ttl_seconds: Option<u64>,
    max_artifact_count: Option<usize>,
    max_frame_buffer_bytes: Option<u64>,
}

fn positive<T>(key: &'static str, value: Option<T>) -> Result<Option<T>, ConfigError>
where
    T: PartialEq + Default + Display,
{
    match value {
        Some(value) if value == T::default() => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        other => Ok(other),
    }
}
