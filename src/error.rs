//! Error types for the `gifsmith` crate.
//!
//! [`ConversionError`] is the caller-facing taxonomy returned by every
//! pipeline stage. Variants carry a short human-readable reason and never
//! expose backtraces or raw FFmpeg state. [`ConfigError`] covers invalid
//! service configuration, which is a startup concern rather than a
//! per-request one.

use std::io::Error as IoError;

use ffmpeg_next::Error as FfmpegError;
use thiserror::Error;

/// The unified error type for every conversion operation.
///
/// Storage, prober, and transcoder errors propagate unchanged through
/// [`ConversionService::submit`](crate::ConversionService::submit); the
/// service never retries on its own.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConversionError {
    /// The upload exceeded the configured `MAX_UPLOAD_BYTES`.
    #[error("Upload exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge {
        /// The configured limit in bytes.
        limit: u64,
    },

    /// The blob is not a recognised, decodable video container or codec.
    #[error("Unsupported media format: {0}")]
    UnsupportedFormat(String),

    /// The container was recognised but its headers are inconsistent.
    #[error("Corrupt media: {0}")]
    CorruptMedia(String),

    /// The requested conversion options cannot be satisfied.
    #[error("Invalid conversion options: {0}")]
    InvalidOptions(String),

    /// Decoding failed part-way through the stream.
    #[error("Failed to decode video: {0}")]
    DecodeFailure(String),

    /// The animated-image encoder failed.
    #[error("Failed to encode GIF: {0}")]
    EncodeFailure(String),

    /// The conversion did not finish within the per-request deadline.
    #[error("Conversion timed out after {seconds:.1}s")]
    ConversionTimeout {
        /// The deadline that elapsed, in seconds.
        seconds: f64,
    },

    /// The worker pool and its waiting queue are full.
    #[error("Conversion capacity exhausted: {0}")]
    Overloaded(String),

    /// No artifact exists under the given identifier.
    #[error("Artifact {0} not found")]
    NotFound(String),

    /// Reading or writing the storage area failed.
    #[error("Storage error: {0}")]
    InternalStorageError(String),

    /// A [`CancellationToken`](crate::CancellationToken) fired.
    ///
    /// Only surfaces when a [`Transcoder`](crate::Transcoder) is driven
    /// directly. The service reports cancelled work as
    /// [`ConversionError::ConversionTimeout`].
    #[error("Operation cancelled")]
    Cancelled,
}

/// Fieldless discriminant of [`ConversionError`].
///
/// Handy for front ends that map failures to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PayloadTooLarge,
    UnsupportedFormat,
    CorruptMedia,
    InvalidOptions,
    DecodeFailure,
    EncodeFailure,
    ConversionTimeout,
    Overloaded,
    NotFound,
    InternalStorageError,
    Cancelled,
}

impl ConversionError {
    /// The fieldless kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConversionError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            ConversionError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            ConversionError::CorruptMedia(_) => ErrorKind::CorruptMedia,
            ConversionError::InvalidOptions(_) => ErrorKind::InvalidOptions,
            ConversionError::DecodeFailure(_) => ErrorKind::DecodeFailure,
            ConversionError::EncodeFailure(_) => ErrorKind::EncodeFailure,
            ConversionError::ConversionTimeout { .. } => ErrorKind::ConversionTimeout,
            ConversionError::Overloaded(_) => ErrorKind::Overloaded,
            ConversionError::NotFound(_) => ErrorKind::NotFound,
            ConversionError::InternalStorageError(_) => ErrorKind::InternalStorageError,
            ConversionError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<IoError> for ConversionError {
    fn from(error: IoError) -> Self {
        ConversionError::InternalStorageError(error.to_string())
    }
}

/// FFmpeg errors raised after probing are decode-time failures.
///
/// The prober maps its own FFmpeg errors explicitly so that malformed input
/// is reported as [`ConversionError::CorruptMedia`] instead.
impl From<FfmpegError> for ConversionError {
    fn from(error: FfmpegError) -> Self {
        ConversionError::DecodeFailure(error.to_string())
    }
}

/// Invalid service configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// An environment variable held a value outside its allowed range.
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Variable name, e.g. `MAX_UPLOAD_BYTES`.
        key: &'static str,
        /// The raw value that was rejected.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An environment variable could not be deserialized into its type.
    #[error("Invalid environment configuration: {0}")]
    Environment(#[from] figment::Error),
}
