//! # gifsmith
//!
//! Turn uploaded video clips into animated GIFs, safely.
//!
//! `gifsmith` accepts an untrusted video upload, stages it under a generated
//! identifier, checks that it really is a decodable video, decodes the
//! requested time range with FFmpeg via the
//! [`ffmpeg-next`](https://crates.io/crates/ffmpeg-next) crate, resamples it
//! to the requested frame rate and width, and stores the resulting GIF for
//! later download. Uploads are never trusted by name, every resource is
//! bounded, and every failure cleans up after itself.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use gifsmith::{ConversionOptions, ConversionService, FrameRate, ServiceConfig, UploadRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let service = ConversionService::new(ServiceConfig::new("./gifsmith-data"))?;
//!
//! let options = ConversionOptions::new()
//!     .with_target_width(480)
//!     .with_frame_rate(FrameRate::whole(12))
//!     .with_time_range(Duration::from_secs(3), Duration::from_secs(8))?;
//!
//! let request = UploadRequest::from_bytes(std::fs::read("holiday.mp4")?)
//!     .with_filename("holiday.mp4")
//!     .with_options(options);
//!
//! let artifact = service.submit(request).await?;
//! std::fs::write(&artifact.metadata.suggested_filename, service.fetch(&artifact.id)?)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//!
//! - **Storage** ([`StorageManager`]): staging area for uploads, artifact
//!   area for GIFs plus JSON metadata, TTL and count based eviction
//! - **Probing** ([`FfmpegProber`]): container signature allow-list, then a
//!   bounded FFmpeg probe restricted to the matching demuxer
//! - **Planning** ([`ConversionPlan`]): options resolved against the source
//!   and clamped to the configured limits, including a decoded-frame memory
//!   ceiling
//! - **Transcoding** ([`GifTranscoder`]): decode, drop or duplicate whole
//!   frames onto the output grid, scale, quantise, encode
//! - **Orchestration** ([`ConversionService`]): worker pool with a bounded
//!   queue, per-request deadline with cooperative cancellation
//!
//! ## Requirements
//!
//! FFmpeg development libraries must be installed on your system.

pub mod configuration;
pub mod error;
pub mod ffmpeg;
pub mod gif;
pub mod probe;
pub mod progress;
pub mod resample;
pub mod service;
pub mod storage;
pub mod transcode;
mod utilities;
pub mod validation;

pub use configuration::{
    ConversionLimits, ConversionOptions, FrameRate, GIF_MAX_FRAME_RATE, ServiceConfig,
};
pub use error::{ConfigError, ConversionError, ErrorKind};
pub use ffmpeg::{FfmpegLogLevel, set_ffmpeg_log_level};
pub use crate::gif::{GifWriter, QuantizedFrame};
pub use probe::{ContainerKind, FfmpegProber, FormatProber, MediaInfo, SNIFF_LEN};
pub use progress::{
    CancellationToken, ConversionControl, ConversionStage, ProgressCallback, ProgressInfo,
};
pub use resample::{Clamp, ConversionPlan, Emission, FrameClock, TemporalResampler};
pub use service::{ConversionService, ServiceBuilder, UploadRequest};
pub use storage::{
    ArtifactId, ArtifactMetadata, ConversionArtifact, EvictionReport, NewArtifact, SourceId,
    StagedSource, StorageManager, suggested_gif_name,
};
pub use transcode::{GifTranscoder, RenderedGif, Transcoder};
pub use validation::{ValidationReport, validate_media_info};
