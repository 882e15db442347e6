//! Video-to-GIF transcoding.
//!
//! [`GifTranscoder`] decodes the probed video stream from the plan's start
//! offset, hands every decoded frame to a [`TemporalResampler`], scales each
//! frame that survives resampling to the output size exactly once, and
//! streams it into a [`GifWriter`] as many times as the resampler asks.
//! Delays come from a [`FrameClock`] so the GIF's total play time matches
//! the planned duration.
//!
//! The work is blocking and CPU-bound; the service runs it on tokio's
//! blocking pool. The [`ConversionControl`]'s cancellation token is checked
//! between packets and between emitted frames, which bounds how long a
//! cancelled conversion keeps running.

use std::time::Duration;

use ffmpeg_next::{
    Dictionary, Rational,
    codec::context::Context as CodecContext,
    decoder::Video as VideoDecoder,
    format::Pixel,
    frame::Video as VideoFrame,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};
use image::RgbaImage;

use crate::error::ConversionError;
use crate::gif::GifWriter;
use crate::probe::MediaInfo;
use crate::progress::{ConversionControl, ConversionStage, ProgressTracker};
use crate::resample::{ConversionPlan, Emission, FrameClock, TemporalResampler};
use crate::storage::StagedSource;
use crate::utilities;

/// An encoded GIF held in memory, ready to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedGif {
    pub bytes: Vec<u8>,
    pub frame_count: u64,
    pub width: u32,
    pub height: u32,
}

/// Turns a probed source into GIF bytes according to a plan.
pub trait Transcoder: Send + Sync {
    /// # Errors
    ///
    /// - [`ConversionError::DecodeFailure`] if the stream cannot be decoded
    ///   or yields no frames in the planned range.
    /// - [`ConversionError::EncodeFailure`] if the GIF encoder fails.
    /// - [`ConversionError::Cancelled`] if the control's token fires.
    fn convert(
        &self,
        source: &StagedSource,
        info: &MediaInfo,
        plan: &ConversionPlan,
        control: &ConversionControl,
    ) -> Result<RenderedGif, ConversionError>;
}

/// The FFmpeg-backed transcoder.
#[derive(Debug, Clone, Default)]
pub struct GifTranscoder;

impl GifTranscoder {
    pub fn new() -> Self {
        Self
    }
}

impl Transcoder for GifTranscoder {
    fn convert(
        &self,
        source: &StagedSource,
        info: &MediaInfo,
        plan: &ConversionPlan,
        control: &ConversionControl,
    ) -> Result<RenderedGif, ConversionError> {
        crate::ffmpeg::ensure_initialized()?;
        log::debug!(
            "Transcoding source {}: {:.3}s from {:.3}s at {} fps, {}x{}, {} frames",
            source.id(),
            plan.duration.as_secs_f64(),
            plan.start.as_secs_f64(),
            plan.frame_rate,
            plan.width,
            plan.height,
            plan.frame_count,
        );

        let mut options = Dictionary::new();
        options.set("format_whitelist", info.container_kind.demuxer_whitelist());
        let mut input = ffmpeg_next::format::input_with_dictionary(&source.path(), options)
            .map_err(|error| {
                ConversionError::DecodeFailure(format!("Failed to reopen staged source: {error}"))
            })?;

        let stream = input.stream(info.stream_index).ok_or_else(|| {
            ConversionError::DecodeFailure(format!("video stream {} disappeared", info.stream_index))
        })?;
        let time_base = stream.time_base();
        let stream_start = utilities::stream_start_seconds(stream.start_time(), time_base);
        let decoder = CodecContext::from_parameters(stream.parameters())?
            .decoder()
            .video()?;

        if !plan.start.is_zero() {
            let target = utilities::seek_timestamp(plan.start, stream_start);
            // Frames before the start are dropped by the resampler, so a
            // failed seek only costs decode time.
            if let Err(error) = input.seek(target, ..target) {
                log::warn!(
                    "Seek to {:.3}s failed for source {} ({error}); decoding from the beginning",
                    plan.start.as_secs_f64(),
                    source.id(),
                );
            }
        }

        let mut pipeline = FramePipeline {
            decoder,
            scaler: None,
            time_base,
            stream_start,
            fallback_interval: info.frame_rate.interval_seconds(),
            last_timestamp: None,
            resampler: TemporalResampler::for_plan(plan),
            clock: FrameClock::new(plan.frame_rate),
            writer: GifWriter::new(plan.width, plan.height, plan.looping)?,
            tracker: control.tracker(ConversionStage::Converting, Some(plan.frame_count)),
            control,
            width: plan.width,
            height: plan.height,
            emitted: 0,
            spare: VideoFrame::empty(),
        };

        for (stream, packet) in input.packets() {
            control.check_cancelled()?;
            if stream.index() != info.stream_index {
                continue;
            }
            pipeline.decoder.send_packet(&packet).map_err(|error| {
                ConversionError::DecodeFailure(format!("Corrupt video packet: {error}"))
            })?;
            pipeline.drain()?;
            if pipeline.resampler.is_complete() {
                break;
            }
        }

        if !pipeline.resampler.is_complete() {
            pipeline.decoder.send_eof()?;
            pipeline.drain()?;
        }
        if let Some(emission) = pipeline.resampler.finish() {
            pipeline.emit(emission)?;
        }

        pipeline.finish()
    }
}

/// Decode state for one conversion.
struct FramePipeline<'a> {
    decoder: VideoDecoder,
    scaler: Option<(ScalingContext, (Pixel, u32, u32))>,
    time_base: Rational,
    stream_start: f64,
    fallback_interval: f64,
    last_timestamp: Option<f64>,
    resampler: TemporalResampler<VideoFrame>,
    clock: FrameClock,
    writer: GifWriter,
    tracker: ProgressTracker,
    control: &'a ConversionControl,
    width: u32,
    height: u32,
    emitted: u64,
    /// Recycled frame buffer for the decoder.
    spare: VideoFrame,
}

impl FramePipeline<'_> {
    /// Pull every frame the decoder has ready and feed the resampler.
    fn drain(&mut self) -> Result<(), ConversionError> {
        while self.decoder.receive_frame(&mut self.spare).is_ok() {
            let frame = std::mem::replace(&mut self.spare, VideoFrame::empty());
            let timestamp = self.timestamp_of(&frame);
            if let Some(emission) = self.resampler.push(timestamp, frame) {
                self.emit(emission)?;
            }
            if self.resampler.is_complete() {
                break;
            }
        }
        Ok(())
    }

    /// Source-relative presentation time of a decoded frame, in seconds.
    ///
    /// Frames without any timestamp are placed one source interval after the
    /// previous frame.
    fn timestamp_of(&mut self, frame: &VideoFrame) -> f64 {
        let seconds = match frame.timestamp().or_else(|| frame.pts()) {
            Some(pts) if pts != utilities::NO_TIMESTAMP => {
                utilities::pts_to_seconds(pts, self.time_base) - self.stream_start
            }
            _ => self
                .last_timestamp
                .map_or(0.0, |last| last + self.fallback_interval),
        };
        self.last_timestamp = Some(seconds);
        seconds
    }

    /// Scale a surviving frame once and write it `repeats` times.
    fn emit(&mut self, emission: Emission<VideoFrame>) -> Result<(), ConversionError> {
        let Emission { frame, repeats } = emission;
        if repeats > 0 {
            let image = self.scale(&frame)?;
            let mut quantized = self.writer.quantize(&image)?;
            for _ in 0..repeats {
                self.control.check_cancelled()?;
                self.writer
                    .push_quantized(&mut quantized, self.clock.next_delay())?;
                let slot = Duration::from_secs_f64(self.resampler.slot_time(self.emitted).max(0.0));
                self.tracker.advance(Some(slot));
                self.emitted += 1;
            }
        }
        self.spare = frame;
        Ok(())
    }

    fn scale(&mut self, frame: &VideoFrame) -> Result<RgbaImage, ConversionError> {
        let input = (frame.format(), frame.width(), frame.height());
        let rebuild = self
            .scaler
            .as_ref()
            .is_none_or(|(_, definition)| *definition != input);
        if rebuild {
            if self.scaler.is_some() {
                log::debug!(
                    "Decoded frame geometry changed to {}x{}; rebuilding scaler",
                    input.1,
                    input.2
                );
            }
            let context = ScalingContext::get(
                input.0,
                input.1,
                input.2,
                Pixel::RGBA,
                self.width,
                self.height,
                ScalingFlags::BILINEAR,
            )?;
            self.scaler = Some((context, input));
        }

        let mut rgba = VideoFrame::empty();
        if let Some((context, _)) = self.scaler.as_mut() {
            context.run(frame, &mut rgba)?;
        }
        let buffer = utilities::rgba_frame_to_buffer(&rgba, self.width, self.height);
        RgbaImage::from_raw(self.width, self.height, buffer).ok_or_else(|| {
            ConversionError::DecodeFailure("scaled frame has an unexpected size".to_string())
        })
    }

    fn finish(mut self) -> Result<RenderedGif, ConversionError> {
        if self.writer.frame_count() == 0 {
            return Err(ConversionError::DecodeFailure(
                "no video frames could be decoded in the requested range".to_string(),
            ));
        }
        self.tracker.finish();
        let frame_count = self.writer.frame_count();
        let bytes = self.writer.finish()?;
        Ok(RenderedGif {
            bytes,
            frame_count,
            width: self.width,
            height: self.height,
        })
    }
}
