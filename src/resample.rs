//! Conversion planning and temporal resampling.
//!
//! [`ConversionPlan::resolve`] turns probed [`MediaInfo`] plus the caller's
//! [`ConversionOptions`] into concrete output parameters, rejecting
//! impossible requests and clamping oversized ones against
//! [`ConversionLimits`]. [`TemporalResampler`] then decides, for every
//! decoded frame, how many output slots it fills: zero when frames are
//! dropped, more than one when they are duplicated. Pixel data is never
//! blended.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::configuration::{ConversionLimits, ConversionOptions, FrameRate};
use crate::error::ConversionError;
use crate::probe::MediaInfo;

/// Bytes per decoded RGBA pixel.
const BYTES_PER_PIXEL: u64 = 4;

/// Lowest frame rate the memory clamp will reduce to before it starts
/// shortening the clip instead.
pub const MIN_CLAMPED_FRAME_RATE: u32 = 2;

/// Tolerance for floating-point slot arithmetic.
const EPSILON: f64 = 1e-9;

/// A limit that reduced what the caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "parameter", rename_all = "snake_case")]
pub enum Clamp {
    Width { requested: u32, applied: u32 },
    FrameRate { requested: FrameRate, applied: FrameRate },
    Duration { requested: Duration, applied: Duration },
}

/// Concrete output parameters for one conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionPlan {
    /// Source timestamp of the first output frame.
    pub start: Duration,
    /// Length of source material covered.
    pub duration: Duration,
    pub frame_rate: FrameRate,
    pub width: u32,
    pub height: u32,
    /// Number of output frames.
    pub frame_count: u64,
    pub looping: bool,
    /// Limits applied while resolving, in the order they were applied.
    pub clamps: Vec<Clamp>,
}

impl ConversionPlan {
    /// Resolve options against a probed source.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidOptions`] if the options can never
    /// be satisfied for this source, e.g. a start offset at or beyond the
    /// end of the clip.
    pub fn resolve(
        info: &MediaInfo,
        options: &ConversionOptions,
        limits: &ConversionLimits,
    ) -> Result<Self, ConversionError> {
        options.check()?;

        let start = options.start_offset.unwrap_or(Duration::ZERO);
        if start >= info.duration {
            return Err(ConversionError::InvalidOptions(format!(
                "start offset {:.3}s is beyond the clip length of {:.3}s",
                start.as_secs_f64(),
                info.duration.as_secs_f64(),
            )));
        }

        let mut clamps = Vec::new();

        // Requests that run past the end of the clip end with the clip.
        let available = info.duration - start;
        let requested_duration = options.duration.unwrap_or(available).min(available);
        let mut duration = requested_duration;
        if duration > limits.max_duration {
            duration = limits.max_duration;
            clamps.push(Clamp::Duration {
                requested: requested_duration,
                applied: duration,
            });
        }

        let requested_width = options.target_width.unwrap_or(info.width);
        let mut width = requested_width;
        if width > limits.max_output_width {
            width = limits.max_output_width;
            clamps.push(Clamp::Width {
                requested: requested_width,
                applied: width,
            });
        }
        let mut height = scaled_height(info.width, info.height, width);
        if height > u16::MAX as u32 {
            return Err(ConversionError::InvalidOptions(format!(
                "output height {height} exceeds the GIF limit of {}",
                u16::MAX
            )));
        }

        let mut frame_rate = match options.frame_rate {
            Some(requested) if requested.exceeds(limits.max_frame_rate) => {
                clamps.push(Clamp::FrameRate {
                    requested,
                    applied: limits.max_frame_rate,
                });
                limits.max_frame_rate
            }
            Some(requested) => requested,
            None => info.frame_rate.min(limits.max_frame_rate),
        };

        let frame_bytes = width as u64 * height as u64 * BYTES_PER_PIXEL;
        if frame_bytes > limits.max_frame_buffer_bytes {
            // Not even one frame fits: shrink the picture.
            let shrunk = width_for_budget(info.width, info.height, limits.max_frame_buffer_bytes);
            clamps.push(Clamp::Width {
                requested: width,
                applied: shrunk,
            });
            width = shrunk;
            height = scaled_height(info.width, info.height, width);
        }

        let frame_bytes = width as u64 * height as u64 * BYTES_PER_PIXEL;
        let max_frames = (limits.max_frame_buffer_bytes / frame_bytes).max(1);
        if frame_count_for(duration, frame_rate) > max_frames {
            let floor = FrameRate::whole(MIN_CLAMPED_FRAME_RATE).min(frame_rate);
            let fitted = FrameRate::from_f64_floor(max_frames as f64 / duration.as_secs_f64())
                .filter(|rate| !floor.exceeds(*rate));

            match fitted {
                Some(reduced) => {
                    clamps.push(Clamp::FrameRate {
                        requested: frame_rate,
                        applied: reduced,
                    });
                    frame_rate = reduced;
                }
                None => {
                    if frame_rate != floor {
                        clamps.push(Clamp::FrameRate {
                            requested: frame_rate,
                            applied: floor,
                        });
                        frame_rate = floor;
                    }
                    let shortened = Duration::from_secs_f64(
                        max_frames as f64 * frame_rate.interval_seconds(),
                    )
                    .min(duration);
                    clamps.push(Clamp::Duration {
                        requested: duration,
                        applied: shortened,
                    });
                    duration = shortened;
                }
            }
        }

        let frame_count = frame_count_for(duration, frame_rate).min(max_frames);

        Ok(Self {
            start,
            duration,
            frame_rate,
            width,
            height,
            frame_count,
            looping: options.looping,
            clamps,
        })
    }

    /// Source end of the converted range.
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }

    /// Bytes of RGBA pixel data this plan would occupy if every output
    /// frame were held at once.
    pub fn frame_buffer_bytes(&self) -> u64 {
        self.width as u64 * self.height as u64 * BYTES_PER_PIXEL * self.frame_count
    }

    pub fn was_clamped(&self) -> bool {
        !self.clamps.is_empty()
    }
}

/// Height that preserves the source aspect ratio at `width`, at least 1.
pub fn scaled_height(source_width: u32, source_height: u32, width: u32) -> u32 {
    if source_width == 0 {
        return source_height.max(1);
    }
    let ratio = width as f64 / source_width as f64;
    ((source_height as f64 * ratio).round() as u32).max(1)
}

fn width_for_budget(source_width: u32, source_height: u32, budget_bytes: u64) -> u32 {
    let aspect = source_height as f64 / source_width.max(1) as f64;
    let pixels = budget_bytes as f64 / BYTES_PER_PIXEL as f64;
    let mut width = ((pixels / aspect).sqrt().floor() as u32).max(1);
    while width > 1
        && width as u64 * scaled_height(source_width, source_height, width) as u64 * BYTES_PER_PIXEL
            > budget_bytes
    {
        width -= 1;
    }
    width
}

/// Output frames needed to cover `duration` at `frame_rate`; at least one.
pub fn frame_count_for(duration: Duration, frame_rate: FrameRate) -> u64 {
    let exact = duration.as_secs_f64() * frame_rate.as_f64();
    ((exact - EPSILON).ceil() as u64).max(1)
}

/// A decoded frame being handed back, with how many output slots it fills.
#[derive(Debug, PartialEq)]
pub struct Emission<T> {
    pub frame: T,
    /// `0` means the frame was dropped.
    pub repeats: u64,
}

/// Maps a stream of timestamped decoded frames onto a fixed output grid.
///
/// Output slot `i` sits at `start + i / frame_rate`. Each slot shows the
/// last decoded frame whose timestamp is at or before the slot time (or
/// the first decoded frame, for slots that precede every decoded frame).
/// The resampler holds one frame; pushing the next one displaces it and
/// says how many slots it covered.
///
/// ```
/// use std::time::Duration;
///
/// use gifsmith::{FrameRate, TemporalResampler};
///
/// // 30 fps source to 10 fps output over one second.
/// let mut resampler = TemporalResampler::new(Duration::ZERO, FrameRate::whole(10), 10);
/// let mut emitted = 0;
/// for index in 0..30u32 {
///     if let Some(emission) = resampler.push(index as f64 / 30.0, index) {
///         emitted += emission.repeats;
///     }
/// }
/// emitted += resampler.finish().map_or(0, |emission| emission.repeats);
/// assert_eq!(emitted, 10);
/// ```
#[derive(Debug)]
pub struct TemporalResampler<T> {
    start: f64,
    interval: f64,
    total: u64,
    assigned: u64,
    held: Option<T>,
}

impl<T> TemporalResampler<T> {
    pub fn new(start: Duration, frame_rate: FrameRate, total: u64) -> Self {
        Self {
            start: start.as_secs_f64(),
            interval: frame_rate.interval_seconds(),
            total,
            assigned: 0,
            held: None,
        }
    }

    /// Build a resampler for a resolved plan.
    pub fn for_plan(plan: &ConversionPlan) -> Self {
        Self::new(plan.start, plan.frame_rate, plan.frame_count)
    }

    /// Source time of output slot `index`, in seconds.
    pub fn slot_time(&self, index: u64) -> f64 {
        self.start + index as f64 * self.interval
    }

    /// Offer the next decoded frame, timestamped in seconds.
    ///
    /// Returns the previously held frame together with the number of slots
    /// it fills, or `None` for the very first frame. Once every slot is
    /// assigned, the offered frame is handed straight back with zero
    /// repeats.
    pub fn push(&mut self, timestamp: f64, frame: T) -> Option<Emission<T>> {
        if self.is_complete() {
            return Some(Emission { frame, repeats: 0 });
        }
        let Some(previous) = self.held.take() else {
            self.held = Some(frame);
            return None;
        };

        let mut repeats = 0;
        while self.assigned < self.total && self.slot_time(self.assigned) < timestamp - EPSILON {
            self.assigned += 1;
            repeats += 1;
        }
        self.held = Some(frame);
        Some(Emission {
            frame: previous,
            repeats,
        })
    }

    /// End of stream: the held frame fills every remaining slot.
    pub fn finish(&mut self) -> Option<Emission<T>> {
        let frame = self.held.take()?;
        let repeats = self.total - self.assigned;
        self.assigned = self.total;
        Some(Emission { frame, repeats })
    }

    /// `true` once every output slot has been assigned a frame.
    pub fn is_complete(&self) -> bool {
        self.assigned >= self.total
    }

    /// Output slots assigned so far.
    pub fn assigned(&self) -> u64 {
        self.assigned
    }

    /// `true` once a decoded frame has been accepted.
    pub fn has_frame(&self) -> bool {
        self.held.is_some()
    }
}

/// Per-frame GIF delays in centiseconds.
///
/// GIF delays are whole centiseconds, so a rate like 30 fps (3.33 cs)
/// cannot be expressed per frame. The clock rounds the cumulative
/// presentation time instead, yielding delays such as `3, 3, 4, 3, 3, 4`
/// that never drift from the true timeline.
#[derive(Debug, Clone)]
pub struct FrameClock {
    frame_rate: FrameRate,
    index: u64,
}

impl FrameClock {
    pub fn new(frame_rate: FrameRate) -> Self {
        Self {
            frame_rate,
            index: 0,
        }
    }

    fn centiseconds_at(&self, index: u64) -> u64 {
        let numerator = index as u128 * 100 * self.frame_rate.denominator() as u128;
        let denominator = self.frame_rate.numerator() as u128;
        ((numerator + denominator / 2) / denominator) as u64
    }

    /// Delay for the next frame.
    pub fn next_delay(&mut self) -> u16 {
        let delay = self.centiseconds_at(self.index + 1) - self.centiseconds_at(self.index);
        self.index += 1;
        delay.clamp(1, u16::MAX as u64) as u16
    }
}
