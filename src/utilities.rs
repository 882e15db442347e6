//! Internal helpers shared by the decode path.
//!
//! Pixel copying out of FFmpeg frames and timestamp conversions between
//! stream time bases, seconds, and FFmpeg's microsecond seek base.

use std::time::Duration;

use ffmpeg_next::{Rational, frame::Video as VideoFrame};

/// FFmpeg's "no timestamp" sentinel (`AV_NOPTS_VALUE`).
pub(crate) const NO_TIMESTAMP: i64 = i64::MIN;

/// Bytes per RGBA pixel.
pub(crate) const RGBA_BYTES: usize = 4;

/// Copy plane 0 of an RGBA frame into a tightly packed buffer.
///
/// FFmpeg frames frequently carry per-row padding (stride > width × 4),
/// which [`image::RgbaImage::from_raw`] does not accept.
pub(crate) fn rgba_frame_to_buffer(video_frame: &VideoFrame, width: u32, height: u32) -> Vec<u8> {
    let stride = video_frame.stride(0);
    let expected_stride = width as usize * RGBA_BYTES;
    let data = video_frame.data(0);

    if stride == expected_stride {
        data[..expected_stride * height as usize].to_vec()
    } else {
        let mut buffer = Vec::with_capacity(expected_stride * height as usize);
        for row in 0..height as usize {
            let row_start = row * stride;
            buffer.extend_from_slice(&data[row_start..row_start + expected_stride]);
        }
        buffer
    }
}

/// Rescale a timestamp from stream time base to seconds.
pub(crate) fn pts_to_seconds(pts: i64, time_base: Rational) -> f64 {
    pts as f64 * time_base.numerator() as f64 / time_base.denominator() as f64
}

/// Seconds of a stream's `start_time`, or zero when the stream has none.
pub(crate) fn stream_start_seconds(start_time: i64, time_base: Rational) -> f64 {
    if start_time == NO_TIMESTAMP || time_base.denominator() == 0 {
        0.0
    } else {
        pts_to_seconds(start_time, time_base)
    }
}

/// Convert a position to a container-level seek timestamp.
///
/// `input.seek()` calls `avformat_seek_file` with `stream_index = -1`,
/// which expects AV_TIME_BASE (microseconds) on the container's absolute
/// clock, so the stream's start offset is added back.
pub(crate) fn seek_timestamp(position: Duration, stream_start_seconds: f64) -> i64 {
    ((position.as_secs_f64() + stream_start_seconds) * 1_000_000.0) as i64
}
