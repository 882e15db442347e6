//! Format probing for untrusted uploads.
//!
//! Probing happens in two bounded steps. First the leading [`SNIFF_LEN`]
//! bytes are matched against an allow-list of container signatures
//! ([`ContainerKind::sniff`]); the filename and declared content type are
//! never consulted. Only a recognised signature is handed to FFmpeg, and
//! then only to the matching demuxer, with capped `probesize` and
//! `analyzeduration` so a hostile header cannot make stream analysis read
//! the whole file.
//!
//! # Example
//!
//! ```no_run
//! use gifsmith::{FfmpegProber, FormatProber};
//!
//! let info = FfmpegProber::new().probe_path("clip.webm".as_ref())?;
//! println!("{} {}x{} @ {} fps", info.codec, info.width, info.height, info.frame_rate);
//! # Ok::<(), gifsmith::ConversionError>(())
//! ```

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use ffmpeg_next::{
    Dictionary, Rational, codec::Id as CodecId, codec::context::Context as CodecContext,
    format::context::Input, media::Type,
};
use serde::Serialize;

use crate::configuration::FrameRate;
use crate::error::ConversionError;
use crate::storage::StagedSource;

/// Bytes read for signature matching.
pub const SNIFF_LEN: usize = 512;

/// Upper bound on bytes FFmpeg may read while analysing streams.
pub const PROBE_SIZE_BYTES: u64 = 5 * 1024 * 1024;

/// Upper bound on media time FFmpeg may analyse, in microseconds.
pub const ANALYZE_DURATION_MICROS: u64 = 5_000_000;

const MPEG_TS_PACKET: usize = 188;
const M2TS_PACKET: usize = 192;

const ASF_HEADER_GUID: [u8; 16] = [
    0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, 0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C,
];

/// Video codecs the transcoder is willing to decode.
const ALLOWED_CODECS: &[CodecId] = &[
    CodecId::H264,
    CodecId::HEVC,
    CodecId::VP8,
    CodecId::VP9,
    CodecId::AV1,
    CodecId::MPEG4,
    CodecId::MPEG1VIDEO,
    CodecId::MPEG2VIDEO,
    CodecId::MSMPEG4V2,
    CodecId::MSMPEG4V3,
    CodecId::WMV1,
    CodecId::WMV2,
    CodecId::WMV3,
    CodecId::VC1,
    CodecId::FLV1,
    CodecId::VP6F,
    CodecId::H263,
    CodecId::MJPEG,
    CodecId::THEORA,
    CodecId::PRORES,
];

/// Container families recognised by their leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// Matroska and WebM (EBML header).
    Matroska,
    /// MP4, MOV, M4V, 3GP (ISO base media / QuickTime atoms).
    IsoBmff,
    Avi,
    Flv,
    /// ASF, as used by WMV.
    Asf,
    /// MPEG-1/2 program stream (`.mpg`, `.mpeg`, `.vob`).
    MpegProgramStream,
    /// MPEG transport stream, 188- or 192-byte packets.
    MpegTransportStream,
    /// Raw MPEG-1/2 video elementary stream.
    MpegVideo,
    Ogg,
}

impl ContainerKind {
    /// Match a file header against the allow-list.
    ///
    /// `header` should hold the first [`SNIFF_LEN`] bytes of the file (or
    /// the whole file, if shorter).
    ///
    /// ```
    /// use gifsmith::ContainerKind;
    ///
    /// assert_eq!(ContainerKind::sniff(b"\x1a\x45\xdf\xa3\x01\x00"), Some(ContainerKind::Matroska));
    /// assert_eq!(ContainerKind::sniff(b"GIF89a"), None);
    /// ```
    pub fn sniff(header: &[u8]) -> Option<Self> {
        if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            return Some(ContainerKind::Matroska);
        }
        if header.len() >= 8 {
            let atom = &header[4..8];
            if atom == b"ftyp" {
                return Some(ContainerKind::IsoBmff);
            }
            if matches!(atom, b"moov" | b"mdat" | b"wide" | b"free" | b"skip" | b"pnot") {
                return Some(ContainerKind::IsoBmff);
            }
        }
        if header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"AVI " {
            return Some(ContainerKind::Avi);
        }
        if header.starts_with(b"FLV\x01") {
            return Some(ContainerKind::Flv);
        }
        if header.starts_with(&ASF_HEADER_GUID) {
            return Some(ContainerKind::Asf);
        }
        if header.starts_with(&[0x00, 0x00, 0x01, 0xBA]) {
            return Some(ContainerKind::MpegProgramStream);
        }
        if header.starts_with(&[0x00, 0x00, 0x01, 0xB3]) {
            return Some(ContainerKind::MpegVideo);
        }
        if header.starts_with(b"OggS") {
            return Some(ContainerKind::Ogg);
        }
        if has_sync_bytes(header, 0, MPEG_TS_PACKET) || has_sync_bytes(header, 4, M2TS_PACKET) {
            return Some(ContainerKind::MpegTransportStream);
        }
        None
    }

    /// FFmpeg demuxer names allowed to open this container.
    pub fn demuxer_whitelist(self) -> &'static str {
        match self {
            ContainerKind::Matroska => "matroska,webm",
            ContainerKind::IsoBmff => "mov,mp4,m4a,3gp,3g2,mj2",
            ContainerKind::Avi => "avi",
            ContainerKind::Flv => "flv,live_flv",
            ContainerKind::Asf => "asf",
            ContainerKind::MpegProgramStream => "mpeg",
            ContainerKind::MpegTransportStream => "mpegts",
            ContainerKind::MpegVideo => "mpegvideo",
            ContainerKind::Ogg => "ogg",
        }
    }
}

/// Three sync bytes one packet apart, starting at `offset`.
fn has_sync_bytes(header: &[u8], offset: usize, packet: usize) -> bool {
    (0..3).all(|n| header.get(offset + n * packet) == Some(&0x47))
}

impl Display for ContainerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            ContainerKind::Matroska => "Matroska/WebM",
            ContainerKind::IsoBmff => "MP4/QuickTime",
            ContainerKind::Avi => "AVI",
            ContainerKind::Flv => "FLV",
            ContainerKind::Asf => "ASF/WMV",
            ContainerKind::MpegProgramStream => "MPEG-PS",
            ContainerKind::MpegTransportStream => "MPEG-TS",
            ContainerKind::MpegVideo => "MPEG video",
            ContainerKind::Ogg => "Ogg",
        };
        f.write_str(name)
    }
}

/// What probing learned about a video.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    /// Signature family that admitted the file.
    pub container_kind: ContainerKind,
    /// FFmpeg demuxer name, e.g. `"mov,mp4,m4a,3gp,3g2,mj2"`.
    pub container: String,
    /// Video codec name, e.g. `"h264"`.
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub duration: Duration,
    /// Index of the video stream the transcoder should decode.
    pub stream_index: usize,
}

/// Decides whether a staged upload is a decodable video.
///
/// Implementations must not trust the upload's name and must bound how much
/// of the file they read.
pub trait FormatProber: Send + Sync {
    /// # Errors
    ///
    /// - [`ConversionError::UnsupportedFormat`] for unrecognised or
    ///   undecodable containers and codecs.
    /// - [`ConversionError::CorruptMedia`] for recognised containers whose
    ///   headers are inconsistent.
    fn probe(&self, source: &StagedSource) -> Result<MediaInfo, ConversionError>;
}

/// The FFmpeg-backed prober.
#[derive(Debug, Clone)]
pub struct FfmpegProber {
    probe_size: u64,
    analyze_duration_micros: u64,
}

impl Default for FfmpegProber {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegProber {
    pub fn new() -> Self {
        Self {
            probe_size: PROBE_SIZE_BYTES,
            analyze_duration_micros: ANALYZE_DURATION_MICROS,
        }
    }

    /// Override the stream-analysis byte budget.
    #[must_use]
    pub fn with_probe_size(mut self, bytes: u64) -> Self {
        self.probe_size = bytes.max(32);
        self
    }

    /// Probe a file that was not staged, e.g. a local file given to the CLI.
    pub fn probe_path(&self, path: &Path) -> Result<MediaInfo, ConversionError> {
        let header = read_header(path)?;
        let kind = ContainerKind::sniff(&header).ok_or_else(|| {
            ConversionError::UnsupportedFormat(
                "file does not start with a recognised video container signature".to_string(),
            )
        })?;
        log::debug!("{} matched the {kind} signature", path.display());

        crate::ffmpeg::ensure_initialized()?;
        let input = self.open_input(path, kind)?;
        describe_input(&input, kind)
    }

    fn open_input(&self, path: &Path, kind: ContainerKind) -> Result<Input, ConversionError> {
        let mut options = Dictionary::new();
        options.set("probesize", &self.probe_size.to_string());
        options.set("analyzeduration", &self.analyze_duration_micros.to_string());
        options.set("format_whitelist", kind.demuxer_whitelist());

        ffmpeg_next::format::input_with_dictionary(&path, options).map_err(|error| {
            ConversionError::CorruptMedia(format!("{kind} header could not be parsed: {error}"))
        })
    }
}

impl FormatProber for FfmpegProber {
    fn probe(&self, source: &StagedSource) -> Result<MediaInfo, ConversionError> {
        let info = self.probe_path(source.path())?;
        log::debug!(
            "Probed source {}: {} {}x{} @ {} fps, {:.2}s",
            source.id(),
            info.codec,
            info.width,
            info.height,
            info.frame_rate,
            info.duration.as_secs_f64(),
        );
        Ok(info)
    }
}

fn read_header(path: &Path) -> Result<Vec<u8>, ConversionError> {
    let file = File::open(path)?;
    let mut header = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut header)?;
    Ok(header)
}

fn describe_input(input: &Input, kind: ContainerKind) -> Result<MediaInfo, ConversionError> {
    let stream = input.streams().best(Type::Video).ok_or_else(|| {
        ConversionError::CorruptMedia(format!("{kind} container holds no video stream"))
    })?;
    let parameters = stream.parameters();

    let codec_id = parameters.id();
    if !ALLOWED_CODECS.contains(&codec_id) {
        return Err(ConversionError::UnsupportedFormat(format!(
            "video codec {} is not supported",
            codec_id.name()
        )));
    }
    if ffmpeg_next::decoder::find(codec_id).is_none() {
        return Err(ConversionError::UnsupportedFormat(format!(
            "no decoder available for {}",
            codec_id.name()
        )));
    }

    let decoder = CodecContext::from_parameters(parameters)
        .and_then(|context| context.decoder().video())
        .map_err(|error| {
            ConversionError::CorruptMedia(format!("video stream parameters are unusable: {error}"))
        })?;
    let (width, height) = (decoder.width(), decoder.height());
    if width == 0 || height == 0 {
        return Err(ConversionError::CorruptMedia(format!(
            "video dimensions {width}x{height} are invalid"
        )));
    }

    let frame_rate = rational_to_frame_rate(stream.avg_frame_rate())
        .or_else(|| rational_to_frame_rate(stream.rate()))
        .ok_or_else(|| ConversionError::CorruptMedia("video frame rate is missing".to_string()))?;

    let duration = container_duration(input)
        .or_else(|| stream_duration(stream.duration(), stream.time_base()))
        .ok_or_else(|| ConversionError::CorruptMedia("media duration is zero".to_string()))?;

    Ok(MediaInfo {
        container_kind: kind,
        container: input.format().name().to_string(),
        codec: codec_id.name().to_string(),
        width,
        height,
        frame_rate,
        duration,
        stream_index: stream.index(),
    })
}

fn rational_to_frame_rate(rate: Rational) -> Option<FrameRate> {
    let (numerator, denominator) = (rate.numerator(), rate.denominator());
    if numerator <= 0 || denominator <= 0 {
        return None;
    }
    FrameRate::new(numerator as u32, denominator as u32).ok()
}

fn container_duration(input: &Input) -> Option<Duration> {
    let micros = input.duration();
    (micros > 0).then(|| Duration::from_micros(micros as u64))
}

fn stream_duration(duration: i64, time_base: Rational) -> Option<Duration> {
    if duration <= 0 || time_base.denominator() <= 0 || time_base.numerator() <= 0 {
        return None;
    }
    let seconds = duration as f64 * time_base.numerator() as f64 / time_base.denominator() as f64;
    (seconds.is_finite() && seconds > 0.0).then(|| Duration::from_secs_f64(seconds))
}
