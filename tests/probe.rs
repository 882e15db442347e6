//! Format probing tests.
//!
//! Signature tests run everywhere. Tests that open real media require
//! fixture files from `tests/fixtures/generate_fixtures.sh`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use gifsmith::{
    ContainerKind, ConversionError, FfmpegProber, FormatProber, ServiceConfig, StorageManager,
    validate_media_info,
};

fn sample_video_path() -> &'static str {
    "tests/fixtures/sample_video.mp4"
}

fn sample_webm_path() -> &'static str {
    "tests/fixtures/sample_video.webm"
}

fn probe_bytes(bytes: &[u8]) -> Result<gifsmith::MediaInfo, ConversionError> {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let storage = StorageManager::open(&ServiceConfig::new(dir.path())).unwrap();
    let source = storage.stage(bytes).unwrap();
    FfmpegProber::new().probe(&source)
}

// ── Signatures ─────────────────────────────────────────────────────

#[test]
fn sniff_recognises_allowed_containers() {
    let mut mp4 = vec![0x00, 0x00, 0x00, 0x18];
    mp4.extend_from_slice(b"ftypisom");
    assert_eq!(ContainerKind::sniff(&mp4), Some(ContainerKind::IsoBmff));

    let mut mov = vec![0x00, 0x00, 0x00, 0x08];
    mov.extend_from_slice(b"wide");
    assert_eq!(ContainerKind::sniff(&mov), Some(ContainerKind::IsoBmff));

    assert_eq!(
        ContainerKind::sniff(&[0x1A, 0x45, 0xDF, 0xA3, 0x9F]),
        Some(ContainerKind::Matroska)
    );
    assert_eq!(
        ContainerKind::sniff(b"RIFF\x24\x00\x00\x00AVI LIST"),
        Some(ContainerKind::Avi)
    );
    assert_eq!(
        ContainerKind::sniff(b"FLV\x01\x05\x00\x00\x00\x09"),
        Some(ContainerKind::Flv)
    );
    assert_eq!(
        ContainerKind::sniff(&[0x00, 0x00, 0x01, 0xBA, 0x44]),
        Some(ContainerKind::MpegProgramStream)
    );
    assert_eq!(
        ContainerKind::sniff(&[0x00, 0x00, 0x01, 0xB3, 0x14]),
        Some(ContainerKind::MpegVideo)
    );
    assert_eq!(ContainerKind::sniff(b"OggS\x00\x02"), Some(ContainerKind::Ogg));
}

#[test]
fn sniff_recognises_asf_header_guid() {
    let guid = [
        0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, 0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE,
        0x6C,
    ];
    assert_eq!(ContainerKind::sniff(&guid), Some(ContainerKind::Asf));
}

#[test]
fn sniff_requires_repeated_transport_stream_sync() {
    let mut ts = vec![0u8; 512];
    for offset in [0, 188, 376] {
        ts[offset] = 0x47;
    }
    assert_eq!(
        ContainerKind::sniff(&ts),
        Some(ContainerKind::MpegTransportStream)
    );

    let mut m2ts = vec![0u8; 512];
    for offset in [4, 196, 388] {
        m2ts[offset] = 0x47;
    }
    assert_eq!(
        ContainerKind::sniff(&m2ts),
        Some(ContainerKind::MpegTransportStream)
    );

    // A single 'G' is just text.
    assert_eq!(ContainerKind::sniff(b"GIF89a"), None);
}

#[test]
fn sniff_rejects_non_video_payloads() {
    assert_eq!(ContainerKind::sniff(b""), None);
    assert_eq!(ContainerKind::sniff(b"\x89PNG\r\n\x1a\n"), None);
    assert_eq!(ContainerKind::sniff(b"%PDF-1.7"), None);
    assert_eq!(ContainerKind::sniff(b"PK\x03\x04"), None);
    assert_eq!(ContainerKind::sniff(b"#!/bin/sh\nrm -rf /\n"), None);
    assert_eq!(ContainerKind::sniff(b"RIFF\x24\x00\x00\x00WAVEfmt "), None);
}

#[test]
fn every_container_has_a_demuxer_whitelist() {
    let kinds = [
        ContainerKind::Matroska,
        ContainerKind::IsoBmff,
        ContainerKind::Avi,
        ContainerKind::Flv,
        ContainerKind::Asf,
        ContainerKind::MpegProgramStream,
        ContainerKind::MpegTransportStream,
        ContainerKind::MpegVideo,
        ContainerKind::Ogg,
    ];
    for kind in kinds {
        assert!(!kind.demuxer_whitelist().is_empty(), "{kind} has no demuxer");
    }
}

// ── Rejection ──────────────────────────────────────────────────────

#[test]
fn random_bytes_are_unsupported() {
    let garbage: Vec<u8> = (0..4096u32).map(|i| (i * 7919 % 251) as u8).collect();
    assert!(matches!(
        probe_bytes(&garbage),
        Err(ConversionError::UnsupportedFormat(_))
    ));
}

#[test]
fn empty_upload_is_unsupported() {
    assert!(matches!(
        probe_bytes(b""),
        Err(ConversionError::UnsupportedFormat(_))
    ));
}

#[test]
fn image_disguised_as_video_is_unsupported() {
    // Filename and content type play no part; only the bytes are checked.
    let png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00\x00\x01\x00\x00\x00\x01";
    assert!(matches!(
        probe_bytes(png),
        Err(ConversionError::UnsupportedFormat(_))
    ));
}

#[test]
fn truncated_matroska_is_corrupt() {
    let mut bytes = vec![0x1A, 0x45, 0xDF, 0xA3];
    bytes.extend(std::iter::repeat_n(0u8, 60));
    assert!(matches!(
        probe_bytes(&bytes),
        Err(ConversionError::CorruptMedia(_))
    ));
}

#[test]
fn truncated_mp4_is_corrupt() {
    let mut bytes = vec![0x00, 0x00, 0x00, 0x18];
    bytes.extend_from_slice(b"ftypisom\x00\x00\x02\x00isomiso2");
    assert!(matches!(
        probe_bytes(&bytes),
        Err(ConversionError::CorruptMedia(_))
    ));
}

#[test]
fn truncated_fixture_is_corrupt() {
    let path = sample_video_path();
    if !Path::new(path).exists() {
        return;
    }

    let bytes = fs::read(path).unwrap();
    // The header survives but the moov/mdat boxes are cut short.
    let truncated = &bytes[..bytes.len().min(64)];
    assert!(matches!(
        probe_bytes(truncated),
        Err(ConversionError::CorruptMedia(_))
    ));
}

// ── Real media ─────────────────────────────────────────────────────

#[test]
fn probe_mp4_fixture() {
    let path = sample_video_path();
    if !Path::new(path).exists() {
        return;
    }

    let info = FfmpegProber::new().probe_path(Path::new(path)).unwrap();
    assert_eq!(info.container_kind, ContainerKind::IsoBmff);
    assert_eq!(info.codec, "h264");
    assert_eq!((info.width, info.height), (640, 480));
    assert_eq!(info.frame_rate.as_f64().round(), 30.0);
    assert!(info.duration >= Duration::from_millis(9_900));
    assert!(info.duration <= Duration::from_millis(10_100));
}

#[test]
fn probe_webm_fixture() {
    let path = sample_webm_path();
    if !Path::new(path).exists() {
        return;
    }

    let info = FfmpegProber::new().probe_path(Path::new(path)).unwrap();
    assert_eq!(info.container_kind, ContainerKind::Matroska);
    assert_eq!(info.codec, "vp9");
}

#[test]
fn validation_report_flags_clamped_properties() {
    let path = sample_video_path();
    if !Path::new(path).exists() {
        return;
    }

    let info = FfmpegProber::new().probe_path(Path::new(path)).unwrap();
    let limits = ServiceConfig::default()
        .with_max_output_width(320)
        .with_max_conversion_duration(Duration::from_secs(5))
        .limits();
    let report = validate_media_info(&info, &limits);

    assert!(report.is_valid());
    assert!(report.info.iter().any(|line| line.contains("h264")));
    assert!(report.warnings.iter().any(|line| line.contains("scaled down")));
    assert!(report.warnings.iter().any(|line| line.contains("first 5.0s")));
}
