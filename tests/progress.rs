//! Progress and cancellation integration tests.
//!
//! Tests that transcode require fixture files from
//! `tests/fixtures/generate_fixtures.sh`.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gifsmith::{
    CancellationToken, ConversionControl, ConversionError, ConversionOptions, ConversionPlan,
    ConversionStage, FfmpegProber, FormatProber, FrameRate, GifTranscoder, ProgressCallback,
    ProgressInfo, ServiceConfig, StorageManager, Transcoder,
};

fn sample_video_path() -> &'static str {
    "tests/fixtures/sample_video.mp4"
}

// ── CancellationToken ──────────────────────────────────────────────

#[test]
fn cancellation_token_default_not_cancelled() {
    let token = CancellationToken::default();
    assert!(!token.is_cancelled());
    assert!(token.check().is_ok());
}

#[test]
fn cancellation_token_cancel_is_idempotent() {
    let token = CancellationToken::new();
    token.cancel();
    token.cancel();
    assert!(token.is_cancelled());
    assert!(matches!(token.check(), Err(ConversionError::Cancelled)));
}

#[test]
fn cancellation_token_clone_shares_state() {
    let token = CancellationToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());

    token.cancel();
    assert!(clone.is_cancelled());
}

#[test]
fn cancellation_crosses_threads() {
    let token = CancellationToken::new();
    let worker = {
        let token = token.clone();
        std::thread::spawn(move || {
            while !token.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };
    token.cancel();
    worker.join().unwrap();
}

// ── ConversionControl ──────────────────────────────────────────────

#[test]
fn control_uses_supplied_token() {
    let token = CancellationToken::new();
    let control = ConversionControl::new().with_cancellation(token.clone());
    assert!(control.check_cancelled().is_ok());

    token.cancel();
    assert!(control.cancellation().is_cancelled());
    assert!(matches!(
        control.check_cancelled(),
        Err(ConversionError::Cancelled)
    ));
}

#[test]
fn control_debug_hides_callback() {
    let control = ConversionControl::new().with_batch_size(0);
    let debug = format!("{control:?}");
    assert!(debug.contains("batch_size: 1"));
    assert!(debug.contains("cancelled: false"));
}

// ── Progress during transcoding ────────────────────────────────────

#[derive(Default)]
struct Collector(Mutex<Vec<ProgressInfo>>);

impl ProgressCallback for Collector {
    fn on_progress(&self, info: &ProgressInfo) {
        self.0.lock().unwrap().push(info.clone());
    }
}

fn convert_fixture(
    options: ConversionOptions,
    control: &ConversionControl,
) -> Option<Result<gifsmith::RenderedGif, ConversionError>> {
    let path = sample_video_path();
    if !Path::new(path).exists() {
        return None;
    }

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = ServiceConfig::new(dir.path());
    let storage = StorageManager::open(&config).unwrap();
    let source = storage.stage(std::fs::File::open(path).unwrap()).unwrap();
    let info = FfmpegProber::new().probe(&source).unwrap();
    let plan = ConversionPlan::resolve(&info, &options, &config.limits()).unwrap();
    Some(GifTranscoder::new().convert(&source, &info, &plan, control))
}

#[test]
fn transcoding_reports_every_batch() {
    let collector = Arc::new(Collector::default());
    let control = ConversionControl::new()
        .with_progress(collector.clone())
        .with_batch_size(5);
    let options = ConversionOptions::new()
        .with_frame_rate(FrameRate::whole(10))
        .with_duration(Duration::from_secs(2))
        .with_target_width(160);

    let Some(result) = convert_fixture(options, &control) else {
        return;
    };
    let rendered = result.unwrap();
    assert_eq!(rendered.frame_count, 20);

    let reports = collector.0.lock().unwrap();
    // Four batches of five plus the final report.
    assert_eq!(reports.len(), 5);
    assert!(reports.iter().all(|info| info.stage == ConversionStage::Converting));
    assert!(reports.iter().all(|info| info.total == Some(20)));

    let currents: Vec<u64> = reports.iter().map(|info| info.current).collect();
    assert_eq!(currents, vec![5, 10, 15, 20, 20]);

    let last = reports.last().unwrap();
    assert_eq!(last.percentage, Some(100.0));
    assert_eq!(last.estimated_remaining, Some(Duration::ZERO));
}

#[test]
fn pre_cancelled_transcode_stops_immediately() {
    let token = CancellationToken::new();
    token.cancel();
    let control = ConversionControl::new().with_cancellation(token);

    let Some(result) = convert_fixture(ConversionOptions::new(), &control) else {
        return;
    };
    assert!(matches!(result, Err(ConversionError::Cancelled)));
}

#[test]
fn cancelling_from_callback_stops_transcode() {
    struct CancelAfter {
        token: CancellationToken,
        frames: u64,
    }

    impl ProgressCallback for CancelAfter {
        fn on_progress(&self, info: &ProgressInfo) {
            if info.current >= self.frames {
                self.token.cancel();
            }
        }
    }

    let token = CancellationToken::new();
    let control = ConversionControl::new()
        .with_cancellation(token.clone())
        .with_progress(Arc::new(CancelAfter {
            token: token.clone(),
            frames: 10,
        }));

    let Some(result) = convert_fixture(ConversionOptions::new(), &control) else {
        return;
    };
    assert!(matches!(result, Err(ConversionError::Cancelled)));
    assert!(token.is_cancelled());
}
