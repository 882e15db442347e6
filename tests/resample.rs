//! Conversion planning and temporal resampling tests.

use std::time::Duration;

use gifsmith::{
    Clamp, ContainerKind, ConversionError, ConversionLimits, ConversionOptions, ConversionPlan,
    FrameClock, FrameRate, MediaInfo, ServiceConfig, TemporalResampler,
};

fn media(width: u32, height: u32, fps: u32, seconds: f64) -> MediaInfo {
    MediaInfo {
        container_kind: ContainerKind::IsoBmff,
        container: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
        codec: "h264".to_string(),
        width,
        height,
        frame_rate: FrameRate::whole(fps),
        duration: Duration::from_secs_f64(seconds),
        stream_index: 0,
    }
}

fn default_limits() -> ConversionLimits {
    ServiceConfig::default().limits()
}

// ── Planning ───────────────────────────────────────────────────────

#[test]
fn default_plan_for_ten_second_vga_clip() {
    let plan = ConversionPlan::resolve(
        &media(640, 480, 30, 10.0),
        &ConversionOptions::new(),
        &default_limits(),
    )
    .unwrap();

    assert_eq!(plan.width, 640);
    assert_eq!(plan.height, 480);
    assert_eq!(plan.frame_rate, FrameRate::whole(30));
    assert_eq!(plan.frame_count, 300);
    assert_eq!(plan.start, Duration::ZERO);
    assert_eq!(plan.duration, Duration::from_secs(10));
    assert!(plan.looping);
    assert!(!plan.was_clamped());
}

#[test]
fn start_beyond_clip_is_invalid() {
    let result = ConversionPlan::resolve(
        &media(640, 480, 30, 8.0),
        &ConversionOptions::new().with_start_offset(Duration::from_secs(15)),
        &default_limits(),
    );
    assert!(matches!(result, Err(ConversionError::InvalidOptions(_))));
}

#[test]
fn zero_width_and_zero_duration_are_invalid() {
    let info = media(640, 480, 30, 8.0);
    let zero_width = ConversionOptions::new().with_target_width(0);
    let zero_duration = ConversionOptions::new().with_duration(Duration::ZERO);

    assert!(matches!(
        ConversionPlan::resolve(&info, &zero_width, &default_limits()),
        Err(ConversionError::InvalidOptions(_))
    ));
    assert!(matches!(
        ConversionPlan::resolve(&info, &zero_duration, &default_limits()),
        Err(ConversionError::InvalidOptions(_))
    ));
}

#[test]
fn wide_source_is_scaled_to_max_width() {
    let plan = ConversionPlan::resolve(
        &media(1920, 1080, 24, 4.0),
        &ConversionOptions::new(),
        &default_limits(),
    )
    .unwrap();

    assert_eq!((plan.width, plan.height), (640, 360));
    assert_eq!(
        plan.clamps,
        vec![Clamp::Width {
            requested: 1920,
            applied: 640
        }]
    );
}

#[test]
fn requested_width_keeps_aspect_ratio() {
    let plan = ConversionPlan::resolve(
        &media(1280, 720, 24, 4.0),
        &ConversionOptions::new().with_target_width(320),
        &default_limits(),
    )
    .unwrap();
    assert_eq!((plan.width, plan.height), (320, 180));
    assert!(!plan.was_clamped());
}

#[test]
fn explicit_frame_rate_above_limit_is_clamped() {
    let plan = ConversionPlan::resolve(
        &media(320, 240, 60, 2.0),
        &ConversionOptions::new().with_frame_rate(FrameRate::whole(60)),
        &default_limits(),
    )
    .unwrap();

    assert_eq!(plan.frame_rate, FrameRate::whole(30));
    assert_eq!(plan.frame_count, 60);
    assert!(plan.clamps.contains(&Clamp::FrameRate {
        requested: FrameRate::whole(60),
        applied: FrameRate::whole(30),
    }));
}

#[test]
fn default_frame_rate_follows_slower_source() {
    let plan = ConversionPlan::resolve(
        &media(320, 240, 15, 2.0),
        &ConversionOptions::new(),
        &default_limits(),
    )
    .unwrap();
    assert_eq!(plan.frame_rate, FrameRate::whole(15));
    assert_eq!(plan.frame_count, 30);
}

#[test]
fn request_past_clip_end_is_trimmed_silently() {
    let plan = ConversionPlan::resolve(
        &media(320, 240, 10, 8.0),
        &ConversionOptions::new()
            .with_start_offset(Duration::from_secs(6))
            .with_duration(Duration::from_secs(10)),
        &default_limits(),
    )
    .unwrap();

    assert_eq!(plan.start, Duration::from_secs(6));
    assert_eq!(plan.duration, Duration::from_secs(2));
    assert_eq!(plan.end(), Duration::from_secs(8));
    assert_eq!(plan.frame_count, 20);
    assert!(!plan.was_clamped());
}

#[test]
fn long_clip_is_capped_at_max_duration() {
    let plan = ConversionPlan::resolve(
        &media(160, 120, 10, 120.0),
        &ConversionOptions::new(),
        &default_limits(),
    )
    .unwrap();

    assert_eq!(plan.duration, Duration::from_secs(60));
    assert_eq!(plan.frame_count, 600);
    assert!(plan.clamps.contains(&Clamp::Duration {
        requested: Duration::from_secs(120),
        applied: Duration::from_secs(60),
    }));
}

#[test]
fn memory_ceiling_lowers_frame_rate_first() {
    let frame_bytes = 640 * 480 * 4;
    let limits = ConversionLimits {
        max_frame_buffer_bytes: frame_bytes * 100,
        ..default_limits()
    };
    let plan = ConversionPlan::resolve(&media(640, 480, 30, 10.0), &ConversionOptions::new(), &limits)
        .unwrap();

    assert_eq!(plan.frame_rate, FrameRate::whole(10));
    assert_eq!(plan.duration, Duration::from_secs(10));
    assert_eq!(plan.frame_count, 100);
    assert!(plan.frame_buffer_bytes() <= limits.max_frame_buffer_bytes);
    assert!(matches!(plan.clamps[0], Clamp::FrameRate { .. }));
}

#[test]
fn memory_ceiling_shortens_clip_below_rate_floor() {
    let frame_bytes = 640 * 480 * 4;
    let limits = ConversionLimits {
        max_frame_buffer_bytes: frame_bytes * 10,
        ..default_limits()
    };
    let plan = ConversionPlan::resolve(&media(640, 480, 30, 10.0), &ConversionOptions::new(), &limits)
        .unwrap();

    assert_eq!(plan.frame_rate, FrameRate::whole(2));
    assert_eq!(plan.duration, Duration::from_secs(5));
    assert_eq!(plan.frame_count, 10);
    assert!(plan.frame_buffer_bytes() <= limits.max_frame_buffer_bytes);
    assert!(plan.clamps.iter().any(|c| matches!(c, Clamp::FrameRate { .. })));
    assert!(plan.clamps.iter().any(|c| matches!(c, Clamp::Duration { .. })));
}

#[test]
fn memory_ceiling_below_one_frame_shrinks_picture() {
    let limits = ConversionLimits {
        max_frame_buffer_bytes: 1000,
        ..default_limits()
    };
    let plan = ConversionPlan::resolve(&media(640, 480, 30, 10.0), &ConversionOptions::new(), &limits)
        .unwrap();

    assert!(plan.width < 640);
    assert!(plan.width as u64 * plan.height as u64 * 4 <= 1000);
    assert_eq!(plan.frame_count, 1);
    assert!(plan.frame_buffer_bytes() <= 1000);
    assert!(plan.clamps.iter().any(|c| matches!(c, Clamp::Width { .. })));
}

// ── TemporalResampler ──────────────────────────────────────────────

/// Feed `count` frames at `source_fps` and collect (frame, repeats) pairs.
fn run_resampler(
    resampler: &mut TemporalResampler<u32>,
    count: u32,
    source_fps: f64,
) -> Vec<(u32, u64)> {
    let mut emitted = Vec::new();
    for index in 0..count {
        if let Some(emission) = resampler.push(index as f64 / source_fps, index) {
            emitted.push((emission.frame, emission.repeats));
        }
    }
    if let Some(emission) = resampler.finish() {
        emitted.push((emission.frame, emission.repeats));
    }
    emitted
}

#[test]
fn downsampling_drops_whole_frames() {
    let mut resampler = TemporalResampler::new(Duration::ZERO, FrameRate::whole(10), 10);
    let emitted = run_resampler(&mut resampler, 30, 30.0);

    let total: u64 = emitted.iter().map(|(_, repeats)| repeats).sum();
    assert_eq!(total, 10);
    assert!(emitted.iter().all(|(_, repeats)| *repeats <= 1));
    let kept: Vec<u32> = emitted
        .iter()
        .filter(|(_, repeats)| *repeats > 0)
        .map(|(frame, _)| *frame)
        .collect();
    assert_eq!(kept, vec![0, 3, 6, 9, 12, 15, 18, 21, 24, 27]);
}

#[test]
fn upsampling_duplicates_whole_frames() {
    let mut resampler = TemporalResampler::new(Duration::ZERO, FrameRate::whole(30), 30);
    let emitted = run_resampler(&mut resampler, 10, 10.0);

    assert_eq!(emitted.len(), 10);
    assert!(emitted.iter().all(|(_, repeats)| *repeats == 3));
    assert!(resampler.is_complete());
}

#[test]
fn frames_before_start_are_dropped() {
    let mut resampler = TemporalResampler::new(Duration::from_secs(1), FrameRate::whole(10), 5);
    let emitted = run_resampler(&mut resampler, 20, 10.0);

    let total: u64 = emitted.iter().map(|(_, repeats)| repeats).sum();
    assert_eq!(total, 5);
    for (frame, repeats) in &emitted {
        if *frame < 10 {
            assert_eq!(*repeats, 0, "frame {frame} precedes the start");
        }
    }
}

#[test]
fn short_stream_fills_remaining_slots_with_last_frame() {
    let mut resampler = TemporalResampler::new(Duration::ZERO, FrameRate::whole(10), 20);
    let emitted = run_resampler(&mut resampler, 5, 10.0);

    let last = emitted.last().unwrap();
    assert_eq!(*last, (4, 16));
    assert_eq!(resampler.assigned(), 20);
}

#[test]
fn frames_after_completion_are_handed_back() {
    let mut resampler = TemporalResampler::new(Duration::ZERO, FrameRate::whole(10), 2);
    assert!(resampler.push(0.0, 'a').is_none());
    assert!(resampler.has_frame());
    let first = resampler.push(0.3, 'b').unwrap();
    assert_eq!((first.frame, first.repeats), ('a', 2));
    assert!(resampler.is_complete());

    let late = resampler.push(0.4, 'c').unwrap();
    assert_eq!((late.frame, late.repeats), ('c', 0));
}

#[test]
fn finish_without_frames_yields_nothing() {
    let mut resampler: TemporalResampler<()> =
        TemporalResampler::new(Duration::ZERO, FrameRate::whole(10), 5);
    assert!(resampler.finish().is_none());
    assert!(!resampler.has_frame());
}

// ── FrameClock ─────────────────────────────────────────────────────

#[test]
fn frame_clock_spreads_rounding_across_frames() {
    let mut clock = FrameClock::new(FrameRate::whole(30));
    let delays: Vec<u16> = (0..6).map(|_| clock.next_delay()).collect();
    assert_eq!(delays, vec![3, 4, 3, 3, 4, 3]);

    let mut clock = FrameClock::new(FrameRate::whole(30));
    let total: u32 = (0..30).map(|_| clock.next_delay() as u32).sum();
    assert_eq!(total, 100);
}

#[test]
fn frame_clock_exact_for_whole_centiseconds() {
    let mut clock = FrameClock::new(FrameRate::whole(10));
    assert!((0..10).all(|_| clock.next_delay() == 10));
}

#[test]
fn frame_clock_never_drifts_for_ntsc_rates() {
    let mut clock = FrameClock::new(FrameRate::new(30000, 1001).unwrap());
    let total: u64 = (0..30_000).map(|_| clock.next_delay() as u64).sum();
    assert_eq!(total, 100_100);
}
