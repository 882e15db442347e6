//! Configuration and option parsing tests.

use std::path::PathBuf;
use std::time::Duration;

use figment::Jail;
use gifsmith::{ConfigError, ConversionError, ConversionOptions, FrameRate, ServiceConfig};

fn load() -> Result<ServiceConfig, figment::Error> {
    ServiceConfig::from_env().map_err(|error| figment::Error::from(error.to_string()))
}

// ── ServiceConfig ──────────────────────────────────────────────────

#[test]
fn defaults_match_documented_values() {
    Jail::expect_with(|_jail| {
        let config = load()?;
        assert_eq!(config.max_upload_bytes, 100 * 1024 * 1024);
        assert_eq!(config.max_conversion_duration, Duration::from_secs(60));
        assert_eq!(config.max_output_width, 640);
        assert_eq!(config.max_frame_rate, 30);
        assert_eq!(config.artifact_ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_queued_conversions, 0);
        assert_eq!(config.max_artifact_count, None);
        assert!(config.max_concurrent_conversions >= 1);
        Ok(())
    });
}

#[test]
fn environment_values_override_defaults() {
    Jail::expect_with(|jail| {
        jail.set_env("ARTIFACT_STORAGE_ROOT", "/srv/gifs");
        jail.set_env("MAX_UPLOAD_BYTES", "1048576");
        jail.set_env("MAX_CONVERSION_DURATION_SECONDS", "15");
        jail.set_env("MAX_OUTPUT_WIDTH", "320");
        jail.set_env("MAX_CONCURRENT_CONVERSIONS", "3");
        jail.set_env("MAX_QUEUED_CONVERSIONS", "5");
        jail.set_env("QUEUE_WAIT_SECONDS", "0");
        jail.set_env("ARTIFACT_TTL_SECONDS", "600");
        jail.set_env("MAX_ARTIFACT_COUNT", "50");

        let config = load()?;
        assert_eq!(config.storage_root, PathBuf::from("/srv/gifs"));
        assert_eq!(config.max_upload_bytes, 1_048_576);
        assert_eq!(config.max_conversion_duration, Duration::from_secs(15));
        assert_eq!(config.max_output_width, 320);
        assert_eq!(config.max_concurrent_conversions, 3);
        assert_eq!(config.max_queued_conversions, 5);
        assert_eq!(config.queue_wait, Duration::ZERO);
        assert_eq!(config.artifact_ttl, Duration::from_secs(600));
        assert_eq!(config.max_artifact_count, Some(50));
        Ok(())
    });
}

#[test]
fn unrelated_variables_are_ignored() {
    Jail::expect_with(|jail| {
        jail.set_env("MAX_WIDGETS", "lots");
        jail.set_env("OUTPUT_WIDTH", "0");

        let config = load()?;
        assert_eq!(config.max_output_width, 640);
        Ok(())
    });
}

#[test]
fn unparseable_value_is_rejected() {
    Jail::expect_with(|jail| {
        jail.set_env("MAX_UPLOAD_BYTES", "lots");

        match ServiceConfig::from_env() {
            Err(ConfigError::Environment(error)) => {
                assert!(error.to_string().to_lowercase().contains("max_upload_bytes"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    });
}

#[test]
fn zero_width_is_rejected() {
    Jail::expect_with(|jail| {
        jail.set_env("MAX_OUTPUT_WIDTH", "0");

        assert!(matches!(
            ServiceConfig::from_env(),
            Err(ConfigError::InvalidValue { key: "MAX_OUTPUT_WIDTH", .. })
        ));
        Ok(())
    });
}

#[test]
fn oversized_width_is_capped_at_gif_maximum() {
    Jail::expect_with(|jail| {
        jail.set_env("MAX_OUTPUT_WIDTH", "100000");

        let config = load()?;
        assert_eq!(config.max_output_width, u16::MAX as u32);
        Ok(())
    });
}

#[test]
fn limits_cap_frame_rate_at_gif_maximum() {
    let limits = ServiceConfig::default().with_max_frame_rate(120).limits();
    assert_eq!(limits.max_frame_rate, FrameRate::whole(gifsmith::GIF_MAX_FRAME_RATE));
}

// ── FrameRate ──────────────────────────────────────────────────────

#[test]
fn frame_rate_parses_integers_decimals_and_fractions() {
    assert_eq!("12".parse::<FrameRate>().unwrap(), FrameRate::whole(12));
    assert_eq!(
        "30000/1001".parse::<FrameRate>().unwrap(),
        FrameRate::new(30000, 1001).unwrap()
    );
    let decimal = "12.5".parse::<FrameRate>().unwrap();
    assert!((decimal.as_f64() - 12.5).abs() < 1e-9);
}

#[test]
fn frame_rate_rejects_zero_and_garbage() {
    assert!(matches!(
        "0".parse::<FrameRate>(),
        Err(ConversionError::InvalidOptions(_))
    ));
    assert!(matches!(
        FrameRate::new(24, 0),
        Err(ConversionError::InvalidOptions(_))
    ));
    assert!("fast".parse::<FrameRate>().is_err());
    assert!("-5".parse::<FrameRate>().is_err());
}

#[test]
fn frame_rate_comparisons_use_exact_ratios() {
    let ntsc = FrameRate::new(30000, 1001).unwrap();
    assert!(FrameRate::whole(30).exceeds(ntsc));
    assert!(!ntsc.exceeds(FrameRate::whole(30)));
    assert_eq!(ntsc.min(FrameRate::whole(24)), FrameRate::whole(24));
}

// ── ConversionOptions ──────────────────────────────────────────────

#[test]
fn options_default_to_looping_whole_clip() {
    let options = ConversionOptions::new();
    assert!(options.looping);
    assert_eq!(options.target_width, None);
    assert_eq!(options.start_offset, None);
    assert_eq!(options.duration, None);
}

#[test]
fn time_range_sets_offset_and_duration() {
    let options = ConversionOptions::new()
        .with_time_range(Duration::from_secs(2), Duration::from_millis(6500))
        .unwrap();
    assert_eq!(options.start_offset, Some(Duration::from_secs(2)));
    assert_eq!(options.duration, Some(Duration::from_millis(4500)));
}

#[test]
fn inverted_time_range_is_invalid() {
    let result =
        ConversionOptions::new().with_time_range(Duration::from_secs(5), Duration::from_secs(5));
    assert!(matches!(result, Err(ConversionError::InvalidOptions(_))));
}
