//! Human-readable inspection of probed media.
//!
//! [`validate_media_info`] looks at what the prober learned about an upload
//! and at the limits a conversion will run under, and explains in advance
//! what will happen: which limits will clamp the output, and which
//! properties of the source are unusual.
//!
//! # Example
//!
//! ```no_run
//! use gifsmith::{FfmpegProber, ServiceConfig, validate_media_info};
//!
//! let info = FfmpegProber::new().probe_path("clip.mp4".as_ref())?;
//! let report = validate_media_info(&info, &ServiceConfig::default().limits());
//! if !report.is_valid() {
//!     print!("{report}");
//! }
//! # Ok::<(), gifsmith::ConversionError>(())
//! ```

use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::configuration::{ConversionLimits, FrameRate};
use crate::probe::MediaInfo;

/// Frame rates above this are reported as unusual.
const HIGH_FRAME_RATE: u32 = 240;

/// Summary of a media inspection.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Informational notices (not problems).
    pub info: Vec<String>,
    /// Properties that will change or degrade the output.
    pub warnings: Vec<String>,
    /// Properties that will make a conversion fail.
    pub errors: Vec<String>,
}

impl ValidationReport {
    /// `true` if no errors were found. Warnings do not count.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Total number of entries (info + warnings + errors).
    pub fn issue_count(&self) -> usize {
        self.info.len() + self.warnings.len() + self.errors.len()
    }
}

impl Display for ValidationReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        for item in &self.info {
            writeln!(f, "[INFO] {item}")?;
        }
        for item in &self.warnings {
            writeln!(f, "[WARN] {item}")?;
        }
        for item in &self.errors {
            writeln!(f, "[ERROR] {item}")?;
        }
        if self.issue_count() == 0 {
            writeln!(f, "No issues found.")?;
        }
        Ok(())
    }
}

/// Check probed media against the limits a conversion would use.
pub fn validate_media_info(info: &MediaInfo, limits: &ConversionLimits) -> ValidationReport {
    let mut report = ValidationReport::default();

    report.info.push(format!(
        "{} container ({}), {} {}x{} @ {} fps, {:.2}s",
        info.container_kind,
        info.container,
        info.codec,
        info.width,
        info.height,
        info.frame_rate,
        info.duration.as_secs_f64(),
    ));

    if info.width == 0 || info.height == 0 {
        report.errors.push(format!(
            "Invalid video dimensions: {}x{}",
            info.width, info.height
        ));
    }
    if info.duration.is_zero() {
        report.errors.push("Media duration is zero".to_string());
    }

    if info.frame_rate.exceeds(FrameRate::whole(HIGH_FRAME_RATE)) {
        report.warnings.push(format!(
            "Unusually high frame rate ({} fps); decoding may be slow",
            info.frame_rate
        ));
    }
    if info.frame_rate.exceeds(limits.max_frame_rate) {
        report.warnings.push(format!(
            "Frame rate {} fps will be reduced to {} fps",
            info.frame_rate, limits.max_frame_rate
        ));
    }
    if info.width > limits.max_output_width {
        report.warnings.push(format!(
            "Width {} will be scaled down to {}",
            info.width, limits.max_output_width
        ));
    }
    if info.duration > limits.max_duration {
        report.warnings.push(format!(
            "Only the first {:.1}s of {:.1}s will be converted",
            limits.max_duration.as_secs_f64(),
            info.duration.as_secs_f64(),
        ));
    }

    report
}
