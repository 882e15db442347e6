use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use gifsmith::{
    ConversionOptions, ConversionService, ConversionStage, FfmpegLogLevel, FfmpegProber,
    FrameRate, ProgressCallback, ProgressInfo, ServiceConfig, StorageManager, UploadRequest,
    validate_media_info,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

const CLI_AFTER_HELP: &str = "Examples:\n  gifsmith convert clip.mp4 --width 480 --fps 12 --start 3 --end 8\n  gifsmith probe clip.webm --json\n  gifsmith evict --root /var/lib/gifsmith\n  gifsmith completions zsh > _gifsmith\n\nService limits are read from the environment (MAX_OUTPUT_WIDTH, MAX_FRAME_RATE, ...).";

#[derive(Debug, Parser)]
#[command(
    name = "gifsmith",
    version,
    about = "Convert video clips into animated GIFs",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone, Default)]
struct GlobalOptions {
    /// Show additional logging output.
    #[arg(long)]
    verbose: bool,

    /// Show a progress bar while converting.
    #[arg(long)]
    progress: bool,

    /// Allow overwriting existing output files.
    #[arg(long)]
    overwrite: bool,

    /// FFmpeg log level (quiet, panic, fatal, error, warning, info, verbose, debug, trace).
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert a video file into an animated GIF.
    #[command(
        about = "Convert a video to GIF",
        after_help = "Examples:\n  gifsmith convert clip.mp4\n  gifsmith convert clip.mov --out clip.gif --width 320 --fps 10 --start 00:01:05 --duration 4\n  gifsmith convert clip.webm --no-loop --json"
    )]
    Convert {
        /// Input video path.
        input: PathBuf,
        /// Output GIF path. Defaults to the input name with a .gif extension.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Output width in pixels; height keeps the aspect ratio.
        #[arg(long)]
        width: Option<u32>,
        /// Output frame rate, e.g. 12, 12.5, or 30000/1001.
        #[arg(long)]
        fps: Option<String>,
        /// Start time (seconds, MM:SS, or HH:MM:SS).
        #[arg(long)]
        start: Option<String>,
        /// End time (seconds, MM:SS, or HH:MM:SS).
        #[arg(long, conflicts_with = "duration")]
        end: Option<String>,
        /// Length of the clip to convert.
        #[arg(long)]
        duration: Option<String>,
        /// Play once instead of looping forever.
        #[arg(long)]
        no_loop: bool,
        /// Storage root for staging and artifacts. A temporary directory is
        /// used when omitted.
        #[arg(long)]
        root: Option<PathBuf>,
        /// Print the artifact metadata as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check whether a file is a convertible video.
    #[command(
        about = "Probe a video file",
        visible_alias = "inspect",
        after_help = "Examples:\n  gifsmith probe clip.mp4\n  gifsmith probe upload.bin --json"
    )]
    Probe {
        /// Input video path.
        input: PathBuf,
        /// Output probe results as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Apply the artifact retention policy to a storage root.
    #[command(about = "Evict expired artifacts")]
    Evict {
        /// Storage root. Defaults to ARTIFACT_STORAGE_ROOT.
        #[arg(long)]
        root: Option<PathBuf>,
        /// Also remove staged uploads older than this many seconds.
        #[arg(long)]
        sweep_staging: Option<u64>,
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    #[command(about = "Generate shell completions")]
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

fn parse_timecode(value: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("time value cannot be empty".into());
    }

    if let Ok(seconds) = trimmed.parse::<f64>() {
        return seconds_to_duration(seconds, trimmed);
    }

    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!("invalid time format: {trimmed}").into());
    }

    let (hours, minutes, seconds_str) = if parts.len() == 3 {
        (parts[0].parse::<u64>()?, parts[1].parse::<u64>()?, parts[2])
    } else {
        (0_u64, parts[0].parse::<u64>()?, parts[1])
    };

    let seconds = seconds_str.parse::<f64>()?;
    if seconds < 0.0 {
        return Err(format!("invalid time: {trimmed}").into());
    }
    let total_seconds = (hours as f64 * 3600.0) + (minutes as f64 * 60.0) + seconds;
    seconds_to_duration(total_seconds, trimmed)
}

fn seconds_to_duration(seconds: f64, original: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    if seconds < 0.0 {
        return Err(format!("invalid time: {original}").into());
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|error| format!("invalid time {original}: {error}").into())
}

fn ensure_writable_path(path: &Path, overwrite: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        if overwrite {
            eprintln!(
                "{} {}",
                "warning:".yellow().bold(),
                format!("overwriting {}", path.display()).yellow()
            );
        } else {
            return Err(format!(
                "output already exists: {} (use --overwrite to replace)",
                path.display()
            )
            .into());
        }
    }
    Ok(())
}

fn apply_global_options(global: &GlobalOptions) -> Result<(), Box<dyn std::error::Error>> {
    let default_filter = if global.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();

    let level = match &global.log_level {
        Some(level) => level.parse::<FfmpegLogLevel>()?,
        None if global.verbose => FfmpegLogLevel::Warning,
        None => FfmpegLogLevel::Error,
    };
    gifsmith::set_ffmpeg_log_level(level);
    Ok(())
}

fn build_options(
    width: Option<u32>,
    fps: Option<String>,
    start: Option<String>,
    end: Option<String>,
    duration: Option<String>,
    no_loop: bool,
) -> Result<ConversionOptions, Box<dyn std::error::Error>> {
    let mut options = ConversionOptions::new().with_loop(!no_loop);
    if let Some(width) = width {
        options = options.with_target_width(width);
    }
    if let Some(fps) = fps {
        options = options.with_frame_rate(fps.parse::<FrameRate>()?);
    }
    let start = start.as_deref().map(parse_timecode).transpose()?;
    match (start, end.as_deref().map(parse_timecode).transpose()?) {
        (start, Some(end)) => {
            options = options.with_time_range(start.unwrap_or_default(), end)?;
        }
        (Some(start), None) => options = options.with_start_offset(start),
        (None, None) => {}
    }
    if let Some(duration) = duration {
        options = options.with_duration(parse_timecode(&duration)?);
    }
    Ok(options)
}

struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.green} {bar:40.cyan/blue} {pos}/{len} frames {msg}",
        )?;
        bar.set_style(style.progress_chars("##-"));
        Ok(Self { bar })
    }
}

impl ProgressCallback for BarProgress {
    fn on_progress(&self, info: &ProgressInfo) {
        match (info.stage, info.total) {
            (ConversionStage::Converting, Some(total)) => {
                self.bar.set_length(total);
                self.bar.set_position(info.current);
            }
            (ConversionStage::Registered, _) => self.bar.finish_with_message("done"),
            (ConversionStage::Failed, _) => self.bar.abandon_with_message("failed"),
            (stage, _) => self.bar.set_message(format!("{stage:?}").to_lowercase()),
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    apply_global_options(&cli.global)?;

    match cli.command {
        Commands::Convert {
            input,
            out,
            width,
            fps,
            start,
            end,
            duration,
            no_loop,
            root,
            json,
        } => {
            let options = build_options(width, fps, start, end, duration, no_loop)?;

            let scratch = match root {
                Some(_) => None,
                None => Some(tempfile::tempdir()?),
            };
            let mut config = ServiceConfig::from_env()?;
            if let Some(root) = root {
                config = config.with_storage_root(root);
            } else if let Some(dir) = &scratch {
                config = config.with_storage_root(dir.path());
            }

            let filename = input
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            let mut request = UploadRequest::from_file(&input).with_options(options);
            if let Some(name) = filename {
                request = request.with_filename(name);
            }
            if cli.global.progress {
                request = request.with_progress(Arc::new(BarProgress::new()?));
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let service = ConversionService::new(config)?;
            let artifact = runtime.block_on(service.submit(request))?;

            let out = out.unwrap_or_else(|| {
                input
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(&artifact.metadata.suggested_filename)
            });
            ensure_writable_path(&out, cli.global.overwrite)?;
            let mut gif = service.open(&artifact.id)?;
            io::copy(&mut gif, &mut File::create(&out)?)?;
            drop(gif);
            service.release(&artifact.id)?;

            if json {
                let payload = json!({
                    "output": out.display().to_string(),
                    "artifact": artifact,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                let metadata = &artifact.metadata;
                for clamp in &metadata.clamps {
                    eprintln!("{} {}", "clamped:".yellow().bold(), format!("{clamp:?}").yellow());
                }
                println!(
                    "{} {}",
                    "saved".green().bold(),
                    format!(
                        "{} ({}x{}, {} frames @ {} fps, {} bytes)",
                        out.display(),
                        metadata.width,
                        metadata.height,
                        metadata.frame_count,
                        metadata.frame_rate,
                        metadata.size_bytes,
                    )
                    .green()
                );
            }
        }
        Commands::Probe { input, json } => {
            let limits = ServiceConfig::from_env()?.limits();
            let info = FfmpegProber::new().probe_path(&input)?;
            let report = validate_media_info(&info, &limits);
            if json {
                let payload = json!({
                    "media": info,
                    "valid": report.is_valid(),
                    "warnings": report.warnings,
                    "errors": report.errors,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("Container: {} ({})", info.container_kind, info.container);
                println!(
                    "Video: {}x{} @ {} fps [{}]",
                    info.width, info.height, info.frame_rate, info.codec
                );
                println!("Duration: {:.3}s", info.duration.as_secs_f64());
                for warning in &report.warnings {
                    eprintln!("{} {}", "warning:".yellow().bold(), warning.yellow());
                }
                for error in &report.errors {
                    eprintln!("{} {}", "error:".red().bold(), error.red());
                }
            }
        }
        Commands::Evict {
            root,
            sweep_staging,
            json,
        } => {
            let mut config = ServiceConfig::from_env()?;
            if let Some(root) = root {
                config = config.with_storage_root(root);
            }
            let storage = StorageManager::open(&config)?;
            let report = storage.evict()?;
            let swept = match sweep_staging {
                Some(seconds) => storage.sweep_orphaned_staging(Duration::from_secs(seconds))?,
                None => 0,
            };
            if json {
                let payload = json!({
                    "expired": report.expired,
                    "over_capacity": report.over_capacity,
                    "retained": report.retained,
                    "staging_swept": swept,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!(
                    "{} {}",
                    "evicted".green().bold(),
                    format!(
                        "{} expired, {} over capacity, {} retained, {} staged files swept",
                        report.expired, report.over_capacity, report.retained, swept
                    )
                    .green()
                );
            }
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "gifsmith", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("{} {error}", "error:".red().bold());
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{build_options, parse_timecode};

    #[test]
    fn parse_timecode_formats() {
        let seconds = parse_timecode("75").unwrap();
        assert_eq!(seconds.as_secs(), 75);

        let mm_ss = parse_timecode("01:15").unwrap();
        assert_eq!(mm_ss.as_secs(), 75);

        let hh_mm_ss = parse_timecode("00:01:15.5").unwrap();
        assert_eq!(hh_mm_ss.as_millis(), 75_500);

        assert!(parse_timecode("-3").is_err());
        assert!(parse_timecode("a:b").is_err());
    }

    #[test]
    fn parse_timecode_rejects_unrepresentable_values() {
        assert!(parse_timecode("1e30").is_err());
        assert!(parse_timecode("inf").is_err());
        assert!(parse_timecode("NaN").is_err());
        assert!(parse_timecode("0:0:inf").is_err());
        assert!(parse_timecode("1:-5").is_err());
        assert!(parse_timecode(&format!("{}:00", u64::MAX)).is_err());
    }

    #[test]
    fn end_without_start_starts_at_zero() {
        let options =
            build_options(None, None, None, Some("4".to_string()), None, false).unwrap();
        assert_eq!(options.start_offset, Some(std::time::Duration::ZERO));
        assert_eq!(options.duration, Some(std::time::Duration::from_secs(4)));
        assert!(options.looping);
    }

    #[test]
    fn no_loop_flag_disables_looping() {
        let options = build_options(Some(320), Some("12".to_string()), None, None, None, true)
            .unwrap();
        assert!(!options.looping);
        assert_eq!(options.target_width, Some(320));
    }
}
