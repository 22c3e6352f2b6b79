use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use reframe_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use reframe_core::engine::backend::{backend_availability, BackendKind};
use reframe_core::engine::tensor::Precision;
use reframe_core::engine::{build_engine, EngineConfig, InferenceEngine};
use reframe_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use reframe_core::media::video_input::{probe_video, VideoDecoder};
use reframe_core::media::video_output::{
    output_frame_rate, EncoderConfig, OutputResolution, VideoEncoder,
};
use reframe_core::pause::FilePauseSignal;
use reframe_core::pipeline::{PipelineController, ProgressCallback};
use reframe_core::scene_cut::{build_oracle, SceneCutMethod};
use reframe_core::types::VideoProperties;

#[derive(Parser)]
#[command(
    name = "reframe",
    about = "Frame interpolation and upscaling for video files"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interpolate and/or upscale a video.
    Render(RenderArgs),
    /// Print the probed stream properties as JSON.
    Probe {
        input: PathBuf,
    },
    /// Report which inference backends can run on this machine.
    Backends,
}

#[derive(Args, Debug)]
struct RenderArgs {
    input: PathBuf,
    output: PathBuf,

    #[arg(long, help = "Interpolation model (.onnx); relative paths resolve against models_dir")]
    interpolate_model: Option<PathBuf>,
    #[arg(long, default_value = "rife4.6")]
    interpolate_arch: String,
    #[arg(long, help = "Interpolation factor (default 2 with a model, 1 without)")]
    factor: Option<f64>,

    #[arg(long, help = "Upscaling model (.onnx)")]
    upscale_model: Option<PathBuf>,
    #[arg(long, help = "Upscale in tiles of this many pixels to bound accelerator memory")]
    tile_size: Option<u32>,

    #[arg(long)]
    backend: Option<String>,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    precision: Option<Precision>,
    #[arg(long, help = "Use the coarser padding tile for 4K sources")]
    uhd: bool,
    #[arg(long)]
    ensemble: bool,

    #[arg(long)]
    scene_method: Option<SceneCutMethod>,
    #[arg(long)]
    scene_sensitivity: Option<f64>,

    #[arg(long, help = "Keep the source frame rate so extra frames slow playback")]
    slowmo: bool,
    #[arg(long, value_name = "WxH")]
    output_resolution: Option<OutputResolution>,

    #[arg(long, help = "Pause file path (default: <input>_paused_state.txt)")]
    pause_file: Option<PathBuf>,
    #[arg(long)]
    channel_capacity: Option<usize>,

    #[arg(long)]
    codec: Option<String>,
    #[arg(long)]
    crf: Option<u32>,
    #[arg(long)]
    pixel_format: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    reframe_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    reframe_core::runtime::log_runtime_lib_status();
    log_startup_metadata(Some(resolved_data_dir.as_path()));

    match cli.command {
        Commands::Render(args) => {
            let config = load_config(&resolved_data_dir);
            run_render(args, config, &resolved_data_dir).await
        }
        Commands::Probe { input } => {
            let props = tokio::task::spawn_blocking(move || probe_video(&input))
                .await
                .context("probe task panicked")??;
            println!("{}", serde_json::to_string_pretty(&props)?);
            Ok(())
        }
        Commands::Backends => {
            let report: Vec<_> = BackendKind::ALL
                .into_iter()
                .map(backend_availability)
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let init_options = LoggingInitOptions::for_cli(
        data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter.map(ToString::to_string),
    );
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: Option<&Path>) {
    let pid = std::process::id();
    let version = env!("CARGO_PKG_VERSION");
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            version,
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(version, pid, "Runtime startup metadata");
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// A model path that exists as given wins; otherwise it is looked up under `models_dir`.
fn resolve_model_path(model: &Path, models_dir: &Path) -> PathBuf {
    if model.is_absolute() || model.exists() {
        model.to_path_buf()
    } else {
        resolve_relative_to(models_dir, model)
    }
}

/// CLI flags layered over the config file's inference section.
fn engine_config_for(
    model: &Path,
    arch: &str,
    props: &VideoProperties,
    args: &RenderArgs,
    config: &AppConfig,
    data_dir: &Path,
) -> EngineConfig {
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let mut engine = EngineConfig::new(
        resolve_model_path(model, &models_dir),
        arch,
        props.width,
        props.height,
    );
    engine.backend = args
        .backend
        .clone()
        .unwrap_or_else(|| config.inference.backend.clone());
    engine.device = args
        .device
        .clone()
        .unwrap_or_else(|| config.inference.device.clone());
    engine.precision = args.precision.unwrap_or(config.inference.precision);
    engine.uhd = args.uhd;
    engine.tuning = config.inference.tuning();
    engine.cache_dir = Some(resolve_relative_to(data_dir, &config.paths.engine_cache_dir));
    engine
}

async fn load_engine(config: EngineConfig) -> Result<Arc<InferenceEngine>> {
    let model = config.model_path.clone();
    let engine = tokio::task::spawn_blocking(move || build_engine(&config))
        .await
        .context("engine build task panicked")?
        .with_context(|| format!("failed to load model {}", model.display()))?;
    Ok(Arc::new(engine))
}

fn effective_factor(args: &RenderArgs) -> f64 {
    match (args.factor, args.interpolate_model.is_some()) {
        (Some(factor), _) => factor,
        (None, true) => 2.0,
        (None, false) => 1.0,
    }
}

fn encoder_config_for(
    args: &RenderArgs,
    config: &AppConfig,
    props: &VideoProperties,
    factor: f64,
    scale: u32,
) -> EncoderConfig {
    let fps = output_frame_rate(props.frame_rate, factor, args.slowmo);
    let mut encoder = EncoderConfig::new(
        &args.output,
        props.width * scale,
        props.height * scale,
        fps,
    );
    encoder.source_path = Some(args.input.clone());
    encoder.codec = args
        .codec
        .clone()
        .unwrap_or_else(|| config.encoder.codec.clone());
    encoder.crf = args.crf.unwrap_or(config.encoder.crf);
    encoder.pixel_format = args
        .pixel_format
        .clone()
        .unwrap_or_else(|| config.encoder.pixel_format.clone());
    encoder.preset = config.encoder.preset.clone();
    encoder.output_resolution = args.output_resolution;
    encoder
}

async fn run_render(args: RenderArgs, config: AppConfig, data_dir: &Path) -> Result<()> {
    let start = Instant::now();
    let input = args.input.clone();
    let props = tokio::task::spawn_blocking(move || probe_video(&input))
        .await
        .context("probe task panicked")??;
    info!(
        input = %args.input.display(),
        width = props.width,
        height = props.height,
        fps = props.frame_rate,
        frames = ?props.frame_count,
        "Probed input"
    );

    let factor = effective_factor(&args);
    let mut pipeline_config = config.pipeline.to_pipeline_config(factor);
    if let Some(capacity) = args.channel_capacity {
        pipeline_config.channel_capacity = capacity.max(1);
    }
    let mut controller = PipelineController::new(pipeline_config)?;

    let mut interpolating = false;
    if let Some(model) = &args.interpolate_model {
        if factor <= 1.0 {
            warn!(factor, "Interpolation model given with factor <= 1; interpolation is skipped");
        } else {
            let mut engine_config =
                engine_config_for(model, &args.interpolate_arch, &props, &args, &config, data_dir);
            engine_config.ensemble = args.ensemble;
            controller = controller.with_interpolator(load_engine(engine_config).await?)?;
            interpolating = true;

            let method = args.scene_method.unwrap_or(config.scene_detect.method);
            let sensitivity = args
                .scene_sensitivity
                .unwrap_or(config.scene_detect.sensitivity);
            controller = controller.with_scene_oracle(build_oracle(method, sensitivity));
        }
    }

    let mut scale = 1;
    if let Some(model) = &args.upscale_model {
        let mut engine_config =
            engine_config_for(model, "upscale", &props, &args, &config, data_dir);
        engine_config.tile_size = args.tile_size;
        let engine = load_engine(engine_config).await?;
        scale = engine.scale();
        controller = controller.with_upscaler(engine)?;
    }

    let pause_path = args
        .pause_file
        .clone()
        .unwrap_or_else(|| FilePauseSignal::path_for_input(&args.input));
    let pause_signal = Arc::new(FilePauseSignal::create(pause_path)?);
    controller = controller.with_pause_signal(pause_signal);

    let output_factor = if interpolating { factor } else { 1.0 };
    let encoder_config = encoder_config_for(&args, &config, &props, output_factor, scale);
    let total_input = props.frame_count;
    let total_output = controller.expected_output_frames(total_input);
    let (frames_written, callback) = make_progress_callback(total_input);
    controller = controller.with_progress(callback);

    let decoder = VideoDecoder::new(&args.input, &props)?;
    let encoder = VideoEncoder::new(&encoder_config)?;

    let result = controller.run(decoder, encoder, &props).await;
    eprintln!();
    let summary = result?;

    let elapsed = start.elapsed().as_secs_f64();
    info!(
        output = %args.output.display(),
        frames_read = summary.frames_read,
        frames_written = summary.frames_written,
        expected_output = ?total_output,
        scene_cuts = summary.scene_cuts,
        pauses = summary.pauses,
        progress_frames = frames_written.load(Ordering::Relaxed),
        elapsed = %format_duration(elapsed),
        "Render complete"
    );
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

const PROGRESS_BAR_WIDTH: usize = 30;
/// Source frames excluded from the rate so engine warm-up does not skew it.
const WARMUP_SOURCE_FRAMES: u64 = 2;

/// Renders the single-line progress display, measured in source frames.
struct ProgressMeter {
    started: Instant,
    rate_started: Option<Instant>,
    total_input: Option<u64>,
}

impl ProgressMeter {
    fn new(total_input: Option<u64>) -> Self {
        Self {
            started: Instant::now(),
            rate_started: None,
            total_input,
        }
    }

    fn update(&mut self, written: u64, total_output: Option<u64>) -> String {
        let done = source_frames_done(written, total_output, self.total_input);
        if self.rate_started.is_none() && done > WARMUP_SOURCE_FRAMES {
            self.rate_started = Some(Instant::now());
        }
        let rate_elapsed = self
            .rate_started
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        progress_line(
            written,
            total_output,
            self.total_input,
            self.started.elapsed().as_secs_f64(),
            source_rate(done, rate_elapsed),
        )
    }
}

fn progress_line(
    written: u64,
    total_output: Option<u64>,
    total_input: Option<u64>,
    elapsed: f64,
    rate: f64,
) -> String {
    let done = source_frames_done(written, total_output, total_input);
    let Some(total) = total_output else {
        return format!(
            "Frame {written} | {rate:.1} fps | Elapsed: {}",
            format_duration(elapsed)
        );
    };

    let fraction = if total == 0 {
        0.0
    } else {
        (written as f64 / total as f64).clamp(0.0, 1.0)
    };
    let filled = ((fraction * PROGRESS_BAR_WIDTH as f64).round() as usize).min(PROGRESS_BAR_WIDTH);
    let bar = format!(
        "{}{}",
        "█".repeat(filled),
        "░".repeat(PROGRESS_BAR_WIDTH - filled)
    );
    let source_total = total_input.unwrap_or(total);
    let eta = if rate > 0.0 {
        let remaining = source_total.saturating_sub(done) as f64;
        format!(" | ETA: {}", format_duration(remaining / rate))
    } else {
        String::new()
    };

    format!(
        "[{bar}] {:5.1}% | Frame {done}/{source_total} | {rate:.1} fps | Elapsed: {}{eta}",
        fraction * 100.0,
        format_duration(elapsed),
    )
}

fn source_rate(done: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || done <= WARMUP_SOURCE_FRAMES {
        return 0.0;
    }
    (done - WARMUP_SOURCE_FRAMES) as f64 / elapsed
}

/// Map output frames back to source frames when interpolation multiplies them.
fn source_frames_done(written: u64, total_output: Option<u64>, total_input: Option<u64>) -> u64 {
    match (total_output, total_input) {
        (Some(outputs), Some(inputs)) if outputs > 0 => {
            (written as f64 * inputs as f64 / outputs as f64).round() as u64
        }
        _ => written,
    }
}

fn make_progress_callback(total_input: Option<u64>) -> (Arc<AtomicU64>, ProgressCallback) {
    let meter = Mutex::new(ProgressMeter::new(total_input));
    let frames_written = Arc::new(AtomicU64::new(0));
    let frames_written_cb = frames_written.clone();
    let callback: ProgressCallback = Box::new(move |written, total_output| {
        frames_written_cb.store(written, Ordering::Relaxed);
        if let Ok(mut meter) = meter.lock() {
            let line = meter.update(written, total_output);
            eprint!("\r{line}    ");
        }
    });
    (frames_written, callback)
}
