use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use pixelift_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use pixelift_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use pixelift_core::pixels::PixelBuffer;
use pixelift_core::session::ExecutionTarget;
use pixelift_core::upscale::{ProgressEvent, UpscaleOptions, Upscaler};

#[derive(Parser)]
#[command(name = "pixelift", about = "Tiled AI image upscaling")]
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
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Path to the source image")]
    input: PathBuf,

    #[arg(short = 'o', long, help = "Path to write the upscaled image")]
    output: PathBuf,

    #[arg(long, help = "Override the ONNX model path")]
    model: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PIXELS",
        help = "Tile edge length, bounded to [64, 512]"
    )]
    tile_size: Option<u32>,

    #[arg(
        long,
        value_name = "PIXELS",
        help = "Tile overlap, bounded to [0, 32] (reserved; no seam blending)"
    )]
    overlap: Option<u32>,

    #[arg(long, help = "Execution target: cpu or cuda")]
    target: Option<String>,

    #[arg(
        long,
        value_name = "COUNT",
        help = "Intra-op thread count for CPU inference"
    )]
    threads: Option<usize>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    pixelift_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    pixelift_core::runtime::log_runtime_lib_status();
    log_startup_metadata(resolved_data_dir.as_path());

    match cli.command {
        Commands::Run(run) => run_upscale_command(run, &resolved_data_dir).await,
    }
}

async fn run_upscale_command(args: RunArgs, data_dir: &Path) -> Result<()> {
    initialize_data_dir(data_dir)?;
    let config = AppConfig::load_from_path(&config_path(data_dir))?;

    let mut session_options = config.session_options(data_dir, args.model.as_deref());
    if let Some(target) = args.target.as_deref() {
        session_options.target = ExecutionTarget::from_str_lossy(target);
    }
    if let Some(threads) = args.threads {
        session_options.intra_threads = threads;
    }

    let options = UpscaleOptions {
        tile_size: args.tile_size.unwrap_or(config.upscale.tile_size),
        overlap: args.overlap.unwrap_or(config.upscale.overlap),
    }
    .clamped();

    let source = load_image(&args.input)?;
    info!(
        width = source.width(),
        height = source.height(),
        input = %args.input.display(),
        "Image loaded"
    );

    let mut upscaler = Upscaler::new(session_options.clone());
    upscaler.set_source(source);

    info!(
        model = %session_options.model_path.display(),
        execution_target = %session_options.target,
        tile_size = options.tile_size,
        overlap = options.overlap,
        "Upscaling"
    );

    let mut progress = |event: ProgressEvent| match event {
        ProgressEvent::TileCompleted { completed, total } => {
            info!(completed, total, "Processing tile");
        }
        ProgressEvent::Done { total } => {
            info!(total, "Done");
        }
    };
    let (result, job) = upscaler.upscale(options, Some(&mut progress)).await?;

    save_image(&args.output, &result)?;
    info!(
        width = result.width(),
        height = result.height(),
        tiles = job.total_tiles,
        output = %args.output.display(),
        "Upscaled image written"
    );

    Ok(())
}

fn load_image(path: &Path) -> Result<PixelBuffer> {
    let image = image::open(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    Ok(PixelBuffer::from_rgba(width, height, image.into_raw()))
}

fn save_image(path: &Path, buffer: &PixelBuffer) -> Result<()> {
    let image =
        image::RgbaImage::from_raw(buffer.width(), buffer.height(), buffer.as_raw().to_vec())
            .context("upscaled buffer has inconsistent dimensions")?;
    image
        .save(path)
        .with_context(|| format!("failed to write image: {}", path.display()))?;
    Ok(())
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
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
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

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
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let pid = std::process::id();
    let cfg_path = config_path(data_dir);
    info!(
        pid,
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}
