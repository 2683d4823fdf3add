use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use krafity_core::angle::{AngleGenerator, CameraAngle};
use krafity_core::canvas::Canvas;
use krafity_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use krafity_core::graph::{FrameGraph, FrameNode};
use krafity_core::jobs::{HttpJobBackend, JobPoller, PollOutcome, PollState};
use krafity_core::logging::{
    self, LogFilters, Scrubbed, DEFAULT_LOG_FILTER, DEFAULT_LOG_RETENTION_FILES,
};
use krafity_core::media::FfmpegFrameExtractor;
use krafity_core::merge::{ChainMerger, MergeMode};
use krafity_core::session::{SessionOptions, StoryboardSession};

const DEFAULT_CANVAS_FILE_NAME: &str = "canvas.json";

#[derive(Parser)]
#[command(name = "krafity", about = "Branching storyboard orchestration for AI video clips")]
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

    #[arg(
        long,
        value_name = "FILE",
        global = true,
        help = "Canvas document to operate on (default: <data-dir>/canvas.json)"
    )]
    canvas: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every root-to-leaf path of the storyboard.
    Graph,
    /// Poll every pending job until none remain.
    Watch,
    /// Submit a clip continuing from a frame and wait for it.
    Submit(SubmitArgs),
    /// Merge a chain of finished clips into one.
    Merge(MergeArgs),
    /// Re-render an image from another camera angle.
    Angle(AngleArgs),
}

#[derive(Args)]
struct SubmitArgs {
    #[arg(help = "Frame the new clip starts from")]
    parent: String,
    #[arg(help = "Text prompt for the clip")]
    prompt: String,
    #[arg(long, help = "Return right after submission instead of polling")]
    no_wait: bool,
}

#[derive(Args)]
struct MergeArgs {
    #[arg(help = "Frame the chain is collected from")]
    node: String,
    #[arg(long, default_value_t = MergeMode::Subtree, value_parser = parse_merge_mode)]
    mode: MergeMode,
}

#[derive(Args)]
struct AngleArgs {
    #[arg(help = "Source image")]
    image: PathBuf,
    #[arg(long, default_value_t = 0, help = "Degrees around the subject (multiple of 45)")]
    azimuth: u32,
    #[arg(
        long,
        default_value_t = 0,
        allow_negative_numbers = true,
        help = "Degrees above the horizon (-30, 0, 30 or 60)"
    )]
    elevation: i32,
    #[arg(long, default_value_t = 1.0, help = "Zoom factor (0.6, 1.0 or 1.4)")]
    distance: f64,
}

fn parse_merge_mode(raw: &str) -> std::result::Result<MergeMode, String> {
    raw.parse()
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let loaded_config = AppConfig::load_from_path(&config_path(&resolved_data_dir));
    let retention_files = loaded_config
        .as_ref()
        .map(|config| config.logging.retention_files)
        .unwrap_or(DEFAULT_LOG_RETENTION_FILES);
    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
        retention_files,
    );
    log_startup_metadata(&resolved_data_dir);

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = match loaded_config {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    let canvas_path = resolve_canvas_path(cli.canvas.as_deref(), &resolved_data_dir);

    match cli.command {
        Commands::Graph => print_graph(&canvas_path),
        Commands::Watch => {
            let session = open_session(&config, &resolved_data_dir, &canvas_path)?;
            run_watch(&config, session, &canvas_path).await
        }
        Commands::Submit(args) => {
            let session = open_session(&config, &resolved_data_dir, &canvas_path)?;
            run_submit(&config, session, &canvas_path, args).await
        }
        Commands::Merge(args) => {
            let session = open_session(&config, &resolved_data_dir, &canvas_path)?;
            run_merge(session, &canvas_path, args).await
        }
        Commands::Angle(args) => run_angle(&config, args).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    LogFilters::with_noise(noise_base, cli_log_filter, verbose, rust_log_env).console
}

/// Console on stderr plus a scrubbed daily file under `<data_dir>/logs`.
/// Without a writable log directory the console layer runs alone.
fn init_logging(
    data_dir: &Path,
    verbose: u8,
    cli_log_filter: Option<&str>,
    retention_files: usize,
) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filters = LogFilters::select(cli_log_filter, verbose, rust_log.as_deref());
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let (file_layer, file_error) = match logging::open_log_file(data_dir, retention_files) {
        Ok(appender) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Scrubbed::new(appender))
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            (Some(layer), None)
        }
        Err(error) => (None, Some(error)),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(error) = file_error {
        warn!(
            log_dir = %logging::log_dir(data_dir).display(),
            error = %format!("{error:#}"),
            "Persistent file logging unavailable; continuing with console-only logging"
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

fn log_startup_metadata(data_dir: &Path) {
    let cfg_path = config_path(data_dir);
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn resolve_canvas_path(cli_override: Option<&Path>, data_dir: &Path) -> PathBuf {
    cli_override
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join(DEFAULT_CANVAS_FILE_NAME))
}

fn open_session(
    config: &AppConfig,
    data_dir: &Path,
    canvas_path: &Path,
) -> Result<StoryboardSession> {
    let canvas = Canvas::load_from_path(canvas_path)?;
    let backend = HttpJobBackend::new(&config.backend.base_url, config.backend.request_timeout())?;
    let extractor = FfmpegFrameExtractor::locate();
    info!(
        canvas = %canvas_path.display(),
        shapes = canvas.shapes().len(),
        backend = %config.backend.base_url,
        ffmpeg = %extractor.binary().display(),
        "Opened storyboard session"
    );

    Ok(StoryboardSession::new(
        canvas,
        Arc::new(backend),
        Arc::new(extractor),
        SessionOptions {
            data_dir: data_dir.to_path_buf(),
            placement_gap: config.merge.placement_gap,
        },
    ))
}

fn save_canvas(session: &StoryboardSession, canvas_path: &Path) -> Result<()> {
    session
        .canvas_snapshot()
        .save_to_path(canvas_path)
        .with_context(|| format!("failed to write canvas back to {}", canvas_path.display()))
}

fn print_graph(canvas_path: &Path) -> Result<()> {
    let canvas = Canvas::load_from_path(canvas_path)?;
    let graph = FrameGraph::reconstruct(canvas.shapes());

    for path in graph.leaf_paths() {
        println!("{}", format_path(&graph, &path));
    }
    for rejected in graph.rejected() {
        println!("rejected {}: {}", rejected.edge_id, rejected.reason);
    }
    Ok(())
}

/// `root -[0:done]-> f1 -[1:pending]-> f2`
fn format_path(graph: &FrameGraph, path: &[&FrameNode]) -> String {
    let mut line = String::new();
    for node in path {
        if let Some(edge) = graph.parent_edge(&node.id) {
            let status = edge.status.map(|status| status.as_str()).unwrap_or("-");
            line.push_str(&format!(" -[{}:{}]-> ", edge.branch_index, status));
        }
        line.push_str(&node.id);
    }
    line
}

async fn run_watch(
    config: &AppConfig,
    session: StoryboardSession,
    canvas_path: &Path,
) -> Result<()> {
    let poller = JobPoller::from_config(session.clone(), &config.backend);
    let mut finished = 0usize;

    loop {
        let handles = poller.watch_pending();
        if handles.is_empty() {
            break;
        }
        info!(jobs = handles.len(), "Watching pending jobs");

        let mut loops = JoinSet::new();
        for handle in handles {
            loops.spawn(handle);
        }

        loop {
            tokio::select! {
                joined = loops.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(Ok(outcome)) => {
                            report_outcome(outcome).await;
                            finished += 1;
                            save_canvas(&session, canvas_path)?;
                        }
                        Ok(Err(error)) | Err(error) => warn!("Polling task failed: {error}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted; stopping all polling loops");
                    poller.shutdown();
                    while let Some(joined) = loops.join_next().await {
                        if let Ok(Ok(outcome)) = joined {
                            report_outcome(outcome).await;
                        }
                    }
                    save_canvas(&session, canvas_path)?;
                    return Ok(());
                }
            }
        }
    }

    info!(finished, "No pending jobs left");
    save_canvas(&session, canvas_path)
}

async fn report_outcome(outcome: PollOutcome) {
    match outcome.state {
        PollState::Done => println!("{} done ({})", outcome.job_id, outcome.edge_id),
        _ => println!(
            "{} abandoned ({}): {:?}",
            outcome.job_id, outcome.edge_id, outcome.reason
        ),
    }
    if let Some(effects) = outcome.effects {
        if let Err(error) = effects.await {
            warn!(job_id = %outcome.job_id, "Completion pipeline task failed: {error}");
        }
    }
}

async fn run_submit(
    config: &AppConfig,
    session: StoryboardSession,
    canvas_path: &Path,
    args: SubmitArgs,
) -> Result<()> {
    let poller = JobPoller::from_config(session.clone(), &config.backend);
    let (child, handle) = poller.submit(&args.parent, &args.prompt).await?;
    save_canvas(&session, canvas_path)?;
    println!("submitted frame {} via {}", child.frame_id, child.edge_id);

    if args.no_wait {
        return Ok(());
    }
    if let Some(handle) = handle {
        let outcome = handle.await.context("polling task failed")?;
        report_outcome(outcome).await;
        save_canvas(&session, canvas_path)?;
    }
    Ok(())
}

async fn run_merge(session: StoryboardSession, canvas_path: &Path, args: MergeArgs) -> Result<()> {
    let outcome = ChainMerger::new(session.clone())
        .merge(&args.node, args.mode)
        .await?;
    save_canvas(&session, canvas_path)?;

    println!(
        "merged {} clips ({}) into {} on frame {}",
        outcome.urls.len(),
        outcome.mode,
        outcome.merged_url,
        outcome.frame_id
    );
    if !outcome.thumbnail_attached {
        println!("thumbnail unavailable; see log for details");
    }
    Ok(())
}

async fn run_angle(config: &AppConfig, args: AngleArgs) -> Result<()> {
    let angle = CameraAngle::new(args.azimuth, args.elevation, args.distance)?;
    let image = std::fs::read(&args.image)
        .with_context(|| format!("failed to read image: {}", args.image.display()))?;
    let file_name = args
        .image
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("frame.png")
        .to_string();

    let generator = AngleGenerator::from_config(&config.generation)?;
    let generated = generator.generate(&image, &file_name, angle).await?;
    println!(
        "{} ({}x{})",
        generated.url, generated.size.width, generated.size.height
    );
    Ok(())
}
