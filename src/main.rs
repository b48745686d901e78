//! CLI entrypoint: boots the scan service or drives task lifecycle from
//! the command line, following the corpus's `clap`-derive command shape.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use google_maps::Client as GoogleMapsClient;
use tracing_subscriber::EnvFilter;

use scanrel::bus::Bus;
use scanrel::cache::{CacheBackend, FsCacheBackend, S3CacheBackend};
use scanrel::config::Config;
use scanrel::controller::TaskController;
use scanrel::elevation::{ElevationProvider, ElevationSampler, GoogleElevationProvider, HgtElevationProvider};
use scanrel::log_format::TargetFirstFormat;
use scanrel::metrics;
use scanrel::model::TaskId;
use scanrel::region::{Grid, Region};
use scanrel::snapshot::{ImageSnapshotRenderer, SnapshotRenderer};
use scanrel::web;

#[derive(Parser, Debug)]
#[command(name = "scanrel", about = "Progressive geospatial scan and tile-streaming service")]
struct Cli {
    /// Path to an optional TOML config file (defaults checked before env vars).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts the HTTP/WebSocket server.
    Serve,
    /// Creates a new scan task and prints its id.
    CreateTask {
        #[arg(long)]
        lat_min: f64,
        #[arg(long)]
        lat_max: f64,
        #[arg(long)]
        lon_min: f64,
        #[arg(long)]
        lon_max: f64,
        #[arg(long)]
        levels: Option<u32>,
        #[arg(long)]
        grid_y: Option<u32>,
        #[arg(long)]
        grid_x: Option<u32>,
    },
    /// Starts (or resumes) a task's executor.
    Start { task_id: TaskId },
    /// Pauses a running task.
    Pause { task_id: TaskId },
    /// Resumes a paused task.
    Resume { task_id: TaskId },
    /// Stops a task, freezing its schedule.
    Stop { task_id: TaskId },
    /// Prints a task's status and counters.
    Status { task_id: TaskId },
    /// Lists all known tasks.
    ListTasks,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .event_format(TargetFirstFormat)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let controller = Arc::new(build_controller(config).await?);

    match cli.command {
        Command::Serve => {
            metrics::init_metrics();
            metrics::initialize_scan_metrics();
            tokio::spawn(metrics::process_metrics_task());

            let bind_addr = controller.config().bind_addr.clone();
            web::start_web_server(&bind_addr, controller).await?;
        }
        Command::CreateTask { lat_min, lat_max, lon_min, lon_max, levels, grid_y, grid_x } => {
            let config = controller.config();
            let region = Region { lat_min, lat_max, lon_min, lon_max };
            let grid = Grid {
                rows: grid_y.unwrap_or(config.grid_y),
                cols: grid_x.unwrap_or(config.grid_x),
            };
            let task_id = controller.create(region, levels.unwrap_or(config.levels), grid).await?;
            println!("{task_id}");
        }
        Command::Start { task_id } => controller.start(task_id).await?,
        Command::Pause { task_id } => controller.pause(task_id).await?,
        Command::Resume { task_id } => controller.resume(task_id).await?,
        Command::Stop { task_id } => controller.stop(task_id).await?,
        Command::Status { task_id } => {
            let status = controller.status(task_id).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "status": status.status,
                "counters": status.counters,
                "last_error": status.last_error,
            }))?);
        }
        Command::ListTasks => {
            let tasks = controller.list().await?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
    }

    Ok(())
}

/// Assembles the durable/live components a `TaskController` binds
/// together: cache backend, elevation sampler, bus, and snapshot
/// renderer. Real elevation data comes from local SRTM/HGT tiles by
/// default, or from the Google Maps Elevation API when
/// `GOOGLE_MAPS_API_KEY` is set, mirroring the corpus's geocoding
/// fallback selection.
async fn build_controller(config: Config) -> Result<TaskController> {
    let cache = build_cache_backend(&config).await?;
    let bus = Arc::new(Bus::new(config.bus_capacity));
    let renderer: Arc<dyn SnapshotRenderer> = Arc::new(ImageSnapshotRenderer::default());
    let sampler = Arc::new(ElevationSampler::new(build_elevation_provider(&config).await?));

    Ok(TaskController::new(cache, bus, sampler, renderer, config))
}

/// Selects the durable `CacheBackend`: a local directory tree by default,
/// or S3-compatible object storage when `cache_backend = "s3"`.
async fn build_cache_backend(config: &Config) -> Result<Arc<dyn CacheBackend>> {
    match config.cache_backend.as_str() {
        "s3" => {
            let bucket = config
                .s3_bucket
                .clone()
                .context("cache_backend = \"s3\" requires s3_bucket (or SCANREL_S3_BUCKET)")?;
            let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let client = aws_sdk_s3::Client::new(&sdk_config);
            tracing::info!(bucket, prefix = %config.s3_prefix, "using S3 object storage as the cache backend");
            Ok(Arc::new(S3CacheBackend::new(client, bucket, config.s3_prefix.clone())))
        }
        other => {
            if other != "fs" {
                tracing::warn!(cache_backend = other, "unknown cache_backend, defaulting to fs");
            }
            Ok(Arc::new(FsCacheBackend::new(config.cache_root.clone())))
        }
    }
}

async fn build_elevation_provider(config: &Config) -> Result<Arc<dyn ElevationProvider>> {
    if let Ok(api_key) = std::env::var("GOOGLE_MAPS_API_KEY") {
        if !api_key.trim().is_empty() {
            let client = GoogleMapsClient::try_new(&api_key)
                .map_err(|e| anyhow::anyhow!("failed to create Google Maps client: {e}"))?;
            tracing::info!("using Google Maps Elevation API as the real elevation provider");
            return Ok(Arc::new(GoogleElevationProvider::new(client)));
        }
    }

    tracing::info!(path = %config.cache_root.display(), "using local SRTM/HGT tiles as the real elevation provider");
    Ok(Arc::new(HgtElevationProvider::new(config.cache_root.join("hgt"))))
}
