//! Video generation worker binary.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use futures_util::{FutureExt, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vgen_models::{GenerationConfig, JobId, ProgressEvent};
use vgen_providers::{CommandRenderer, GatewayClient};
use vgen_queue::{ProgressSubscription, QueueConfig};
use vgen_storage::{MemoryObjectStorage, ObjectStorage, R2Client};
use vgen_store::{MemoryStore, RedisStore, StatusStore};
use vgen_worker::metrics::init_metrics;
use vgen_worker::{GenerationService, Providers, WorkerConfig};

#[derive(Parser)]
#[command(name = "vgen-worker")]
#[command(about = "Generate, render and serve short videos", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate all assets for a video, printing progress as JSON lines
    Generate {
        /// Subject of the video
        #[arg(long)]
        topic: String,

        /// Target duration in milliseconds
        #[arg(long, default_value = "30000")]
        duration_ms: u64,

        /// Visual style (e.g. anime)
        #[arg(long)]
        style: String,

        /// Owner of the job
        #[arg(long, default_value = "cli")]
        owner: String,

        /// Render the video once generation completes
        #[arg(long)]
        render: bool,
    },

    /// Render the video of a completed job
    Render {
        #[arg(long)]
        job_id: String,
    },

    /// Evict rendered videos not accessed recently
    Cleanup {
        /// Retention window (defaults to RENDER_RETENTION_SECS)
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Run the periodic cleanup loop until interrupted
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr.parse().context("invalid METRICS_ADDR")?;
        init_metrics(addr)?;
        info!("Metrics exporter listening on {}", addr);
    }

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);
    let service = build_service(config)?;

    match cli.command {
        Command::Generate {
            topic,
            duration_ms,
            style,
            owner,
            render,
        } => {
            let request = GenerationConfig::new(topic, duration_ms, style);
            let job_id = JobId::for_request(&request, &owner);
            info!(job_id = %job_id, "Starting generation");

            let mut events = service.subscribe_progress(&job_id).await;
            let Some(handle) = service.start_generation(job_id.clone(), request, owner).await? else {
                bail!("generation for job {} is already running", job_id);
            };
            let record = follow(&mut events, handle).await??;
            info!(job_id = %job_id, status = %record.status, images = record.images.len(), "Generation finished");

            if render {
                let path = follow(&mut events, service.render_video(&job_id)).await?;
                println!("{}", path.display());
            }
        }
        Command::Render { job_id } => {
            let job_id = JobId::from_string(job_id);
            let mut events = service.subscribe_progress(&job_id).await;
            let path = follow(&mut events, service.render_video(&job_id)).await?;
            println!("{}", path.display());
        }
        Command::Cleanup { max_age_secs } => {
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or(service.config().render_retention);
            let evicted = service.cleanup_old_renders(max_age).await?;
            info!(evicted, "Cleanup finished");
        }
        Command::Run => {
            let cleanup = service.spawn_cleanup_loop();
            info!("Cleanup loop running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            cleanup.abort();
            service.shutdown();
        }
    }

    Ok(())
}

/// Colored output for dev, JSON for production. Logs go to stderr so
/// stdout carries only progress events and results.
fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("vgen=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

fn build_service(config: WorkerConfig) -> anyhow::Result<GenerationService> {
    let store: Arc<dyn StatusStore> = if std::env::var("REDIS_URL").is_ok() {
        Arc::new(RedisStore::from_env()?)
    } else {
        warn!("REDIS_URL not set, job state is kept in memory");
        Arc::new(MemoryStore::new())
    };

    let storage: Arc<dyn ObjectStorage> = match R2Client::from_env() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!("Object storage not configured ({}), assets are kept in memory", e);
            Arc::new(MemoryObjectStorage::new())
        }
    };

    let gateway = Arc::new(GatewayClient::from_env()?);
    let renderer = CommandRenderer::from_env();
    if let Err(e) = renderer.check() {
        warn!("{}; rendering will fail", e);
    }

    Ok(GenerationService::new(
        config,
        store,
        storage,
        Providers::from_client(gateway),
        Arc::new(renderer),
        QueueConfig::from_env(),
    ))
}

/// Print progress events while `work` runs, then any still buffered.
async fn follow<T>(events: &mut ProgressSubscription, work: impl Future<Output = T>) -> T {
    tokio::pin!(work);

    let output = loop {
        tokio::select! {
            biased;
            Some(event) = events.next() => print_event(&event),
            output = &mut work => break output,
        }
    };

    while let Some(Some(event)) = events.next().now_or_never() {
        print_event(&event);
    }
    output
}

fn print_event(event: &ProgressEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to serialize progress event: {}", e),
    }
}
