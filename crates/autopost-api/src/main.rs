//! Autopost server: REST API plus pipeline workers.

use anyhow::Context;
use autopost_api::{AppState, routes};
use autopost_config::{AppConfig, load_config};
use autopost_connectors::{HttpGenerator, HttpPublisher};
use autopost_core::{Clock, Generator, Publisher, SystemClock};
use autopost_db::{JobStore, MemoryJobStore, PgJobStore, create_pool, run_migrations};
use autopost_scheduler::{ClaimManager, Pipeline, Shutdown, Worker, WorkerSettings};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// PostgreSQL, shared by every server process
    Pg,
    /// In-process only; jobs are lost on exit
    Memory,
}

#[derive(Debug, Parser)]
#[command(name = "autopost-server")]
#[command(about = "Autopost content publishing pipeline", long_about = None)]
struct Args {
    /// Path to the KDL configuration file
    #[arg(long, env = "AUTOPOST_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection string, overrides the config file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Address to listen on, overrides the config file
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Worker id prefix used for job locks
    #[arg(long, env = "AUTOPOST_WORKER_ID")]
    worker_id: Option<String>,

    /// Number of workers in this process
    #[arg(long, default_value_t = 1)]
    workers: usize,

    #[arg(long, value_enum, default_value_t = StoreKind::Pg)]
    store: StoreKind,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AppConfig::default(),
    };

    let store = open_store(&args, &config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pipeline = Arc::new(
        Pipeline::new(store.clone(), clock.clone())
            .with_retry_policy(config.pipeline.retry_policy())
            .with_default_max_retries(config.pipeline.default_max_retries),
    );

    let (shutdown_tx, shutdown) = Shutdown::channel();
    let workers = spawn_workers(&args, &config, &pipeline, store, clock, shutdown)?;

    let app = routes::router(AppState::new(pipeline))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = args.bind.unwrap_or(config.server.bind);
    info!("Starting server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task failed");
        }
    }
    info!("Server stopped");

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_store(args: &Args, config: &AppConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match args.store {
        StoreKind::Pg => {
            let url = args
                .database_url
                .as_deref()
                .or(config.database.url.as_deref())
                .context("no database url: pass --database-url, set DATABASE_URL or configure `database url=...`")?;

            info!("Connecting to database...");
            let pool = create_pool(url, config.database.max_connections).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            Ok(Arc::new(PgJobStore::new(pool)))
        }
        StoreKind::Memory => {
            warn!("Using the in-memory job store; jobs will not survive a restart");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

fn spawn_workers(
    args: &Args,
    config: &AppConfig,
    pipeline: &Arc<Pipeline>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let (Some(generator_config), Some(publisher_config)) = (&config.generator, &config.publisher)
    else {
        warn!("Generator or publisher endpoint not configured; serving the API without workers");
        return Ok(Vec::new());
    };

    let generator: Arc<dyn Generator> = Arc::new(
        HttpGenerator::new(generator_config).context("failed to build generator client")?,
    );
    let publisher: Arc<dyn Publisher> = Arc::new(
        HttpPublisher::new(publisher_config).context("failed to build publisher client")?,
    );

    let settings = WorkerSettings {
        poll_interval: config.pipeline.poll_interval,
        error_backoff: config.pipeline.error_backoff,
        generate_timeout: config.pipeline.generate_timeout,
        publish_timeout: config.pipeline.publish_timeout,
    };
    let claims = ClaimManager::with_stale_lock(store, clock, config.pipeline.stale_lock);
    let prefix = args
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

    let handles = (0..args.workers)
        .map(|i| {
            let id = if args.workers == 1 {
                prefix.clone()
            } else {
                format!("{}-{}", prefix, i)
            };
            let worker = Worker::new(
                id,
                claims.clone(),
                pipeline.clone(),
                generator.clone(),
                publisher.clone(),
            )
            .with_settings(settings)
            .with_shutdown(shutdown.clone());
            tokio::spawn(async move { worker.run().await })
        })
        .collect();

    Ok(handles)
}

/// Wait for Ctrl-C, then tell the workers to stop.
async fn shutdown_signal(trigger: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, finishing in-flight work");
    // No receivers just means no workers are running.
    let _ = trigger.send(true);
}
