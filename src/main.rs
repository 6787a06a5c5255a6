//! Service entry point: wires the engine together and serves the API.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use soulspot_core::api::{self, AppState};
use soulspot_core::library::LogOnlyImporter;
use soulspot_core::workers::WorkerHeartbeats;
use soulspot_core::{
    Blocklist, CircuitBreaker, Database, DispatcherWorker, DownloadStore, EngineConfig,
    EngineContext, EnqueueWorker, EventBus, GuardedDownloader, Orchestrator, RetryScheduler,
    SettingsReader, SettingsStore, Shutdown, SlskdClient, SqliteTrackReader, StatusSyncWorker,
};
use tracing::{info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("SoulSpot starting");

    let db = Database::new(&args.database)
        .await
        .context("failed to open database")?;

    let settings = SettingsStore::new(db.clone());
    if let Some(url) = &args.slskd_url {
        settings.set("slskd.base_url", url).await?;
    }
    if let Some(key) = &args.slskd_api_key {
        settings.set("slskd.api_key", key).await?;
    }

    let slskd_url = settings
        .get("slskd.base_url")
        .await?
        .unwrap_or_else(|| "http://localhost:5030".to_string());
    let slskd_api_key = settings.get("slskd.api_key").await?.unwrap_or_default();
    if slskd_api_key.is_empty() {
        warn!("no slskd API key configured; downloader calls will be rejected");
    }

    let config = EngineConfig::load(&settings).await;
    let breaker = Arc::new(CircuitBreaker::new(config.breaker));
    let client = SlskdClient::new(&slskd_url, &slskd_api_key)
        .map_err(|err| anyhow::anyhow!("slskd client setup failed: {err}"))?;
    let downloader = Arc::new(GuardedDownloader::new(
        Arc::new(client),
        Arc::clone(&breaker),
    ));

    let ctx = EngineContext {
        store: DownloadStore::new(db.clone()),
        blocklist: Blocklist::new(db.clone()),
        settings: Arc::new(settings),
        tracks: Arc::new(SqliteTrackReader::new(db.clone())),
        downloader,
        importer: Arc::new(LogOnlyImporter),
        breaker,
        events: EventBus::default(),
        heartbeats: Arc::new(WorkerHeartbeats::new()),
    };

    let shutdown = Arc::new(Shutdown::new());
    let mut workers = Vec::new();
    workers.push(tokio::spawn(
        DispatcherWorker::new(ctx.clone()).run(Arc::clone(&shutdown)),
    ));
    workers.push(tokio::spawn(
        EnqueueWorker::new(ctx.clone()).run(Arc::clone(&shutdown)),
    ));
    workers.push(tokio::spawn(
        StatusSyncWorker::new(ctx.clone()).run(Arc::clone(&shutdown)),
    ));
    workers.push(tokio::spawn(
        RetryScheduler::new(ctx.clone()).run(Arc::clone(&shutdown)),
    ));

    let state = AppState {
        orchestrator: Orchestrator::new(ctx),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, "HTTP API listening");

    let serve_shutdown = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            serve_shutdown.trigger();
        })
        .await
        .context("HTTP server failed")?;

    shutdown.trigger();
    for worker in workers {
        let _ = worker.await;
    }

    db.close().await;
    info!("SoulSpot stopped");
    Ok(())
}
