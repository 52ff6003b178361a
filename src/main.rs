//! Velotrace - movement inference for a dock-based bike-share fleet.
//!
//! # Overview
//!
//! The shared-mobility feed only publishes which bikes are docked where,
//! right now. Velotrace polls that feed, infers departures and arrivals by
//! differencing consecutive snapshots, reconstructs trips from the inferred
//! movement, flags bikes whose riding patterns look broken, and
//! periodically self-repairs the state the inference inevitably corrupts.
//!
//! # API Endpoints
//!
//! - `GET /bikes`, `GET /bikes/:id` - Fleet and per-bike state
//! - `GET /stations`, `GET /stations/:id/activity` - Dock network
//! - `GET /trips` - The reconstructed trip ledger
//! - `GET /malfunctions` - Flagged bike health problems
//! - `GET /stats/overview`, `GET /stats/routes` - Aggregates
//! - `GET /queue/status` - Writer queue probe
//! - `POST /recovery/run|reset|dedupe` - On-demand repairs
//! - `GET /health` - Health check

use std::env;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use velotrace::api::{self, AppState};
use velotrace::config::TrackerConfig;
use velotrace::feed::FeedClient;
use velotrace::scheduler::Scheduler;
use velotrace::storage::Storage;
use velotrace::worker::QueueWorker;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:velotrace.db?mode=rwc";

/// Writer queue depth. A minute of backlog at the default poll cadence is
/// already pathological; anything past this is dropped.
const QUEUE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("velotrace=info".parse()?))
        .init();

    let port: u16 = env::var("VELOTRACE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let db_url =
        env::var("VELOTRACE_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    let config = TrackerConfig::from_env();

    info!(port, db_url = %db_url, "Starting Velotrace");

    let storage = Storage::new(&db_url).await?;
    info!("Database initialized");

    let worker = QueueWorker::start(storage.clone(), config.clone(), QUEUE_CAPACITY);

    let feed = FeedClient::new(env::var("VELOTRACE_FEED_TOKEN").ok());
    let scheduler = Scheduler::new(feed, worker.clone(), config.clone());
    scheduler.spawn();

    let app = api::router(AppState {
        storage,
        worker,
        config,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Velotrace is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
