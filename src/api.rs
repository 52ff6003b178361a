//! HTTP read API and the recovery trigger endpoints.
//!
//! Handlers never write to the store directly. The read endpoints serve
//! projections straight from SQLite; the three POST endpoints under
//! `/recovery` only enqueue jobs on the writer queue and return before the
//! work runs. `GET /queue/status` is the probe that tells an operator
//! whether that queue is alive and how far behind it is.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::config::TrackerConfig;
use crate::model::{BikeStatus, MalfunctionKind};
use crate::recovery::{DataHealthReport, RecoveryEngine};
use crate::stats::StatsService;
use crate::storage::{BikeFilter, Storage, TripFilter};
use crate::worker::{Job, QueueWorker, RecoveryOutcome};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub worker: QueueWorker,
    pub config: TrackerConfig,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/bikes", get(list_bikes))
        .route("/bikes/:id", get(get_bike))
        .route("/stations", get(list_stations))
        .route("/stations/:id/activity", get(get_station_activity))
        .route("/trips", get(list_trips))
        .route("/malfunctions", get(list_malfunctions))
        .route("/stats/overview", get(get_overview))
        .route("/stats/routes", get(get_popular_routes))
        .route("/queue/status", get(get_queue_status))
        .route("/recovery/status", get(get_recovery_status))
        .route("/recovery/run", post(trigger_recovery))
        .route("/recovery/reset", post(trigger_reset))
        .route("/recovery/dedupe", post(trigger_dedupe))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn default_limit() -> i64 {
    50
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Bikes
// ============================================================================

/// Query parameters for the bike listing.
#[derive(Debug, Deserialize)]
pub struct BikesQuery {
    /// Filter by status (available, unavailable, in_transit, missing, unknown).
    pub status: Option<String>,
    /// Filter by drivetrain.
    pub electric: Option<bool>,
    /// Only bikes with (or without) an active malfunction flag.
    pub malfunctioning: Option<bool>,
    /// Only bikes currently docked at this station code.
    pub station_code: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

/// GET /bikes - List bikes, worst health first.
#[instrument(skip(state))]
pub async fn list_bikes(
    State(state): State<AppState>,
    Query(query): Query<BikesQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let station_id = match &query.station_code {
        Some(code) => match state.storage.get_station_by_code(code).await {
            Ok(Some(station)) => Some(station.id),
            Ok(None) => return Err(StatusCode::NOT_FOUND),
            Err(e) => {
                warn!(error = %e, "failed to resolve station code");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
        None => None,
    };

    let filter = BikeFilter {
        status: query.status.as_deref().map(BikeStatus::parse),
        electric: query.electric,
        malfunctioning: query.malfunctioning,
        station_id,
        limit: query.limit.clamp(1, 1000),
        offset: query.offset.max(0),
    };

    match state.storage.list_bikes(&filter).await {
        Ok(bikes) => {
            info!(count = bikes.len(), "bikes listed");
            Ok(Json(bikes))
        }
        Err(e) => {
            warn!(error = %e, "failed to list bikes");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /bikes/:id - One bike with derived statistics and active flags.
#[instrument(skip(state))]
pub async fn get_bike(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let stats = StatsService::new(state.storage.clone());
    match stats.bike_statistics(id).await {
        Ok(Some(detail)) => Ok(Json(detail)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(bike_id = id, error = %e, "failed to load bike");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ============================================================================
// Stations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

/// GET /stations - List stations with live occupancy counts.
#[instrument(skip(state))]
pub async fn list_stations(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    match state
        .storage
        .list_stations(query.limit.clamp(1, 1000), query.offset.max(0))
        .await
    {
        Ok(stations) => Ok(Json(stations)),
        Err(e) => {
            warn!(error = %e, "failed to list stations");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /stations/:id/activity - Last-24h traffic through one station.
#[instrument(skip(state))]
pub async fn get_station_activity(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let stats = StatsService::new(state.storage.clone());
    match stats.station_activity(id, Utc::now()).await {
        Ok(Some(activity)) => Ok(Json(activity)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(station_id = id, error = %e, "failed to load station activity");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ============================================================================
// Trips
// ============================================================================

/// Query parameters for the trip listing.
#[derive(Debug, Deserialize)]
pub struct TripsQuery {
    pub bike_id: Option<i64>,
    /// Only trips started within the last N hours.
    pub hours: Option<i64>,
    pub min_duration: Option<i64>,
    pub max_duration: Option<i64>,
    #[serde(default)]
    pub boomerang_only: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

/// GET /trips - List reconstructed trips, newest first.
#[instrument(skip(state))]
pub async fn list_trips(
    State(state): State<AppState>,
    Query(query): Query<TripsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let filter = TripFilter {
        bike_id: query.bike_id,
        since: query.hours.map(|h| Utc::now() - chrono::Duration::hours(h.max(0))),
        until: None,
        min_duration: query.min_duration,
        max_duration: query.max_duration,
        boomerang_only: query.boomerang_only,
        limit: query.limit.clamp(1, 1000),
        offset: query.offset.max(0),
    };

    match state.storage.list_trips(&filter).await {
        Ok(trips) => {
            info!(count = trips.len(), "trips listed");
            Ok(Json(trips))
        }
        Err(e) => {
            warn!(error = %e, "failed to list trips");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ============================================================================
// Malfunctions
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MalfunctionsQuery {
    /// Only active records (default true).
    pub active: Option<bool>,
    /// Filter by kind (boomerang, low_speed, missing, stuck, battery_issue).
    pub kind: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

/// GET /malfunctions - List flagged problems, newest first.
#[instrument(skip(state))]
pub async fn list_malfunctions(
    State(state): State<AppState>,
    Query(query): Query<MalfunctionsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let kind = match query.kind.as_deref() {
        Some(s) => match MalfunctionKind::parse(s) {
            Some(kind) => Some(kind),
            None => return Err(StatusCode::BAD_REQUEST),
        },
        None => None,
    };

    match state
        .storage
        .list_malfunctions(
            query.active.unwrap_or(true),
            kind,
            query.limit.clamp(1, 1000),
            query.offset.max(0),
        )
        .await
    {
        Ok(records) => Ok(Json(records)),
        Err(e) => {
            warn!(error = %e, "failed to list malfunctions");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ============================================================================
// Stats
// ============================================================================

/// GET /stats/overview - Fleet-wide summary.
#[instrument(skip(state))]
pub async fn get_overview(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    let stats = StatsService::new(state.storage.clone());
    match stats.system_overview(Utc::now()).await {
        Ok(overview) => Ok(Json(overview)),
        Err(e) => {
            warn!(error = %e, "failed to compute overview");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RoutesQuery {
    /// Lookback window in days (default 7).
    pub days: Option<i64>,
    #[serde(default = "default_routes_limit")]
    pub limit: i64,
}

fn default_routes_limit() -> i64 {
    10
}

/// GET /stats/routes - Busiest station pairs.
#[instrument(skip(state))]
pub async fn get_popular_routes(
    State(state): State<AppState>,
    Query(query): Query<RoutesQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let stats = StatsService::new(state.storage.clone());
    match stats
        .popular_routes(Utc::now(), query.days.unwrap_or(7), query.limit.clamp(1, 100))
        .await
    {
        Ok(routes) => Ok(Json(routes)),
        Err(e) => {
            warn!(error = %e, "failed to compute popular routes");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ============================================================================
// Queue and recovery
// ============================================================================

/// GET /queue/status - Writer queue probe.
pub async fn get_queue_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.worker.status())
}

/// Body of the recovery status endpoint.
#[derive(Debug, Serialize)]
pub struct RecoveryStatus {
    /// Most recent completed run, or null if none since startup.
    pub last_run: Option<RecoveryOutcome>,
    /// Live backlog counts the next run will inspect.
    pub data_health: DataHealthReport,
}

/// GET /recovery/status - Last completed run plus the current data-health
/// backlog.
#[instrument(skip(state))]
pub async fn get_recovery_status(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    let engine = RecoveryEngine::new(state.storage.clone(), state.config.clone());
    match engine.data_health(Utc::now()).await {
        Ok(data_health) => Ok(Json(RecoveryStatus {
            last_run: state.worker.last_recovery(),
            data_health,
        })),
        Err(e) => {
            warn!(error = %e, "failed to compute data health");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /recovery/run - Enqueue a full recovery run.
#[instrument(skip(state))]
pub async fn trigger_recovery(State(state): State<AppState>) -> impl IntoResponse {
    enqueue_or_busy(&state, Job::RunRecovery)
}

/// POST /recovery/reset - Enqueue a rebuild of live bike state from the
/// observation history.
#[instrument(skip(state))]
pub async fn trigger_reset(State(state): State<AppState>) -> impl IntoResponse {
    enqueue_or_busy(&state, Job::ResetBikeState)
}

/// POST /recovery/dedupe - Enqueue trip deduplication.
#[instrument(skip(state))]
pub async fn trigger_dedupe(State(state): State<AppState>) -> impl IntoResponse {
    enqueue_or_busy(&state, Job::DedupeTrips)
}

fn enqueue_or_busy(state: &AppState, job: Job) -> StatusCode {
    if state.worker.enqueue(job) {
        info!("recovery job accepted");
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
