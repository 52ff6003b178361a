//! SQLite storage layer: the durable fleet state store.
//!
//! Everything the pipeline knows lives in seven tables:
//!
//! - `stations`: dock station identity, coordinates, live occupancy counts
//! - `bikes`: per-bike live tracking state and cumulative statistics
//! - `bike_observations`: short-lived docked-bike history for recovery
//! - `station_states`: per-station bike-presence sets, the state-diff input
//! - `movements`: the append-only departed/arrived event log
//! - `trips`: the reconstructed trip ledger
//! - `malfunctions`: flagged bike health problems
//!
//! Two uniqueness constraints back the check-then-create paths at the store
//! level: a trip is unique per (bike, start_time, start_station, end_station),
//! and at most one *active* malfunction exists per (bike, kind). Duplicate
//! inserts surface as constraint violations and are absorbed as no-ops.
//!
//! Timestamps are stored as unix seconds and converted to `DateTime<Utc>` at
//! this boundary.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::error::TrackerError;
use crate::model::{
    Bike, BikeObservation, BikeStatus, MalfunctionKind, MalfunctionRecord, MovementEvent,
    MovementKind, Station, StationRecord, Trip,
};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

fn to_dt(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

fn opt_dt(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(to_dt)
}

fn station_from_row(row: &SqliteRow) -> Station {
    Station {
        id: row.get("id"),
        code: row.get("code"),
        name: row.get("name"),
        latitude: row.get("latitude"),
        longitude: row.get("longitude"),
        nb_bike: row.get("nb_bike"),
        nb_ebike: row.get("nb_ebike"),
        nb_free_dock: row.get("nb_free_dock"),
        total_capacity: row.get("total_capacity"),
        updated_at: to_dt(row.get("updated_at")),
    }
}

fn bike_from_row(row: &SqliteRow) -> Bike {
    Bike {
        id: row.get("id"),
        name: row.get("name"),
        electric: row.get::<i64, _>("electric") != 0,
        current_station_id: row.get("current_station_id"),
        current_status: BikeStatus::parse(row.get("current_status")),
        last_seen_at: to_dt(row.get("last_seen_at")),
        arrived_at_station: opt_dt(row.get("arrived_at_station")),
        left_station_at: opt_dt(row.get("left_station_at")),
        previous_station_id: row.get("previous_station_id"),
        total_trips: row.get("total_trips"),
        total_distance: row.get("total_distance"),
        total_duration: row.get("total_duration"),
        boomerang_count: row.get("boomerang_count"),
        potential_malfunction: row.get::<i64, _>("potential_malfunction") != 0,
        malfunction_score: row.get("malfunction_score"),
        created_at: to_dt(row.get("created_at")),
    }
}

fn movement_from_row(row: &SqliteRow) -> MovementEvent {
    MovementEvent {
        id: row.get("id"),
        bike_id: row.get("bike_id"),
        kind: MovementKind::parse(row.get("kind")).unwrap_or(MovementKind::Arrived),
        station_id: row.get("station_id"),
        timestamp: to_dt(row.get("ts")),
        dock_position: row.get("dock_position"),
        bike_status: row
            .get::<Option<String>, _>("bike_status")
            .map(|s| BikeStatus::parse(&s)),
    }
}

fn trip_from_row(row: &SqliteRow) -> Trip {
    let start = to_dt(row.get("start_time"));
    Trip {
        id: row.get("id"),
        bike_id: row.get("bike_id"),
        start_station_id: row.get("start_station_id"),
        end_station_id: row.get("end_station_id"),
        start_time: start,
        end_time: opt_dt(row.get("end_time")).unwrap_or(start),
        duration: row.get::<Option<i64>, _>("duration").unwrap_or(0),
        distance: row.get::<Option<f64>, _>("distance").unwrap_or(0.0),
        avg_speed: row.get::<Option<f64>, _>("avg_speed").unwrap_or(0.0),
        is_boomerang: row.get::<i64, _>("is_boomerang") != 0,
        is_short_trip: row.get::<i64, _>("is_short_trip") != 0,
        created_at: to_dt(row.get("created_at")),
    }
}

fn malfunction_from_row(row: &SqliteRow) -> MalfunctionRecord {
    MalfunctionRecord {
        id: row.get("id"),
        bike_id: row.get("bike_id"),
        kind: MalfunctionKind::parse(row.get("kind")).unwrap_or(MalfunctionKind::Stuck),
        severity: row.get("severity"),
        description: row.get("description"),
        detected_at: to_dt(row.get("detected_at")),
        resolved_at: opt_dt(row.get("resolved_at")),
        is_active: row.get::<i64, _>("is_active") != 0,
        related_trip_id: row.get("related_trip_id"),
        station_id: row.get("station_id"),
    }
}

fn observation_from_row(row: &SqliteRow) -> BikeObservation {
    BikeObservation {
        id: row.get("id"),
        bike_id: row.get("bike_id"),
        station_id: row.get("station_id"),
        timestamp: to_dt(row.get("ts")),
        status: BikeStatus::parse(row.get("status")),
        dock_position: row.get("dock_position"),
    }
}

/// Filters for the bike listing projection.
#[derive(Debug, Default, Clone)]
pub struct BikeFilter {
    pub status: Option<BikeStatus>,
    pub electric: Option<bool>,
    pub malfunctioning: Option<bool>,
    pub station_id: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

/// Filters for the trip listing projection.
#[derive(Debug, Default, Clone)]
pub struct TripFilter {
    pub bike_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_duration: Option<i64>,
    pub max_duration: Option<i64>,
    pub boomerang_only: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:velotrace.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS stations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                nb_bike INTEGER NOT NULL DEFAULT 0,
                nb_ebike INTEGER NOT NULL DEFAULT 0,
                nb_free_dock INTEGER NOT NULL DEFAULT 0,
                total_capacity INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS bikes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                electric INTEGER NOT NULL DEFAULT 0,
                current_station_id INTEGER,
                current_status TEXT NOT NULL DEFAULT 'unknown',
                last_seen_at INTEGER NOT NULL,
                arrived_at_station INTEGER,
                left_station_at INTEGER,
                previous_station_id INTEGER,
                total_trips INTEGER NOT NULL DEFAULT 0,
                total_distance REAL NOT NULL DEFAULT 0,
                total_duration INTEGER NOT NULL DEFAULT 0,
                boomerang_count INTEGER NOT NULL DEFAULT 0,
                potential_malfunction INTEGER NOT NULL DEFAULT 0,
                malfunction_score REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS bike_observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bike_id INTEGER NOT NULL,
                station_id INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'unknown',
                dock_position TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS station_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                station_id INTEGER NOT NULL,
                bike_names TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS movements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bike_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                station_id INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                dock_position TEXT,
                bike_status TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trips (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bike_id INTEGER NOT NULL,
                start_station_id INTEGER NOT NULL,
                end_station_id INTEGER NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                duration INTEGER,
                distance REAL,
                avg_speed REAL,
                is_boomerang INTEGER NOT NULL DEFAULT 0,
                is_short_trip INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS malfunctions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bike_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                severity INTEGER NOT NULL DEFAULT 1,
                description TEXT NOT NULL DEFAULT '',
                detected_at INTEGER NOT NULL,
                resolved_at INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                related_trip_id INTEGER,
                station_id INTEGER
            )
            "#,
            // Trip identity: re-reconstruction of the same window must not duplicate.
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_trip_identity
            ON trips(bike_id, start_time, start_station_id, end_station_id)
            "#,
            // At most one active malfunction per (bike, kind).
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_malfunction_active
            ON malfunctions(bike_id, kind) WHERE is_active = 1
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_movements_bike_ts ON movements(bike_id, ts)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_movements_kind_ts ON movements(kind, ts)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_station_states_ts ON station_states(processed, ts)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_observations_bike_ts ON bike_observations(bike_id, ts)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_trips_bike_start ON trips(bike_id, start_time)
            "#,
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ========================================================================
    // Stations
    // ========================================================================

    /// Insert or refresh a station from a snapshot record, returning its id.
    pub async fn upsert_station(
        &self,
        rec: &StationRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let ts = now.timestamp();

        sqlx::query(
            r#"
            INSERT INTO stations
                (code, name, latitude, longitude, nb_bike, nb_ebike, nb_free_dock,
                 total_capacity, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(code) DO UPDATE SET
                name = excluded.name,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                nb_bike = excluded.nb_bike,
                nb_ebike = excluded.nb_ebike,
                nb_free_dock = excluded.nb_free_dock,
                total_capacity = excluded.total_capacity,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rec.code)
        .bind(&rec.name)
        .bind(rec.latitude)
        .bind(rec.longitude)
        .bind(rec.nb_bike)
        .bind(rec.nb_ebike)
        .bind(rec.nb_free_dock)
        .bind(rec.total_capacity)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT id FROM stations WHERE code = ?")
            .bind(&rec.code)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    pub async fn get_station(&self, id: i64) -> anyhow::Result<Option<Station>> {
        let row = sqlx::query("SELECT * FROM stations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(station_from_row))
    }

    pub async fn get_station_by_code(&self, code: &str) -> anyhow::Result<Option<Station>> {
        let row = sqlx::query("SELECT * FROM stations WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(station_from_row))
    }

    pub async fn list_stations(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<Station>> {
        let rows = sqlx::query("SELECT * FROM stations ORDER BY code LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(station_from_row).collect())
    }

    pub async fn count_stations(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM stations")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // ========================================================================
    // Bikes
    // ========================================================================

    /// Fetch a bike by provider name, creating it in `unknown` status on
    /// first sight.
    pub async fn get_or_create_bike(
        &self,
        name: &str,
        electric: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Bike> {
        if let Some(bike) = self.get_bike_by_name(name).await? {
            return Ok(bike);
        }

        sqlx::query(
            r#"
            INSERT INTO bikes (name, electric, current_status, last_seen_at, created_at)
            VALUES (?, ?, 'unknown', ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(electric as i64)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        self.get_bike_by_name(name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("bike '{name}' vanished right after insert"))
    }

    pub async fn get_bike(&self, id: i64) -> anyhow::Result<Option<Bike>> {
        let row = sqlx::query("SELECT * FROM bikes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(bike_from_row))
    }

    pub async fn get_bike_by_name(&self, name: &str) -> anyhow::Result<Option<Bike>> {
        let row = sqlx::query("SELECT * FROM bikes WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(bike_from_row))
    }

    /// Persist a bike's tracking fields (location, status, timestamps).
    /// Cumulative statistics are written only by the trip and recovery paths.
    pub async fn save_bike_tracking(&self, bike: &Bike) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE bikes SET
                current_station_id = ?,
                current_status = ?,
                last_seen_at = ?,
                arrived_at_station = ?,
                left_station_at = ?,
                previous_station_id = ?
            WHERE id = ?
            "#,
        )
        .bind(bike.current_station_id)
        .bind(bike.current_status.as_str())
        .bind(bike.last_seen_at.timestamp())
        .bind(bike.arrived_at_station.map(|t| t.timestamp()))
        .bind(bike.left_station_at.map(|t| t.timestamp()))
        .bind(bike.previous_station_id)
        .bind(bike.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_bike_status(
        &self,
        bike_id: i64,
        status: BikeStatus,
        station_id: Option<i64>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE bikes SET current_status = ?, current_station_id = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(station_id)
            .bind(bike_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_bike_health(
        &self,
        bike_id: i64,
        score: f64,
        flagged: bool,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE bikes SET malfunction_score = ?, potential_malfunction = ? WHERE id = ?")
            .bind(score)
            .bind(flagged as i64)
            .bind(bike_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Overwrite a bike's cumulative statistics (authoritative recompute).
    pub async fn set_bike_stats(
        &self,
        bike_id: i64,
        trips: i64,
        distance: f64,
        duration: i64,
        boomerangs: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE bikes SET total_trips = ?, total_distance = ?,
                             total_duration = ?, boomerang_count = ?
            WHERE id = ?
            "#,
        )
        .bind(trips)
        .bind(distance)
        .bind(duration)
        .bind(boomerangs)
        .bind(bike_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_bikes(&self, filter: &BikeFilter) -> anyhow::Result<Vec<Bike>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM bikes WHERE 1=1");
        if let Some(status) = filter.status {
            qb.push(" AND current_status = ").push_bind(status.as_str());
        }
        if let Some(electric) = filter.electric {
            qb.push(" AND electric = ").push_bind(electric as i64);
        }
        if let Some(flagged) = filter.malfunctioning {
            qb.push(" AND potential_malfunction = ").push_bind(flagged as i64);
        }
        if let Some(station_id) = filter.station_id {
            qb.push(" AND current_station_id = ").push_bind(station_id);
        }
        qb.push(" ORDER BY malfunction_score DESC, last_seen_at DESC");
        qb.push(" LIMIT ").push_bind(filter.limit.max(1));
        qb.push(" OFFSET ").push_bind(filter.offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(bike_from_row).collect())
    }

    pub async fn list_all_bikes(&self) -> anyhow::Result<Vec<Bike>> {
        let rows = sqlx::query("SELECT * FROM bikes")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(bike_from_row).collect())
    }

    /// Bikes currently recorded as docked somewhere.
    pub async fn list_docked_bikes(&self) -> anyhow::Result<Vec<Bike>> {
        let rows = sqlx::query(
            "SELECT * FROM bikes WHERE current_status IN ('available', 'unavailable')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(bike_from_row).collect())
    }

    /// Bikes not seen since `cutoff` and not already marked missing.
    pub async fn list_bikes_unseen_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Bike>> {
        let rows = sqlx::query(
            "SELECT * FROM bikes WHERE last_seen_at < ? AND current_status != 'missing'",
        )
        .bind(cutoff.timestamp())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(bike_from_row).collect())
    }

    /// Bikes stuck in `in_transit` with no observation since `cutoff`.
    pub async fn list_stale_in_transit_bikes(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Bike>> {
        let rows = sqlx::query(
            "SELECT * FROM bikes WHERE current_status = 'in_transit' AND last_seen_at < ?",
        )
        .bind(cutoff.timestamp())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(bike_from_row).collect())
    }

    pub async fn count_bikes(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM bikes")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn count_bikes_with_status(&self, status: BikeStatus) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM bikes WHERE current_status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn count_bikes_unseen_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM bikes WHERE last_seen_at < ?")
            .bind(cutoff.timestamp())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn count_flagged_bikes(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM bikes WHERE potential_malfunction = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// (status, count) pairs over all bikes.
    pub async fn bike_status_breakdown(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT current_status AS status, COUNT(*) AS n FROM bikes GROUP BY current_status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("status"), r.get("n")))
            .collect())
    }

    // ========================================================================
    // Bike observations
    // ========================================================================

    pub async fn insert_observation(
        &self,
        bike_id: i64,
        station_id: i64,
        ts: DateTime<Utc>,
        status: BikeStatus,
        dock_position: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bike_observations (bike_id, station_id, ts, status, dock_position)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(bike_id)
        .bind(station_id)
        .bind(ts.timestamp())
        .bind(status.as_str())
        .bind(dock_position)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_observation_for_bike(
        &self,
        bike_id: i64,
    ) -> anyhow::Result<Option<BikeObservation>> {
        let row = sqlx::query(
            "SELECT * FROM bike_observations WHERE bike_id = ? ORDER BY ts DESC LIMIT 1",
        )
        .bind(bike_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(observation_from_row))
    }

    /// The single most recent observation of every bike that has one.
    pub async fn latest_observation_per_bike(&self) -> anyhow::Result<Vec<BikeObservation>> {
        let rows = sqlx::query(
            r#"
            SELECT o.* FROM bike_observations o
            JOIN (
                SELECT bike_id, MAX(ts) AS max_ts
                FROM bike_observations GROUP BY bike_id
            ) latest ON o.bike_id = latest.bike_id AND o.ts = latest.max_ts
            GROUP BY o.bike_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(observation_from_row).collect())
    }

    pub async fn delete_observations_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM bike_observations WHERE ts < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn count_observations_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM bike_observations WHERE ts < ?")
            .bind(cutoff.timestamp())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // ========================================================================
    // Station states (state-diff history)
    // ========================================================================

    pub async fn insert_station_state(
        &self,
        ts: DateTime<Utc>,
        station_id: i64,
        bike_names: &[String],
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO station_states (ts, station_id, bike_names) VALUES (?, ?, ?)")
            .bind(ts.timestamp())
            .bind(station_id)
            .bind(serde_json::to_string(bike_names)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether any state rows already exist for this capture timestamp.
    /// Guards re-ingestion of an identical snapshot.
    pub async fn has_station_state_at(&self, ts: DateTime<Utc>) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM station_states WHERE ts = ?")
            .bind(ts.timestamp())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    /// Distinct unprocessed capture timestamps since `cutoff`, ascending.
    pub async fn unprocessed_state_times(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DateTime<Utc>>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ts FROM station_states
            WHERE ts >= ? AND processed = 0
            ORDER BY ts
            "#,
        )
        .bind(cutoff.timestamp())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| to_dt(r.get("ts"))).collect())
    }

    /// The full (station_id, bike names) mapping captured at one timestamp.
    pub async fn station_state_at(
        &self,
        ts: DateTime<Utc>,
    ) -> anyhow::Result<Vec<(i64, Vec<String>)>> {
        let rows = sqlx::query("SELECT station_id, bike_names FROM station_states WHERE ts = ?")
            .bind(ts.timestamp())
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let names: Vec<String> = serde_json::from_str(row.get("bike_names"))?;
            out.push((row.get("station_id"), names));
        }
        Ok(out)
    }

    pub async fn mark_states_processed(&self, ts: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE station_states SET processed = 1 WHERE ts = ?")
            .bind(ts.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_station_states_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM station_states WHERE ts < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn count_station_states_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM station_states WHERE ts < ?")
            .bind(cutoff.timestamp())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // ========================================================================
    // Movement events
    // ========================================================================

    pub async fn insert_movement(
        &self,
        bike_id: i64,
        kind: MovementKind,
        station_id: i64,
        ts: DateTime<Utc>,
        dock_position: Option<&str>,
        bike_status: Option<BikeStatus>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO movements (bike_id, kind, station_id, ts, dock_position, bike_status)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(bike_id)
        .bind(kind.as_str())
        .bind(station_id)
        .bind(ts.timestamp())
        .bind(dock_position)
        .bind(bike_status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All departure events since `cutoff`, oldest first.
    pub async fn departures_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<MovementEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM movements WHERE kind = 'departed' AND ts >= ? ORDER BY ts",
        )
        .bind(cutoff.timestamp())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(movement_from_row).collect())
    }

    /// The earliest arrival for a bike strictly after `after`, at or before `until`.
    pub async fn first_arrival_between(
        &self,
        bike_id: i64,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Option<MovementEvent>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM movements
            WHERE bike_id = ? AND kind = 'arrived' AND ts > ? AND ts <= ?
            ORDER BY ts LIMIT 1
            "#,
        )
        .bind(bike_id)
        .bind(after.timestamp())
        .bind(until.timestamp())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(movement_from_row))
    }

    pub async fn has_arrival_after(
        &self,
        bike_id: i64,
        after: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM movements WHERE bike_id = ? AND kind = 'arrived' AND ts > ?",
        )
        .bind(bike_id)
        .bind(after.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    pub async fn delete_movements_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM movements WHERE ts < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // ========================================================================
    // Trips
    // ========================================================================

    /// Insert a trip and bump the bike's cumulative statistics in one
    /// transaction. Returns `None` if the trip identity already exists
    /// (duplicate insert absorbed, statistics untouched).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_trip_with_stats(
        &self,
        bike_id: i64,
        start_station_id: i64,
        end_station_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        duration: i64,
        distance: f64,
        avg_speed: f64,
        is_boomerang: bool,
        is_short_trip: bool,
    ) -> anyhow::Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO trips
                (bike_id, start_station_id, end_station_id, start_time, end_time,
                 duration, distance, avg_speed, is_boomerang, is_short_trip, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(bike_id)
        .bind(start_station_id)
        .bind(end_station_id)
        .bind(start_time.timestamp())
        .bind(end_time.timestamp())
        .bind(duration)
        .bind(distance)
        .bind(avg_speed)
        .bind(is_boomerang as i64)
        .bind(is_short_trip as i64)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await;

        let trip_id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(e) if TrackerError::is_unique_violation(&e) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        sqlx::query(
            r#"
            UPDATE bikes SET
                total_trips = total_trips + 1,
                total_distance = total_distance + ?,
                total_duration = total_duration + ?,
                boomerang_count = boomerang_count + ?
            WHERE id = ?
            "#,
        )
        .bind(distance)
        .bind(duration)
        .bind(is_boomerang as i64)
        .bind(bike_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(trip_id))
    }

    pub async fn get_trip(&self, id: i64) -> anyhow::Result<Option<Trip>> {
        let row = sqlx::query("SELECT * FROM trips WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(trip_from_row))
    }

    pub async fn list_trips(&self, filter: &TripFilter) -> anyhow::Result<Vec<Trip>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM trips WHERE end_time IS NOT NULL");
        if let Some(bike_id) = filter.bike_id {
            qb.push(" AND bike_id = ").push_bind(bike_id);
        }
        if let Some(since) = filter.since {
            qb.push(" AND start_time >= ").push_bind(since.timestamp());
        }
        if let Some(until) = filter.until {
            qb.push(" AND end_time <= ").push_bind(until.timestamp());
        }
        if let Some(min) = filter.min_duration {
            qb.push(" AND duration >= ").push_bind(min);
        }
        if let Some(max) = filter.max_duration {
            qb.push(" AND duration <= ").push_bind(max);
        }
        if filter.boomerang_only {
            qb.push(" AND is_boomerang = 1");
        }
        qb.push(" ORDER BY start_time DESC");
        qb.push(" LIMIT ").push_bind(filter.limit.max(1));
        qb.push(" OFFSET ").push_bind(filter.offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(trip_from_row).collect())
    }

    pub async fn count_trips(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM trips")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn count_trips_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM trips WHERE start_time >= ?")
            .bind(cutoff.timestamp())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Per-bike boomerang counts since `cutoff`, for bikes at or above
    /// `min_count`.
    pub async fn boomerang_counts_since(
        &self,
        cutoff: DateTime<Utc>,
        min_count: i64,
    ) -> anyhow::Result<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT bike_id, COUNT(*) AS n FROM trips
            WHERE is_boomerang = 1 AND start_time >= ?
            GROUP BY bike_id HAVING COUNT(*) >= ?
            "#,
        )
        .bind(cutoff.timestamp())
        .bind(min_count)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| (r.get("bike_id"), r.get("n"))).collect())
    }

    /// (bike_id, avg speed, trip count) for electric bikes with at least
    /// `min_trips` trips longer than `min_duration` since `cutoff`.
    pub async fn electric_speed_stats_since(
        &self,
        cutoff: DateTime<Utc>,
        min_trips: i64,
        min_duration: i64,
    ) -> anyhow::Result<Vec<(i64, f64, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT t.bike_id, AVG(t.avg_speed) AS speed, COUNT(*) AS n
            FROM trips t JOIN bikes b ON b.id = t.bike_id
            WHERE b.electric = 1 AND t.start_time >= ?
              AND t.avg_speed IS NOT NULL AND t.duration > ?
            GROUP BY t.bike_id HAVING COUNT(*) >= ?
            "#,
        )
        .bind(cutoff.timestamp())
        .bind(min_duration)
        .bind(min_trips)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("bike_id"), r.get("speed"), r.get("n")))
            .collect())
    }

    /// Distinct bike ids with at least one trip since `cutoff`.
    pub async fn bike_ids_with_trips_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<i64>> {
        let rows = sqlx::query("SELECT DISTINCT bike_id FROM trips WHERE start_time >= ?")
            .bind(cutoff.timestamp())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("bike_id")).collect())
    }

    /// Recent suspicious trips by electric bikes: boomerang, very short, or
    /// very slow. Battery-issue candidates.
    pub async fn suspicious_electric_trips_since(
        &self,
        cutoff: DateTime<Utc>,
        short_secs: i64,
        slow_kmh: f64,
    ) -> anyhow::Result<Vec<Trip>> {
        let rows = sqlx::query(
            r#"
            SELECT t.* FROM trips t JOIN bikes b ON b.id = t.bike_id
            WHERE b.electric = 1 AND t.start_time >= ?
              AND (t.is_boomerang = 1 OR t.duration < ? OR t.avg_speed < ?)
            ORDER BY t.start_time
            "#,
        )
        .bind(cutoff.timestamp())
        .bind(short_secs)
        .bind(slow_kmh)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(trip_from_row).collect())
    }

    /// The trip a bike finished most recently before `before`.
    pub async fn previous_trip_ending_before(
        &self,
        bike_id: i64,
        before: DateTime<Utc>,
    ) -> anyhow::Result<Option<Trip>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM trips
            WHERE bike_id = ? AND end_time IS NOT NULL AND end_time < ?
            ORDER BY end_time DESC LIMIT 1
            "#,
        )
        .bind(bike_id)
        .bind(before.timestamp())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(trip_from_row))
    }

    /// Distinct bikes with a recent "healthy" trip: long enough, fast
    /// enough, and not a boomerang.
    pub async fn bikes_with_healthy_trip_since(
        &self,
        cutoff: DateTime<Utc>,
        min_duration: i64,
        min_speed: f64,
    ) -> anyhow::Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT bike_id FROM trips
            WHERE start_time >= ? AND duration > ? AND avg_speed > ? AND is_boomerang = 0
            "#,
        )
        .bind(cutoff.timestamp())
        .bind(min_duration)
        .bind(min_speed)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("bike_id")).collect())
    }

    /// Authoritative per-bike totals summed from the trip ledger.
    pub async fn bike_trip_totals(
        &self,
        bike_id: i64,
    ) -> anyhow::Result<(i64, f64, i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n,
                   COALESCE(SUM(distance), 0.0) AS dist,
                   COALESCE(SUM(duration), 0) AS dur,
                   COALESCE(SUM(is_boomerang), 0) AS boom
            FROM trips WHERE bike_id = ?
            "#,
        )
        .bind(bike_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.get("n"),
            row.get("dist"),
            row.get("dur"),
            row.get("boom"),
        ))
    }

    /// Delete trips still open past `cutoff`. The matcher never creates
    /// open trips; this sweeps rows left behind by partial failures.
    pub async fn delete_stale_open_trips(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM trips WHERE end_time IS NULL AND start_time < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Delete trips whose metrics are physically impossible.
    pub async fn delete_impossible_trips(
        &self,
        max_duration: i64,
        max_distance_km: f64,
    ) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM trips
            WHERE duration <= 0 OR duration > ?
               OR distance < 0 OR distance > ?
            "#,
        )
        .bind(max_duration)
        .bind(max_distance_km)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Remove duplicate trips sharing the identity tuple, keeping the
    /// lowest id. A safety net for rows created before the unique index.
    pub async fn delete_duplicate_trips(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM trips WHERE id NOT IN (
                SELECT MIN(id) FROM trips
                GROUP BY bike_id, start_time, start_station_id, end_station_id
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn count_station_departures_since(
        &self,
        station_id: i64,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM trips WHERE start_station_id = ? AND start_time >= ?",
        )
        .bind(station_id)
        .bind(cutoff.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    pub async fn count_station_arrivals_since(
        &self,
        station_id: i64,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM trips WHERE end_station_id = ? AND end_time >= ?",
        )
        .bind(station_id)
        .bind(cutoff.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    /// (start station, end station, trips, avg duration, avg distance) for
    /// the busiest station pairs since `cutoff`.
    pub async fn popular_routes_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<(i64, i64, i64, f64, f64)>> {
        let rows = sqlx::query(
            r#"
            SELECT start_station_id, end_station_id, COUNT(*) AS n,
                   AVG(duration) AS avg_duration, AVG(distance) AS avg_distance
            FROM trips
            WHERE start_time >= ? AND start_station_id != end_station_id
            GROUP BY start_station_id, end_station_id
            ORDER BY n DESC LIMIT ?
            "#,
        )
        .bind(cutoff.timestamp())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get("start_station_id"),
                    r.get("end_station_id"),
                    r.get("n"),
                    r.get::<Option<f64>, _>("avg_duration").unwrap_or(0.0),
                    r.get::<Option<f64>, _>("avg_distance").unwrap_or(0.0),
                )
            })
            .collect())
    }

    // ========================================================================
    // Malfunctions
    // ========================================================================

    pub async fn find_active_malfunction(
        &self,
        bike_id: i64,
        kind: MalfunctionKind,
    ) -> anyhow::Result<Option<MalfunctionRecord>> {
        let row = sqlx::query(
            "SELECT * FROM malfunctions WHERE bike_id = ? AND kind = ? AND is_active = 1",
        )
        .bind(bike_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(malfunction_from_row))
    }

    /// Insert a new active malfunction. Returns `None` when an active record
    /// of this kind already exists for the bike (partial unique index hit).
    pub async fn insert_malfunction(
        &self,
        bike_id: i64,
        kind: MalfunctionKind,
        severity: i64,
        description: &str,
        related_trip_id: Option<i64>,
        station_id: Option<i64>,
    ) -> anyhow::Result<Option<i64>> {
        let res = sqlx::query(
            r#"
            INSERT INTO malfunctions
                (bike_id, kind, severity, description, detected_at, is_active,
                 related_trip_id, station_id)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(bike_id)
        .bind(kind.as_str())
        .bind(severity)
        .bind(description)
        .bind(Utc::now().timestamp())
        .bind(related_trip_id)
        .bind(station_id)
        .execute(&self.pool)
        .await;

        match res {
            Ok(done) => Ok(Some(done.last_insert_rowid())),
            Err(e) if TrackerError::is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn active_malfunctions_for_bike(
        &self,
        bike_id: i64,
    ) -> anyhow::Result<Vec<MalfunctionRecord>> {
        let rows = sqlx::query("SELECT * FROM malfunctions WHERE bike_id = ? AND is_active = 1")
            .bind(bike_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(malfunction_from_row).collect())
    }

    pub async fn list_malfunctions(
        &self,
        active_only: bool,
        kind: Option<MalfunctionKind>,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<MalfunctionRecord>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM malfunctions WHERE 1=1");
        if active_only {
            qb.push(" AND is_active = 1");
        }
        if let Some(kind) = kind {
            qb.push(" AND kind = ").push_bind(kind.as_str());
        }
        qb.push(" ORDER BY detected_at DESC");
        qb.push(" LIMIT ").push_bind(limit.max(1));
        qb.push(" OFFSET ").push_bind(offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(malfunction_from_row).collect())
    }

    /// Bikes whose composite score may be out of date: anything with an
    /// active record, plus anything still carrying a nonzero cached score
    /// after its records were resolved out of band.
    pub async fn bike_ids_needing_rescore(&self) -> anyhow::Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT id AS bike_id FROM bikes WHERE malfunction_score > 0
            UNION
            SELECT bike_id FROM malfunctions WHERE is_active = 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("bike_id")).collect())
    }

    pub async fn count_active_malfunctions(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM malfunctions WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Deactivate specific kinds of active malfunctions for one bike.
    pub async fn resolve_malfunctions_for_bike(
        &self,
        bike_id: i64,
        kinds: &[MalfunctionKind],
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut resolved = 0;
        for kind in kinds {
            let res = sqlx::query(
                r#"
                UPDATE malfunctions SET is_active = 0, resolved_at = ?
                WHERE bike_id = ? AND kind = ? AND is_active = 1
                "#,
            )
            .bind(now.timestamp())
            .bind(bike_id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
            resolved += res.rows_affected();
        }
        Ok(resolved)
    }

    /// Drop malfunction records whose bike no longer exists.
    pub async fn delete_orphaned_malfunctions(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            "DELETE FROM malfunctions WHERE bike_id NOT IN (SELECT id FROM bikes)",
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Auto-resolve active malfunctions detected before `cutoff`.
    pub async fn resolve_stale_malfunctions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE malfunctions SET is_active = 0, resolved_at = ?
            WHERE is_active = 1 AND detected_at < ?
            "#,
        )
        .bind(now.timestamp())
        .bind(cutoff.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}
