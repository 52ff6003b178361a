//! Aggregate read models over the fleet state.
//!
//! Everything here is a pure projection: computed on demand from the store,
//! never cached, never written back.

use chrono::{DateTime, Duration, Utc};

use crate::model::{Bike, BikeStatus, Station};
use crate::storage::Storage;

/// One line of the fleet-wide status breakdown.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

/// The dashboard summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemOverview {
    pub total_bikes: i64,
    pub total_stations: i64,
    pub total_trips: i64,
    pub trips_last_24h: i64,
    pub bikes_by_status: Vec<StatusCount>,
    pub active_malfunctions: i64,
    pub flagged_bikes: i64,
    /// Share of the fleet that is neither flagged nor missing, 0-100.
    pub fleet_health: f64,
}

/// Per-bike derived statistics alongside the raw record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BikeStatistics {
    pub bike: Bike,
    pub avg_trip_duration_secs: f64,
    pub avg_trip_distance_km: f64,
    pub active_malfunctions: i64,
}

/// Traffic through one station over the last day.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StationActivity {
    pub station: Station,
    pub departures_24h: i64,
    pub arrivals_24h: i64,
}

/// One frequently-ridden station pair.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PopularRoute {
    pub start_station_id: i64,
    pub start_station_name: String,
    pub end_station_id: i64,
    pub end_station_name: String,
    pub trips: i64,
    pub avg_duration_secs: f64,
    pub avg_distance_km: f64,
}

pub struct StatsService {
    storage: Storage,
}

impl StatsService {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn system_overview(&self, now: DateTime<Utc>) -> anyhow::Result<SystemOverview> {
        let total_bikes = self.storage.count_bikes().await?;
        let flagged_bikes = self.storage.count_flagged_bikes().await?;
        let missing = self
            .storage
            .count_bikes_with_status(BikeStatus::Missing)
            .await?;

        let fleet_health = if total_bikes > 0 {
            let unhealthy = (flagged_bikes + missing).min(total_bikes);
            100.0 * (total_bikes - unhealthy) as f64 / total_bikes as f64
        } else {
            100.0
        };

        Ok(SystemOverview {
            total_bikes,
            total_stations: self.storage.count_stations().await?,
            total_trips: self.storage.count_trips().await?,
            trips_last_24h: self
                .storage
                .count_trips_since(now - Duration::hours(24))
                .await?,
            bikes_by_status: self
                .storage
                .bike_status_breakdown()
                .await?
                .into_iter()
                .map(|(status, count)| StatusCount { status, count })
                .collect(),
            active_malfunctions: self.storage.count_active_malfunctions().await?,
            flagged_bikes,
            fleet_health,
        })
    }

    pub async fn bike_statistics(&self, bike_id: i64) -> anyhow::Result<Option<BikeStatistics>> {
        let Some(bike) = self.storage.get_bike(bike_id).await? else {
            return Ok(None);
        };

        let (avg_duration, avg_distance) = if bike.total_trips > 0 {
            (
                bike.total_duration as f64 / bike.total_trips as f64,
                bike.total_distance / bike.total_trips as f64,
            )
        } else {
            (0.0, 0.0)
        };

        let active = self.storage.active_malfunctions_for_bike(bike.id).await?;

        Ok(Some(BikeStatistics {
            bike,
            avg_trip_duration_secs: avg_duration,
            avg_trip_distance_km: avg_distance,
            active_malfunctions: active.len() as i64,
        }))
    }

    pub async fn station_activity(
        &self,
        station_id: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<StationActivity>> {
        let Some(station) = self.storage.get_station(station_id).await? else {
            return Ok(None);
        };
        let cutoff = now - Duration::hours(24);

        Ok(Some(StationActivity {
            departures_24h: self
                .storage
                .count_station_departures_since(station.id, cutoff)
                .await?,
            arrivals_24h: self
                .storage
                .count_station_arrivals_since(station.id, cutoff)
                .await?,
            station,
        }))
    }

    pub async fn popular_routes(
        &self,
        now: DateTime<Utc>,
        days: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<PopularRoute>> {
        let cutoff = now - Duration::days(days.max(1));
        let rows = self.storage.popular_routes_since(cutoff, limit).await?;

        let mut routes = Vec::with_capacity(rows.len());
        for (start_id, end_id, trips, avg_duration, avg_distance) in rows {
            let start_name = self
                .storage
                .get_station(start_id)
                .await?
                .map(|s| s.name)
                .unwrap_or_default();
            let end_name = self
                .storage
                .get_station(end_id)
                .await?
                .map(|s| s.name)
                .unwrap_or_default();
            routes.push(PopularRoute {
                start_station_id: start_id,
                start_station_name: start_name,
                end_station_id: end_id,
                end_station_name: end_name,
                trips,
                avg_duration_secs: avg_duration,
                avg_distance_km: avg_distance,
            });
        }
        Ok(routes)
    }
}
