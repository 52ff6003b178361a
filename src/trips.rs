//! Trip reconstruction: joining movement into trips.
//!
//! Two independent strategies feed the same trip ledger:
//!
//! - **Event matching** pairs each departure in the movement log with the
//!   earliest following arrival of the same bike inside the plausible-trip
//!   window. This is the primary path and yields exact endpoints.
//! - **State diffing** walks the per-station presence history and catches
//!   trips whose movement events were lost (process restart between the
//!   departure poll and the arrival poll). A bike that vanishes from the
//!   presence sets and reappears later took a trip.
//!
//! Both funnel through one materialization path that computes metrics,
//! classifies, and inserts. The trip identity index makes re-running either
//! strategy over an already-covered window a no-op, so the two may overlap
//! freely.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::geo;
use crate::model::MovementEvent;
use crate::storage::Storage;

/// What one reconstruction cycle produced.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TripReport {
    pub from_movements: usize,
    pub from_state_diffs: usize,
    pub duplicates_absorbed: usize,
    pub implausible_skipped: usize,
}

/// Joins the movement log and presence history into the trip ledger.
pub struct TripDetector {
    storage: Storage,
    config: TrackerConfig,
}

impl TripDetector {
    pub fn new(storage: Storage, config: TrackerConfig) -> Self {
        Self { storage, config }
    }

    /// Run both strategies over recent history.
    #[instrument(skip(self))]
    pub async fn reconstruct(&self, now: DateTime<Utc>) -> anyhow::Result<TripReport> {
        let mut report = TripReport::default();
        self.detect_from_movements(now, &mut report).await?;
        self.detect_from_state_diffs(now, &mut report).await?;

        if report.from_movements + report.from_state_diffs > 0 {
            info!(
                from_movements = report.from_movements,
                from_state_diffs = report.from_state_diffs,
                implausible = report.implausible_skipped,
                "reconstructed trips"
            );
        }
        Ok(report)
    }

    /// Pair departures with the earliest following arrival of the same bike.
    async fn detect_from_movements(
        &self,
        now: DateTime<Utc>,
        report: &mut TripReport,
    ) -> anyhow::Result<()> {
        // Scan back far enough that a departure whose arrival only just
        // landed is still in view.
        let lookback = now - Duration::seconds(2 * self.config.max_trip_secs);

        for departure in self.storage.departures_since(lookback).await? {
            let window_end =
                departure.timestamp + Duration::seconds(self.config.max_trip_secs);
            let Some(arrival) = self
                .storage
                .first_arrival_between(departure.bike_id, departure.timestamp, window_end)
                .await?
            else {
                continue;
            };

            self.materialize(
                departure.bike_id,
                departure.station_id,
                arrival.station_id,
                departure.timestamp,
                arrival.timestamp,
                report,
                Outcome::Movement,
            )
            .await?;
        }
        Ok(())
    }

    /// Walk consecutive presence snapshots and catch absences the movement
    /// log missed.
    async fn detect_from_state_diffs(
        &self,
        now: DateTime<Utc>,
        report: &mut TripReport,
    ) -> anyhow::Result<()> {
        let horizon = now - Duration::hours(self.config.state_retention_hours);
        let times = self.storage.unprocessed_state_times(horizon).await?;
        if times.len() < 2 {
            return Ok(());
        }

        // bike name -> station the bike was last seen at, per snapshot time
        let mut prev_locations: Option<HashMap<String, i64>> = None;
        // bikes currently absent: name -> (origin station, first-absent time)
        let mut open_absences: HashMap<String, (i64, DateTime<Utc>)> = HashMap::new();

        for ts in &times {
            let state = self.storage.station_state_at(*ts).await?;
            let mut locations: HashMap<String, i64> = HashMap::new();
            for (station_id, names) in &state {
                for name in names {
                    locations.insert(name.clone(), *station_id);
                }
            }

            if let Some(prev) = &prev_locations {
                for (name, origin) in prev {
                    if !locations.contains_key(name) {
                        open_absences.entry(name.clone()).or_insert((*origin, *ts));
                    }
                }
                for (name, station_id) in &locations {
                    let Some((origin, absent_since)) = open_absences.remove(name) else {
                        continue;
                    };
                    let Some(bike) = self.storage.get_bike_by_name(name).await? else {
                        continue;
                    };
                    self.materialize(
                        bike.id,
                        origin,
                        *station_id,
                        absent_since,
                        *ts,
                        report,
                        Outcome::StateDiff,
                    )
                    .await?;
                }
            }

            prev_locations = Some(locations);
        }

        // The newest snapshot stays unprocessed as the baseline for the
        // next cycle.
        for ts in &times[..times.len() - 1] {
            self.storage.mark_states_processed(*ts).await?;
        }
        Ok(())
    }

    /// Compute metrics, classify, and insert one candidate trip.
    #[allow(clippy::too_many_arguments)]
    async fn materialize(
        &self,
        bike_id: i64,
        start_station_id: i64,
        end_station_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        report: &mut TripReport,
        outcome: Outcome,
    ) -> anyhow::Result<()> {
        let duration = (end_time - start_time).num_seconds();
        if duration < self.config.min_trip_secs || duration > self.config.max_trip_secs {
            return Ok(());
        }

        let (Some(start), Some(end)) = (
            self.storage.get_station(start_station_id).await?,
            self.storage.get_station(end_station_id).await?,
        ) else {
            let err = TrackerError::InconsistentState {
                bike: bike_id.to_string(),
                detail: "trip endpoints reference unknown stations".to_string(),
            };
            debug!(error = %err, "skipping candidate trip");
            return Ok(());
        };

        let distance = geo::haversine_km(
            start.latitude,
            start.longitude,
            end.latitude,
            end.longitude,
        );
        if distance > self.config.max_distance_km {
            let err = TrackerError::ImpossibleTrip {
                bike: bike_id.to_string(),
                duration_secs: duration,
                distance_km: distance,
            };
            warn!(error = %err, "discarding candidate trip");
            report.implausible_skipped += 1;
            return Ok(());
        }

        let avg_speed = if duration > 0 {
            distance / (duration as f64 / 3600.0)
        } else {
            0.0
        };
        let is_boomerang =
            start_station_id == end_station_id && duration <= self.config.boomerang_secs;
        let is_short_trip = duration < self.config.short_trip_secs;

        let created = self
            .storage
            .create_trip_with_stats(
                bike_id,
                start_station_id,
                end_station_id,
                start_time,
                end_time,
                duration,
                distance,
                avg_speed,
                is_boomerang,
                is_short_trip,
            )
            .await?;

        match created {
            Some(trip_id) => {
                debug!(bike_id, trip_id, duration, "trip created");
                match outcome {
                    Outcome::Movement => report.from_movements += 1,
                    Outcome::StateDiff => report.from_state_diffs += 1,
                }
            }
            None => report.duplicates_absorbed += 1,
        }
        Ok(())
    }

    /// Departures inside the matching window with no arrival yet: trips
    /// still underway (or about to become lost bikes).
    pub async fn open_departures(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<MovementEvent>> {
        let lookback = now - Duration::seconds(self.config.max_trip_secs);
        let mut open = Vec::new();
        for departure in self.storage.departures_since(lookback).await? {
            if !self
                .storage
                .has_arrival_after(departure.bike_id, departure.timestamp)
                .await?
            {
                open.push(departure);
            }
        }
        Ok(open)
    }
}

enum Outcome {
    Movement,
    StateDiff,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BikeStatus, MovementKind, StationRecord};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn setup() -> (Storage, TripDetector) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let detector = TripDetector::new(storage.clone(), TrackerConfig::default());
        (storage, detector)
    }

    async fn seed_station(storage: &Storage, code: &str, lat: f64, lon: f64) -> i64 {
        storage
            .upsert_station(
                &StationRecord {
                    code: code.to_string(),
                    name: format!("Station {code}"),
                    latitude: lat,
                    longitude: lon,
                    nb_bike: 0,
                    nb_ebike: 0,
                    nb_free_dock: 10,
                    total_capacity: 10,
                    bikes: vec![],
                },
                t(0),
            )
            .await
            .unwrap()
    }

    async fn seed_bike(storage: &Storage, name: &str) -> i64 {
        storage
            .get_or_create_bike(name, false, t(0))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_departure_arrival_pair_yields_exact_trip() {
        let (storage, detector) = setup().await;
        let a = seed_station(&storage, "A", 48.8532, 2.3692).await;
        let b = seed_station(&storage, "B", 48.8656, 2.3212).await;
        let bike = seed_bike(&storage, "b1").await;

        storage
            .insert_movement(bike, MovementKind::Departed, a, t(0), None, None)
            .await
            .unwrap();
        storage
            .insert_movement(bike, MovementKind::Arrived, b, t(300), None, Some(BikeStatus::Available))
            .await
            .unwrap();

        let report = detector.reconstruct(t(600)).await.unwrap();
        assert_eq!(report.from_movements, 1);

        let trips = storage
            .list_trips(&crate::storage::TripFilter {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(trips.len(), 1);
        let trip = &trips[0];
        assert_eq!(trip.start_station_id, a);
        assert_eq!(trip.end_station_id, b);
        assert_eq!(trip.start_time, t(0));
        assert_eq!(trip.end_time, t(300));
        assert_eq!(trip.duration, 300);
        // Bastille to Concorde is a few kilometers, not zero and not absurd.
        assert!(trip.distance > 1.0 && trip.distance < 10.0);
        assert!(trip.avg_speed > 0.0);
        assert!(!trip.is_boomerang);
    }

    #[tokio::test]
    async fn test_too_short_absence_is_not_a_trip() {
        let (storage, detector) = setup().await;
        let a = seed_station(&storage, "A", 48.85, 2.35).await;
        let bike = seed_bike(&storage, "b1").await;

        storage
            .insert_movement(bike, MovementKind::Departed, a, t(0), None, None)
            .await
            .unwrap();
        storage
            .insert_movement(bike, MovementKind::Arrived, a, t(59), None, None)
            .await
            .unwrap();

        let report = detector.reconstruct(t(600)).await.unwrap();
        assert_eq!(report.from_movements, 0);
        assert_eq!(storage.count_trips().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_boomerang_boundary() {
        let (storage, detector) = setup().await;
        let a = seed_station(&storage, "A", 48.85, 2.35).await;
        let bike1 = seed_bike(&storage, "b1").await;
        let bike2 = seed_bike(&storage, "b2").await;

        // Exactly at the threshold: boomerang.
        storage
            .insert_movement(bike1, MovementKind::Departed, a, t(0), None, None)
            .await
            .unwrap();
        storage
            .insert_movement(bike1, MovementKind::Arrived, a, t(300), None, None)
            .await
            .unwrap();
        // One second past: an ordinary round trip.
        storage
            .insert_movement(bike2, MovementKind::Departed, a, t(0), None, None)
            .await
            .unwrap();
        storage
            .insert_movement(bike2, MovementKind::Arrived, a, t(301), None, None)
            .await
            .unwrap();

        detector.reconstruct(t(600)).await.unwrap();

        let trips = storage
            .list_trips(&crate::storage::TripFilter {
                bike_id: Some(bike1),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(trips[0].is_boomerang);

        let trips = storage
            .list_trips(&crate::storage::TripFilter {
                bike_id: Some(bike2),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!trips[0].is_boomerang);
    }

    #[tokio::test]
    async fn test_implausible_distance_is_discarded() {
        let (storage, detector) = setup().await;
        let a = seed_station(&storage, "A", 48.85, 2.35).await;
        // No bike crosses the planet in ten minutes.
        let b = seed_station(&storage, "B", -33.86, 151.20).await;
        let bike = seed_bike(&storage, "b1").await;

        storage
            .insert_movement(bike, MovementKind::Departed, a, t(0), None, None)
            .await
            .unwrap();
        storage
            .insert_movement(bike, MovementKind::Arrived, b, t(600), None, None)
            .await
            .unwrap();

        let report = detector.reconstruct(t(700)).await.unwrap();
        assert_eq!(report.implausible_skipped, 1);
        assert_eq!(storage.count_trips().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rerun_does_not_duplicate() {
        let (storage, detector) = setup().await;
        let a = seed_station(&storage, "A", 48.85, 2.35).await;
        let b = seed_station(&storage, "B", 48.86, 2.36).await;
        let bike = seed_bike(&storage, "b1").await;

        storage
            .insert_movement(bike, MovementKind::Departed, a, t(0), None, None)
            .await
            .unwrap();
        storage
            .insert_movement(bike, MovementKind::Arrived, b, t(400), None, None)
            .await
            .unwrap();

        detector.reconstruct(t(600)).await.unwrap();
        let report = detector.reconstruct(t(700)).await.unwrap();

        assert_eq!(report.from_movements, 0);
        assert_eq!(report.duplicates_absorbed, 1);
        assert_eq!(storage.count_trips().await.unwrap(), 1);

        // Bike statistics were bumped exactly once.
        let bike = storage.get_bike(bike).await.unwrap().unwrap();
        assert_eq!(bike.total_trips, 1);
    }

    #[tokio::test]
    async fn test_state_diff_recovers_lost_trip() {
        let (storage, detector) = setup().await;
        let a = seed_station(&storage, "A", 48.8532, 2.3692).await;
        let b = seed_station(&storage, "B", 48.8656, 2.3212).await;
        seed_bike(&storage, "b1").await;

        // Present at A, absent, absent, present at B. No movement events.
        storage
            .insert_station_state(t(0), a, &["b1".to_string()])
            .await
            .unwrap();
        storage.insert_station_state(t(0), b, &[]).await.unwrap();
        storage.insert_station_state(t(120), a, &[]).await.unwrap();
        storage.insert_station_state(t(120), b, &[]).await.unwrap();
        storage.insert_station_state(t(240), a, &[]).await.unwrap();
        storage.insert_station_state(t(240), b, &[]).await.unwrap();
        storage.insert_station_state(t(480), a, &[]).await.unwrap();
        storage
            .insert_station_state(t(480), b, &["b1".to_string()])
            .await
            .unwrap();

        let report = detector.reconstruct(t(600)).await.unwrap();
        assert_eq!(report.from_state_diffs, 1);

        let trips = storage
            .list_trips(&crate::storage::TripFilter {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0].start_station_id, a);
        assert_eq!(trips[0].end_station_id, b);
        // Absence window: first-absent snapshot to reappearance snapshot.
        assert_eq!(trips[0].duration, 360);
    }

    #[tokio::test]
    async fn test_open_departure_is_listed_until_matched() {
        let (storage, detector) = setup().await;
        let a = seed_station(&storage, "A", 48.85, 2.35).await;
        let bike = seed_bike(&storage, "b1").await;

        storage
            .insert_movement(bike, MovementKind::Departed, a, t(0), None, None)
            .await
            .unwrap();

        let open = detector.open_departures(t(600)).await.unwrap();
        assert_eq!(open.len(), 1);

        storage
            .insert_movement(bike, MovementKind::Arrived, a, t(700), None, None)
            .await
            .unwrap();
        let open = detector.open_departures(t(800)).await.unwrap();
        assert!(open.is_empty());
    }
}
