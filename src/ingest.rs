//! Snapshot differencer: turns feed polls into movement events.
//!
//! The feed only ever says "these bikes are docked here right now". Movement
//! is inferred by comparing each snapshot against the stored fleet state:
//!
//! - docked before, absent now: the bike departed its station
//! - absent before, docked now: the bike arrived
//! - docked at A before, docked at B now: departure from A and arrival at B
//!   in one poll interval
//!
//! Every inferred movement is appended to the immutable event log that trip
//! reconstruction joins over. The differencer also maintains the per-station
//! presence history used by the state-diff reconstruction strategy, and the
//! rolling observation history recovery re-derives live state from.
//!
//! Re-ingesting a snapshot with a `captured_at` already on file is a no-op:
//! the presence history is the dedup key, so a crashed-and-replayed poll
//! cannot double-emit events.

use std::collections::HashSet;

use chrono::Duration;
use tracing::{debug, info, instrument};

use crate::config::TrackerConfig;
use crate::model::{BikeStatus, MovementKind, Snapshot};
use crate::storage::Storage;

/// What one ingest cycle did.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IngestReport {
    pub stations: usize,
    pub bikes_seen: usize,
    pub departures: usize,
    pub arrivals: usize,
    pub marked_in_transit: usize,
    pub marked_missing: usize,
    /// True when the snapshot's capture time was already on file and the
    /// whole cycle was skipped.
    pub skipped_duplicate: bool,
}

/// Compares snapshots against stored fleet state and applies the difference.
pub struct Differencer {
    storage: Storage,
    config: TrackerConfig,
}

impl Differencer {
    pub fn new(storage: Storage, config: TrackerConfig) -> Self {
        Self { storage, config }
    }

    /// Apply one snapshot to the fleet state.
    #[instrument(skip(self, snapshot), fields(captured_at = %snapshot.captured_at))]
    pub async fn ingest(&self, snapshot: &Snapshot) -> anyhow::Result<IngestReport> {
        let now = snapshot.captured_at;
        let mut report = IngestReport::default();

        // Presence history doubles as the idempotence key.
        if self.storage.has_station_state_at(now).await? {
            debug!("snapshot already ingested, skipping");
            report.skipped_duplicate = true;
            return Ok(report);
        }

        let mut seen: HashSet<String> = HashSet::new();

        for rec in &snapshot.stations {
            let station_id = self.storage.upsert_station(rec, now).await?;
            report.stations += 1;

            let mut names_here = Vec::with_capacity(rec.bikes.len());

            for presence in &rec.bikes {
                names_here.push(presence.name.clone());
                seen.insert(presence.name.clone());

                let mut bike = self
                    .storage
                    .get_or_create_bike(&presence.name, presence.electric, now)
                    .await?;

                // A docked bike always carries a docked status, whatever the
                // feed said; the station/status invariant depends on it.
                let status = if presence.status.is_docked() {
                    presence.status
                } else {
                    BikeStatus::Unavailable
                };

                let was_at = bike.current_station_id;
                let station_changed = was_at != Some(station_id);
                let status_changed = bike.current_status != status;
                let stale = now - bike.last_seen_at
                    > Duration::seconds(self.config.refresh_backstop_secs);

                // Docked-to-docked relocation: both legs happened inside one
                // poll interval.
                if let Some(prev_station) = was_at {
                    if prev_station != station_id {
                        self.storage
                            .insert_movement(
                                bike.id,
                                MovementKind::Departed,
                                prev_station,
                                now,
                                None,
                                Some(bike.current_status),
                            )
                            .await?;
                        report.departures += 1;
                        bike.previous_station_id = Some(prev_station);
                        bike.left_station_at = Some(now);
                    }
                }

                // Arrival: previously absent (riding or lost), now docked.
                let arriving = match bike.current_status {
                    BikeStatus::InTransit | BikeStatus::Missing => true,
                    _ => was_at.is_some() && station_changed,
                };
                if arriving {
                    self.storage
                        .insert_movement(
                            bike.id,
                            MovementKind::Arrived,
                            station_id,
                            now,
                            presence.dock_position.as_deref(),
                            Some(status),
                        )
                        .await?;
                    report.arrivals += 1;
                    bike.arrived_at_station = Some(now);
                } else if station_changed {
                    // First sighting ever, or re-sync after unknown state.
                    // Dock silently, no movement inferred.
                    bike.arrived_at_station = Some(now);
                }

                if station_changed || status_changed || stale {
                    self.storage
                        .insert_observation(
                            bike.id,
                            station_id,
                            now,
                            status,
                            presence.dock_position.as_deref(),
                        )
                        .await?;
                }

                bike.current_station_id = Some(station_id);
                bike.current_status = status;
                bike.last_seen_at = now;
                self.storage.save_bike_tracking(&bike).await?;
                report.bikes_seen += 1;
            }

            self.storage
                .insert_station_state(now, station_id, &names_here)
                .await?;
        }

        // Departure scan: bikes we believed docked but did not see anywhere.
        for mut bike in self.storage.list_docked_bikes().await? {
            if seen.contains(&bike.name) {
                continue;
            }
            let Some(station_id) = bike.current_station_id else {
                continue;
            };

            self.storage
                .insert_movement(
                    bike.id,
                    MovementKind::Departed,
                    station_id,
                    now,
                    None,
                    Some(bike.current_status),
                )
                .await?;
            report.departures += 1;

            bike.previous_station_id = Some(station_id);
            bike.left_station_at = Some(now);
            bike.current_station_id = None;
            bike.current_status = BikeStatus::InTransit;
            self.storage.save_bike_tracking(&bike).await?;
            report.marked_in_transit += 1;
        }

        // Riding bikes unseen past the threshold are no longer riding.
        let missing_cutoff = now - Duration::hours(self.config.missing_hours);
        for bike in self.storage.list_stale_in_transit_bikes(missing_cutoff).await? {
            self.storage
                .set_bike_status(bike.id, BikeStatus::Missing, None)
                .await?;
            report.marked_missing += 1;
        }

        // Age out presence history beyond what reconstruction can use.
        let state_cutoff = now - Duration::hours(self.config.state_retention_hours);
        let pruned = self.storage.delete_station_states_before(state_cutoff).await?;

        info!(
            stations = report.stations,
            bikes = report.bikes_seen,
            departures = report.departures,
            arrivals = report.arrivals,
            missing = report.marked_missing,
            pruned_states = pruned,
            "ingested snapshot"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BikePresence, StationRecord};
    use chrono::{DateTime, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn presence(name: &str) -> BikePresence {
        BikePresence {
            name: name.to_string(),
            electric: false,
            status: BikeStatus::Available,
            dock_position: None,
        }
    }

    fn station(code: &str, lat: f64, lon: f64, bikes: Vec<BikePresence>) -> StationRecord {
        StationRecord {
            code: code.to_string(),
            name: format!("Station {code}"),
            latitude: lat,
            longitude: lon,
            nb_bike: bikes.len() as i64,
            nb_ebike: 0,
            nb_free_dock: 10,
            total_capacity: 10 + bikes.len() as i64,
            bikes,
        }
    }

    fn snapshot(at: DateTime<Utc>, stations: Vec<StationRecord>) -> Snapshot {
        Snapshot {
            captured_at: at,
            stations,
        }
    }

    async fn setup() -> (Storage, Differencer) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let diff = Differencer::new(storage.clone(), TrackerConfig::default());
        (storage, diff)
    }

    #[tokio::test]
    async fn test_first_sight_creates_bike_without_movement() {
        let (storage, diff) = setup().await;

        let report = diff
            .ingest(&snapshot(t(0), vec![station("A", 48.85, 2.35, vec![presence("b1")])]))
            .await
            .unwrap();

        assert_eq!(report.bikes_seen, 1);
        assert_eq!(report.departures, 0);
        assert_eq!(report.arrivals, 0);

        let bike = storage.get_bike_by_name("b1").await.unwrap().unwrap();
        assert_eq!(bike.current_status, BikeStatus::Available);
        assert!(bike.current_station_id.is_some());
        assert!(bike.location_invariant_holds());
    }

    #[tokio::test]
    async fn test_disappearance_emits_departure_and_in_transit() {
        let (storage, diff) = setup().await;

        diff.ingest(&snapshot(t(0), vec![station("A", 48.85, 2.35, vec![presence("b1")])]))
            .await
            .unwrap();
        let report = diff
            .ingest(&snapshot(t(60), vec![station("A", 48.85, 2.35, vec![])]))
            .await
            .unwrap();

        assert_eq!(report.departures, 1);
        assert_eq!(report.marked_in_transit, 1);

        let bike = storage.get_bike_by_name("b1").await.unwrap().unwrap();
        assert_eq!(bike.current_status, BikeStatus::InTransit);
        assert_eq!(bike.current_station_id, None);
        assert!(bike.previous_station_id.is_some());
        assert!(bike.location_invariant_holds());

        let deps = storage.departures_since(t(0)).await.unwrap();
        assert_eq!(deps.len(), 1);
    }

    #[tokio::test]
    async fn test_reappearance_emits_arrival() {
        let (storage, diff) = setup().await;

        diff.ingest(&snapshot(
            t(0),
            vec![
                station("A", 48.85, 2.35, vec![presence("b1")]),
                station("B", 48.86, 2.36, vec![]),
            ],
        ))
        .await
        .unwrap();
        diff.ingest(&snapshot(
            t(60),
            vec![
                station("A", 48.85, 2.35, vec![]),
                station("B", 48.86, 2.36, vec![]),
            ],
        ))
        .await
        .unwrap();
        let report = diff
            .ingest(&snapshot(
                t(600),
                vec![
                    station("A", 48.85, 2.35, vec![]),
                    station("B", 48.86, 2.36, vec![presence("b1")]),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(report.arrivals, 1);

        let bike = storage.get_bike_by_name("b1").await.unwrap().unwrap();
        assert_eq!(bike.current_status, BikeStatus::Available);
        let dest = storage.get_station_by_code("B").await.unwrap().unwrap();
        assert_eq!(bike.current_station_id, Some(dest.id));
        assert!(bike.location_invariant_holds());
    }

    #[tokio::test]
    async fn test_docked_to_docked_relocation_emits_both_legs() {
        let (storage, diff) = setup().await;

        diff.ingest(&snapshot(
            t(0),
            vec![
                station("A", 48.85, 2.35, vec![presence("b1")]),
                station("B", 48.86, 2.36, vec![]),
            ],
        ))
        .await
        .unwrap();
        let report = diff
            .ingest(&snapshot(
                t(60),
                vec![
                    station("A", 48.85, 2.35, vec![]),
                    station("B", 48.86, 2.36, vec![presence("b1")]),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(report.departures, 1);
        assert_eq!(report.arrivals, 1);

        let bike = storage.get_bike_by_name("b1").await.unwrap().unwrap();
        let dest = storage.get_station_by_code("B").await.unwrap().unwrap();
        assert_eq!(bike.current_station_id, Some(dest.id));
    }

    #[tokio::test]
    async fn test_reingesting_same_snapshot_is_noop() {
        let (storage, diff) = setup().await;
        let snap = snapshot(t(0), vec![station("A", 48.85, 2.35, vec![presence("b1")])]);

        diff.ingest(&snap).await.unwrap();

        // Make the bike disappear so a naive replay of the first snapshot
        // would re-dock it and invent movement.
        diff.ingest(&snapshot(t(60), vec![station("A", 48.85, 2.35, vec![])]))
            .await
            .unwrap();

        let report = diff.ingest(&snap).await.unwrap();
        assert!(report.skipped_duplicate);

        let bike = storage.get_bike_by_name("b1").await.unwrap().unwrap();
        assert_eq!(bike.current_status, BikeStatus::InTransit);

        let deps = storage.departures_since(t(0)).await.unwrap();
        assert_eq!(deps.len(), 1);
    }

    #[tokio::test]
    async fn test_undocked_feed_status_is_coerced() {
        let (storage, diff) = setup().await;

        let mut p = presence("b1");
        p.status = BikeStatus::Unknown;
        diff.ingest(&snapshot(t(0), vec![station("A", 48.85, 2.35, vec![p])]))
            .await
            .unwrap();

        let bike = storage.get_bike_by_name("b1").await.unwrap().unwrap();
        assert_eq!(bike.current_status, BikeStatus::Unavailable);
        assert!(bike.location_invariant_holds());
    }
}
