//! Data recovery: periodic self-repair of the fleet state.
//!
//! Inference over a lossy feed accumulates damage: trips that never closed,
//! bikes stuck riding forever because their arrival poll was missed,
//! statistics that drifted from the ledger they summarize. The recovery
//! engine runs a fixed sequence of repair passes, each idempotent, so that a
//! full run on an already-healthy store changes nothing.
//!
//! Two heavier repairs are not part of the periodic run and only execute on
//! demand: rebuilding live bike state from the observation history
//! ([`RecoveryEngine::reset_from_observations`]) and collapsing duplicate
//! trips that predate the identity index ([`RecoveryEngine::dedupe_trips`]).

use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

use crate::config::TrackerConfig;
use crate::malfunction::MalfunctionDetector;
use crate::model::BikeStatus;
use crate::storage::Storage;

/// Counts of what a recovery run changed. All zeros means the store was
/// already consistent.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RecoveryReport {
    pub open_trips_deleted: u64,
    pub impossible_trips_deleted: u64,
    pub bikes_unstuck: u64,
    pub bikes_marked_missing: u64,
    pub observations_pruned: u64,
    pub states_pruned: u64,
    pub movements_pruned: u64,
    pub orphaned_malfunctions_deleted: u64,
    pub stale_malfunctions_resolved: u64,
    pub bike_stats_corrected: u64,
}

impl RecoveryReport {
    pub fn total_changes(&self) -> u64 {
        self.open_trips_deleted
            + self.impossible_trips_deleted
            + self.bikes_unstuck
            + self.bikes_marked_missing
            + self.observations_pruned
            + self.states_pruned
            + self.movements_pruned
            + self.orphaned_malfunctions_deleted
            + self.stale_malfunctions_resolved
            + self.bike_stats_corrected
    }
}

/// Live counts of records the repair passes care about, computed on
/// demand. Nonzero numbers here are not damage, just the backlog the next
/// run will inspect.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct DataHealthReport {
    pub bikes_unseen: i64,
    pub stale_observations: i64,
    pub stale_station_states: i64,
}

/// Runs the repair passes.
pub struct RecoveryEngine {
    storage: Storage,
    config: TrackerConfig,
}

impl RecoveryEngine {
    pub fn new(storage: Storage, config: TrackerConfig) -> Self {
        Self { storage, config }
    }

    /// The full periodic run, passes in dependency order: bad trips go
    /// first so the statistics recompute at the end sums a clean ledger.
    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        self.sweep_bad_trips(now, &mut report).await?;
        self.unstick_in_transit(now, &mut report).await?;
        self.prune_history(now, &mut report).await?;
        self.repair_malfunctions(now, &mut report).await?;
        self.recompute_bike_stats(&mut report).await?;
        self.mark_missing(now, &mut report).await?;

        if report.total_changes() > 0 {
            info!(changes = report.total_changes(), report = ?report, "recovery repaired state");
        } else {
            info!("recovery found nothing to repair");
        }
        Ok(report)
    }

    async fn sweep_bad_trips(
        &self,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> anyhow::Result<()> {
        let open_cutoff = now - Duration::seconds(self.config.max_open_trip_secs);
        report.open_trips_deleted = self.storage.delete_stale_open_trips(open_cutoff).await?;
        report.impossible_trips_deleted = self
            .storage
            .delete_impossible_trips(self.config.max_trip_secs, self.config.max_distance_km)
            .await?;
        Ok(())
    }

    /// Bikes riding longer than any plausible trip lost their arrival.
    /// Restore them to their last observed dock if the observation is fresh
    /// enough to trust, otherwise declare them missing.
    async fn unstick_in_transit(
        &self,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> anyhow::Result<()> {
        let stuck_cutoff = now - Duration::seconds(self.config.max_trip_secs);
        let trust_cutoff = now - Duration::hours(self.config.missing_hours);

        for bike in self.storage.list_stale_in_transit_bikes(stuck_cutoff).await? {
            let observation = self.storage.latest_observation_for_bike(bike.id).await?;
            match observation {
                Some(obs) if obs.timestamp >= trust_cutoff => {
                    // The observation is the last trusted sighting; restore
                    // the tracking clock to it, not just the position.
                    let mut restored = bike;
                    restored.current_status = obs.status;
                    restored.current_station_id = Some(obs.station_id);
                    restored.last_seen_at = obs.timestamp;
                    restored.arrived_at_station = Some(obs.timestamp);
                    self.storage.save_bike_tracking(&restored).await?;
                    report.bikes_unstuck += 1;
                }
                _ => {
                    warn!(bike = %bike.name, "in transit past any plausible trip, no trusted observation");
                    self.storage
                        .set_bike_status(bike.id, BikeStatus::Missing, None)
                        .await?;
                    self.detector().flag_missing(&bike).await?;
                    report.bikes_marked_missing += 1;
                }
            }
        }
        Ok(())
    }

    async fn prune_history(
        &self,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> anyhow::Result<()> {
        let history_cutoff = now - Duration::days(self.config.history_retention_days);
        let state_cutoff = now - Duration::hours(self.config.state_retention_hours);

        report.observations_pruned = self
            .storage
            .delete_observations_before(history_cutoff)
            .await?;
        report.states_pruned = self
            .storage
            .delete_station_states_before(state_cutoff)
            .await?;
        report.movements_pruned = self.storage.delete_movements_before(history_cutoff).await?;
        Ok(())
    }

    async fn repair_malfunctions(
        &self,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> anyhow::Result<()> {
        report.orphaned_malfunctions_deleted =
            self.storage.delete_orphaned_malfunctions().await?;

        let stale_cutoff = now - Duration::days(self.config.stale_malfunction_days);
        report.stale_malfunctions_resolved = self
            .storage
            .resolve_stale_malfunctions(stale_cutoff, now)
            .await?;
        Ok(())
    }

    /// The trip ledger is authoritative; cached per-bike totals must match
    /// it exactly.
    async fn recompute_bike_stats(&self, report: &mut RecoveryReport) -> anyhow::Result<()> {
        for bike in self.storage.list_all_bikes().await? {
            let (trips, distance, duration, boomerangs) =
                self.storage.bike_trip_totals(bike.id).await?;
            let drifted = bike.total_trips != trips
                || bike.total_duration != duration
                || bike.boomerang_count != boomerangs
                || (bike.total_distance - distance).abs() > 1e-9;
            if drifted {
                self.storage
                    .set_bike_stats(bike.id, trips, distance, duration, boomerangs)
                    .await?;
                report.bike_stats_corrected += 1;
            }
        }
        Ok(())
    }

    /// Demote bikes unseen past the missing threshold, flagging each one
    /// so the malfunction record exists before the next detection cycle.
    async fn mark_missing(
        &self,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> anyhow::Result<()> {
        let cutoff = now - Duration::hours(self.config.missing_hours);
        let detector = self.detector();
        for bike in self.storage.list_bikes_unseen_since(cutoff).await? {
            self.storage
                .set_bike_status(bike.id, BikeStatus::Missing, None)
                .await?;
            detector.flag_missing(&bike).await?;
            report.bikes_marked_missing += 1;
        }
        Ok(())
    }

    fn detector(&self) -> MalfunctionDetector {
        MalfunctionDetector::new(self.storage.clone())
    }

    /// Live counts of records the repair passes would look at, served by
    /// the recovery status endpoint.
    pub async fn data_health(&self, now: DateTime<Utc>) -> anyhow::Result<DataHealthReport> {
        let missing_cutoff = now - Duration::hours(self.config.missing_hours);
        let history_cutoff = now - Duration::days(self.config.history_retention_days);
        let state_cutoff = now - Duration::hours(self.config.state_retention_hours);

        Ok(DataHealthReport {
            bikes_unseen: self.storage.count_bikes_unseen_since(missing_cutoff).await?,
            stale_observations: self
                .storage
                .count_observations_before(history_cutoff)
                .await?,
            stale_station_states: self
                .storage
                .count_station_states_before(state_cutoff)
                .await?,
        })
    }

    /// Rebuild every bike's live position from its most recent observation.
    /// The blunt instrument for recovering from an extended outage where
    /// the incremental state can no longer be trusted.
    #[instrument(skip(self))]
    pub async fn reset_from_observations(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let trust_cutoff = now - Duration::hours(self.config.missing_hours);
        let mut restored = 0;

        for obs in self.storage.latest_observation_per_bike().await? {
            if obs.timestamp >= trust_cutoff {
                self.storage
                    .set_bike_status(obs.bike_id, obs.status, Some(obs.station_id))
                    .await?;
            } else {
                self.storage
                    .set_bike_status(obs.bike_id, BikeStatus::Missing, None)
                    .await?;
            }
            restored += 1;
        }

        info!(restored, "rebuilt bike state from observations");
        Ok(restored)
    }

    /// Collapse trips sharing an identity tuple, then re-derive the bike
    /// statistics the duplicates inflated.
    #[instrument(skip(self))]
    pub async fn dedupe_trips(&self) -> anyhow::Result<u64> {
        let removed = self.storage.delete_duplicate_trips().await?;
        if removed > 0 {
            let mut report = RecoveryReport::default();
            self.recompute_bike_stats(&mut report).await?;
            info!(removed, stats_corrected = report.bike_stats_corrected, "deduplicated trips");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StationRecord;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn setup() -> (Storage, RecoveryEngine) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let engine = RecoveryEngine::new(storage.clone(), TrackerConfig::default());
        (storage, engine)
    }

    async fn seed_station(storage: &Storage, code: &str) -> i64 {
        storage
            .upsert_station(
                &StationRecord {
                    code: code.to_string(),
                    name: format!("Station {code}"),
                    latitude: 48.85,
                    longitude: 2.35,
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

    #[tokio::test]
    async fn test_impossible_trips_are_swept() {
        let (storage, engine) = setup().await;
        let a = seed_station(&storage, "A").await;
        let bike = storage.get_or_create_bike("b1", false, t(0)).await.unwrap();

        // Physically impossible: longer than any plausible trip.
        storage
            .create_trip_with_stats(
                bike.id,
                a,
                a,
                t(0),
                t(50_000),
                50_000,
                1.0,
                0.1,
                false,
                false,
            )
            .await
            .unwrap();

        let report = engine.run(t(60_000)).await.unwrap();
        assert_eq!(report.impossible_trips_deleted, 1);
        assert_eq!(storage.count_trips().await.unwrap(), 0);

        // Statistics that counted the bad trip were corrected in the same run.
        let bike = storage.get_bike(bike.id).await.unwrap().unwrap();
        assert_eq!(bike.total_trips, 0);
    }

    #[tokio::test]
    async fn test_stuck_in_transit_restored_from_observation() {
        let (storage, engine) = setup().await;
        let a = seed_station(&storage, "A").await;
        let now = t(5 * 3600);

        let bike = storage.get_or_create_bike("b1", false, t(0)).await.unwrap();
        storage
            .set_bike_status(bike.id, BikeStatus::InTransit, None)
            .await
            .unwrap();
        storage
            .insert_observation(bike.id, a, t(3600), BikeStatus::Available, None)
            .await
            .unwrap();

        let report = engine.run(now).await.unwrap();
        assert_eq!(report.bikes_unstuck, 1);

        let bike = storage.get_bike(bike.id).await.unwrap().unwrap();
        assert_eq!(bike.current_status, BikeStatus::Available);
        assert_eq!(bike.current_station_id, Some(a));
        // The tracking clock follows the observation, so the bike does not
        // immediately look unseen to the missing rule.
        assert_eq!(bike.last_seen_at, t(3600));
        assert_eq!(bike.arrived_at_station, Some(t(3600)));
        assert!(bike.location_invariant_holds());
    }

    #[tokio::test]
    async fn test_stuck_in_transit_without_observation_goes_missing() {
        let (storage, engine) = setup().await;
        let now = t(5 * 3600);

        let bike = storage.get_or_create_bike("b1", false, t(0)).await.unwrap();
        storage
            .set_bike_status(bike.id, BikeStatus::InTransit, None)
            .await
            .unwrap();

        let report = engine.run(now).await.unwrap();
        assert!(report.bikes_marked_missing >= 1);

        let bike = storage.get_bike(bike.id).await.unwrap().unwrap();
        assert_eq!(bike.current_status, BikeStatus::Missing);
        assert!(bike.location_invariant_holds());
        assert!(storage
            .find_active_malfunction(bike.id, crate::model::MalfunctionKind::Missing)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_unseen_bike_marked_missing_with_record() {
        let (storage, engine) = setup().await;
        let a = seed_station(&storage, "A").await;
        let now = t(48 * 3600);

        // Docked two days ago, never seen since.
        let mut bike = storage.get_or_create_bike("b1", false, t(0)).await.unwrap();
        bike.current_station_id = Some(a);
        bike.current_status = BikeStatus::Available;
        bike.last_seen_at = t(0);
        bike.arrived_at_station = Some(t(0));
        storage.save_bike_tracking(&bike).await.unwrap();

        let report = engine.run(now).await.unwrap();
        assert_eq!(report.bikes_marked_missing, 1);

        // Status and malfunction record land in the same pass, not one
        // detection cycle later.
        let bike = storage.get_bike(bike.id).await.unwrap().unwrap();
        assert_eq!(bike.current_status, BikeStatus::Missing);
        assert!(bike.potential_malfunction);
        assert!(bike.malfunction_score > 0.0);
        assert!(storage
            .find_active_malfunction(bike.id, crate::model::MalfunctionKind::Missing)
            .await
            .unwrap()
            .is_some());

        // And the pass stays idempotent.
        let second = engine.run(now).await.unwrap();
        assert_eq!(second.total_changes(), 0);
    }

    #[tokio::test]
    async fn test_data_health_counts_backlog() {
        let (storage, engine) = setup().await;
        let a = seed_station(&storage, "A").await;
        let bike = storage.get_or_create_bike("b1", false, t(0)).await.unwrap();
        let now = t(10 * 86400);

        storage
            .insert_observation(bike.id, a, t(0), BikeStatus::Available, None)
            .await
            .unwrap();
        storage
            .insert_station_state(t(0), a, &["b1".to_string()])
            .await
            .unwrap();

        let health = engine.data_health(now).await.unwrap();
        assert_eq!(health.bikes_unseen, 1);
        assert_eq!(health.stale_observations, 1);
        assert_eq!(health.stale_station_states, 1);

        // A run drains the prunable backlog.
        engine.run(now).await.unwrap();
        let health = engine.data_health(now).await.unwrap();
        assert_eq!(health.stale_observations, 0);
        assert_eq!(health.stale_station_states, 0);
    }

    #[tokio::test]
    async fn test_history_is_pruned() {
        let (storage, engine) = setup().await;
        let a = seed_station(&storage, "A").await;
        let bike = storage.get_or_create_bike("b1", false, t(0)).await.unwrap();
        let now = t(10 * 86400);

        storage
            .insert_observation(bike.id, a, t(0), BikeStatus::Available, None)
            .await
            .unwrap();
        storage
            .insert_observation(bike.id, a, now, BikeStatus::Available, None)
            .await
            .unwrap();
        storage
            .insert_station_state(t(0), a, &["b1".to_string()])
            .await
            .unwrap();

        let report = engine.run(now).await.unwrap();
        assert_eq!(report.observations_pruned, 1);
        assert_eq!(report.states_pruned, 1);

        // The fresh observation survives.
        assert!(storage
            .latest_observation_for_bike(bike.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_drifted_stats_are_corrected() {
        let (storage, engine) = setup().await;
        let a = seed_station(&storage, "A").await;
        let b = seed_station(&storage, "B").await;
        let bike = storage.get_or_create_bike("b1", false, t(0)).await.unwrap();

        storage
            .create_trip_with_stats(bike.id, a, b, t(0), t(600), 600, 2.0, 12.0, false, false)
            .await
            .unwrap();
        // Corrupt the cached totals.
        storage.set_bike_stats(bike.id, 99, 999.0, 9999, 9).await.unwrap();

        let report = engine.run(t(700)).await.unwrap();
        assert_eq!(report.bike_stats_corrected, 1);

        let bike = storage.get_bike(bike.id).await.unwrap().unwrap();
        assert_eq!(bike.total_trips, 1);
        assert_eq!(bike.total_duration, 600);
        assert_eq!(bike.boomerang_count, 0);
    }

    #[tokio::test]
    async fn test_recovery_reaches_a_fixed_point() {
        let (storage, engine) = setup().await;
        let a = seed_station(&storage, "A").await;
        let now = t(5 * 3600);

        let bike = storage.get_or_create_bike("b1", false, t(0)).await.unwrap();
        storage
            .set_bike_status(bike.id, BikeStatus::InTransit, None)
            .await
            .unwrap();
        storage
            .insert_observation(bike.id, a, t(3600), BikeStatus::Available, None)
            .await
            .unwrap();
        storage
            .create_trip_with_stats(bike.id, a, a, t(0), t(50_000), 50_000, 1.0, 0.1, false, false)
            .await
            .unwrap();

        let first = engine.run(now).await.unwrap();
        assert!(first.total_changes() > 0);

        let second = engine.run(now).await.unwrap();
        assert_eq!(second.total_changes(), 0);
    }

    #[tokio::test]
    async fn test_orphaned_malfunctions_are_dropped() {
        let (storage, engine) = setup().await;

        // bike_id 999 does not exist
        storage
            .insert_malfunction(999, crate::model::MalfunctionKind::Stuck, 2, "ghost", None, None)
            .await
            .unwrap();

        let report = engine.run(t(100)).await.unwrap();
        assert_eq!(report.orphaned_malfunctions_deleted, 1);
        assert_eq!(storage.count_active_malfunctions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_from_observations() {
        let (storage, engine) = setup().await;
        let a = seed_station(&storage, "A").await;
        let now = t(4 * 3600);

        let fresh = storage.get_or_create_bike("b1", false, t(0)).await.unwrap();
        storage
            .insert_observation(fresh.id, a, t(3600), BikeStatus::Available, None)
            .await
            .unwrap();

        let stale = storage.get_or_create_bike("b2", false, t(0)).await.unwrap();
        storage
            .insert_observation(stale.id, a, t(0) - Duration::days(3), BikeStatus::Available, None)
            .await
            .unwrap();

        let restored = engine.reset_from_observations(now).await.unwrap();
        assert_eq!(restored, 2);

        let fresh = storage.get_bike(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.current_status, BikeStatus::Available);
        assert_eq!(fresh.current_station_id, Some(a));

        let stale = storage.get_bike(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.current_status, BikeStatus::Missing);
    }

    #[tokio::test]
    async fn test_dedupe_leaves_unique_ledger_alone() {
        let (storage, engine) = setup().await;
        let a = seed_station(&storage, "A").await;
        let b = seed_station(&storage, "B").await;
        let bike = storage.get_or_create_bike("b1", false, t(0)).await.unwrap();

        storage
            .create_trip_with_stats(bike.id, a, b, t(0), t(600), 600, 2.0, 12.0, false, false)
            .await
            .unwrap();

        assert_eq!(engine.dedupe_trips().await.unwrap(), 0);
        assert_eq!(storage.count_trips().await.unwrap(), 1);
    }
}
