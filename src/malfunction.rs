//! Bike health heuristics.
//!
//! Five rules scan recent trips and fleet state for behavior patterns that
//! correlate with broken hardware. Each match becomes one active
//! [`MalfunctionRecord`] per (bike, kind); re-detecting an already-flagged
//! pattern is a no-op. A composite 0-10 score per bike summarizes its
//! active records, and a resolution pass clears behavioral flags once the
//! bike demonstrably rides normally again.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

use crate::model::{Bike, BikeStatus, MalfunctionKind};
use crate::storage::{BikeFilter, Storage};

// Boomerang: same-station returns within minutes, repeatedly.
const BOOMERANG_WINDOW_HOURS: i64 = 24;
const BOOMERANG_MIN_COUNT: i64 = 3;

// Low speed: an electric bike this slow has a motor or brake problem.
const LOW_SPEED_WINDOW_DAYS: i64 = 3;
const LOW_SPEED_MIN_TRIPS: i64 = 3;
const LOW_SPEED_MIN_TRIP_SECS: i64 = 300;
const LOW_SPEED_KMH: f64 = 8.0;
const LOW_SPEED_SEVERITY: i64 = 3;

const MISSING_UNSEEN_HOURS: i64 = 24;
const MISSING_SEVERITY: i64 = 4;

// Stuck: docked and visible but never rented for a week.
const STUCK_IDLE_DAYS: i64 = 7;
const STUCK_MIN_AGE_DAYS: i64 = 8;
const STUCK_SEVERITY: i64 = 2;

// Battery issue: long charge dock followed by an immediately aborted ride.
const BATTERY_DOCK_HOURS: i64 = 3;
const BATTERY_WINDOW_HOURS: i64 = 24;
const BATTERY_SHORT_SECS: i64 = 600;
const BATTERY_SLOW_KMH: f64 = 5.0;
const BATTERY_SEVERITY: i64 = 3;

// A trip this healthy clears the behavioral flags.
const HEALTHY_WINDOW_HOURS: i64 = 6;
const HEALTHY_MIN_SECS: i64 = 600;
const HEALTHY_MIN_KMH: f64 = 10.0;

const SCAN_LIMIT: i64 = 100_000;

/// What one detection cycle did.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct MalfunctionReport {
    pub boomerang: usize,
    pub low_speed: usize,
    pub missing: usize,
    pub stuck: usize,
    pub battery_issue: usize,
    pub resolved: usize,
}

impl MalfunctionReport {
    pub fn flagged(&self) -> usize {
        self.boomerang + self.low_speed + self.missing + self.stuck + self.battery_issue
    }
}

/// Runs the detection rules and maintains per-bike health scores.
pub struct MalfunctionDetector {
    storage: Storage,
}

impl MalfunctionDetector {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// One full detection cycle: all rules, then resolution, then rescoring.
    /// Rescoring covers every bike the rules touched plus every bike whose
    /// cached score no longer matches its records, so scores converge even
    /// when records were resolved outside a detection cycle.
    #[instrument(skip(self))]
    pub async fn detect(&self, now: DateTime<Utc>) -> anyhow::Result<MalfunctionReport> {
        let mut report = MalfunctionReport::default();
        let mut touched: HashSet<i64> = HashSet::new();

        self.detect_boomerangs(now, &mut report, &mut touched).await?;
        self.detect_low_speed(now, &mut report, &mut touched).await?;
        self.detect_missing(now, &mut report, &mut touched).await?;
        self.detect_stuck(now, &mut report, &mut touched).await?;
        self.detect_battery_issues(now, &mut report, &mut touched).await?;
        self.resolve_recovered(now, &mut report, &mut touched).await?;

        for bike_id in self.storage.bike_ids_needing_rescore().await? {
            touched.insert(bike_id);
        }
        for bike_id in touched {
            self.update_score(bike_id).await?;
        }

        if report.flagged() + report.resolved > 0 {
            info!(
                flagged = report.flagged(),
                resolved = report.resolved,
                "malfunction detection cycle done"
            );
        }
        Ok(report)
    }

    async fn detect_boomerangs(
        &self,
        now: DateTime<Utc>,
        report: &mut MalfunctionReport,
        touched: &mut HashSet<i64>,
    ) -> anyhow::Result<()> {
        let cutoff = now - Duration::hours(BOOMERANG_WINDOW_HOURS);
        for (bike_id, count) in self
            .storage
            .boomerang_counts_since(cutoff, BOOMERANG_MIN_COUNT)
            .await?
        {
            let severity = (count / BOOMERANG_MIN_COUNT).min(5);
            let created = self
                .flag(
                    bike_id,
                    MalfunctionKind::Boomerang,
                    severity,
                    &format!("{count} boomerang trips in the last {BOOMERANG_WINDOW_HOURS}h"),
                )
                .await?;
            if created {
                report.boomerang += 1;
            }
            touched.insert(bike_id);
        }
        Ok(())
    }

    async fn detect_low_speed(
        &self,
        now: DateTime<Utc>,
        report: &mut MalfunctionReport,
        touched: &mut HashSet<i64>,
    ) -> anyhow::Result<()> {
        let cutoff = now - Duration::days(LOW_SPEED_WINDOW_DAYS);
        for (bike_id, avg_speed, trips) in self
            .storage
            .electric_speed_stats_since(cutoff, LOW_SPEED_MIN_TRIPS, LOW_SPEED_MIN_TRIP_SECS)
            .await?
        {
            if avg_speed >= LOW_SPEED_KMH {
                continue;
            }
            let created = self
                .flag(
                    bike_id,
                    MalfunctionKind::LowSpeed,
                    LOW_SPEED_SEVERITY,
                    &format!("averaging {avg_speed:.1} km/h over {trips} trips"),
                )
                .await?;
            if created {
                report.low_speed += 1;
            }
            touched.insert(bike_id);
        }
        Ok(())
    }

    async fn detect_missing(
        &self,
        now: DateTime<Utc>,
        report: &mut MalfunctionReport,
        touched: &mut HashSet<i64>,
    ) -> anyhow::Result<()> {
        // Bikes the ingest loop has not yet demoted get demoted here, so
        // the rule holds even when ingestion is stalled.
        let unseen_cutoff = now - Duration::hours(MISSING_UNSEEN_HOURS);
        for bike in self.storage.list_bikes_unseen_since(unseen_cutoff).await? {
            self.storage
                .set_bike_status(bike.id, BikeStatus::Missing, None)
                .await?;
        }

        let missing = self
            .storage
            .list_bikes(&BikeFilter {
                status: Some(BikeStatus::Missing),
                limit: SCAN_LIMIT,
                ..Default::default()
            })
            .await?;

        for bike in missing {
            let created = self
                .flag(
                    bike.id,
                    MalfunctionKind::Missing,
                    MISSING_SEVERITY,
                    &format!("last seen {}", bike.last_seen_at),
                )
                .await?;
            if created {
                report.missing += 1;
            }
            touched.insert(bike.id);
        }
        Ok(())
    }

    async fn detect_stuck(
        &self,
        now: DateTime<Utc>,
        report: &mut MalfunctionReport,
        touched: &mut HashSet<i64>,
    ) -> anyhow::Result<()> {
        let idle_cutoff = now - Duration::days(STUCK_IDLE_DAYS);
        let recently_ridden: HashSet<i64> = self
            .storage
            .bike_ids_with_trips_since(idle_cutoff)
            .await?
            .into_iter()
            .collect();
        let age_cutoff = now - Duration::days(STUCK_MIN_AGE_DAYS);

        for bike in self.storage.list_docked_bikes().await? {
            if recently_ridden.contains(&bike.id)
                || bike.created_at > age_cutoff
                || bike.last_seen_at < idle_cutoff
            {
                continue;
            }
            let created = self
                .flag(
                    bike.id,
                    MalfunctionKind::Stuck,
                    STUCK_SEVERITY,
                    &format!("docked without a trip for over {STUCK_IDLE_DAYS} days"),
                )
                .await?;
            if created {
                report.stuck += 1;
            }
            touched.insert(bike.id);
        }
        Ok(())
    }

    async fn detect_battery_issues(
        &self,
        now: DateTime<Utc>,
        report: &mut MalfunctionReport,
        touched: &mut HashSet<i64>,
    ) -> anyhow::Result<()> {
        let cutoff = now - Duration::hours(BATTERY_WINDOW_HOURS);
        let suspicious = self
            .storage
            .suspicious_electric_trips_since(cutoff, BATTERY_SHORT_SECS, BATTERY_SLOW_KMH)
            .await?;

        for trip in suspicious {
            // Only a problem if the bike had a long charging dock right
            // before: a full battery that still cannot move the bike.
            let Some(prev) = self
                .storage
                .previous_trip_ending_before(trip.bike_id, trip.start_time)
                .await?
            else {
                continue;
            };
            let docked = trip.start_time - prev.end_time;
            if docked < Duration::hours(BATTERY_DOCK_HOURS) {
                continue;
            }

            let created = self
                .flag(
                    trip.bike_id,
                    MalfunctionKind::BatteryIssue,
                    BATTERY_SEVERITY,
                    &format!(
                        "aborted ride after {}h docked",
                        docked.num_hours()
                    ),
                )
                .await?;
            if created {
                report.battery_issue += 1;
            }
            touched.insert(trip.bike_id);
        }
        Ok(())
    }

    /// Clear behavioral flags for bikes that just completed a normal ride.
    /// Missing and stuck flags are positional, not behavioral, and clear
    /// through their own rules ceasing to match plus score recomputation.
    async fn resolve_recovered(
        &self,
        now: DateTime<Utc>,
        report: &mut MalfunctionReport,
        touched: &mut HashSet<i64>,
    ) -> anyhow::Result<()> {
        let cutoff = now - Duration::hours(HEALTHY_WINDOW_HOURS);
        let healthy = self
            .storage
            .bikes_with_healthy_trip_since(cutoff, HEALTHY_MIN_SECS, HEALTHY_MIN_KMH)
            .await?;

        for bike_id in healthy {
            let resolved = self
                .storage
                .resolve_malfunctions_for_bike(
                    bike_id,
                    &[
                        MalfunctionKind::Boomerang,
                        MalfunctionKind::LowSpeed,
                        MalfunctionKind::BatteryIssue,
                    ],
                    now,
                )
                .await?;
            if resolved > 0 {
                debug!(bike_id, resolved, "behavioral flags cleared after healthy trip");
                report.resolved += resolved as usize;
                touched.insert(bike_id);
            }
        }
        Ok(())
    }

    /// Flag one bike as missing and fold the record into its score right
    /// away. Used by the recovery engine, which demotes unseen bikes
    /// outside a detection cycle.
    pub async fn flag_missing(&self, bike: &Bike) -> anyhow::Result<bool> {
        let created = self
            .flag(
                bike.id,
                MalfunctionKind::Missing,
                MISSING_SEVERITY,
                &format!("last seen {}", bike.last_seen_at),
            )
            .await?;
        if created {
            self.update_score(bike.id).await?;
        }
        Ok(created)
    }

    /// Recompute one bike's composite score from its active records.
    pub async fn update_score(&self, bike_id: i64) -> anyhow::Result<f64> {
        let active = self.storage.active_malfunctions_for_bike(bike_id).await?;
        let raw: i64 = active.iter().map(|m| m.severity * 2).sum();
        let score = (raw as f64).min(10.0);
        self.storage
            .set_bike_health(bike_id, score, score > 0.0)
            .await?;
        Ok(score)
    }

    /// Flag one (bike, kind), skipping when an active record already exists.
    async fn flag(
        &self,
        bike_id: i64,
        kind: MalfunctionKind,
        severity: i64,
        description: &str,
    ) -> anyhow::Result<bool> {
        if self
            .storage
            .find_active_malfunction(bike_id, kind)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        let inserted = self
            .storage
            .insert_malfunction(bike_id, kind, severity, description, None, None)
            .await?;
        Ok(inserted.is_some())
    }
}
