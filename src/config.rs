//! Tracker configuration.
//!
//! Every tuning constant here is a heuristic calibrated for a city-scale
//! dock network (a few kilometers between most stations, trips measured in
//! minutes). They are exposed as `VELOTRACE_*` environment variables rather
//! than hardcoded so the same binary can track a geographically different
//! network.

use std::env;

/// Thresholds and schedules for the whole pipeline.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Longest plausible trip when matching a departure to an arrival (seconds).
    pub max_trip_secs: i64,
    /// Shortest trip worth materializing; guards against transient
    /// disappearances between polls (seconds).
    pub min_trip_secs: i64,
    /// Same-station round trips at or below this duration are boomerangs (seconds).
    pub boomerang_secs: i64,
    /// Trips strictly below this duration are flagged short (seconds).
    pub short_trip_secs: i64,
    /// Station-to-station distance above this is physically impossible (km).
    pub max_distance_km: f64,
    /// A trip still open after this long is discarded by recovery (seconds).
    pub max_open_trip_secs: i64,
    /// Hours unseen before a bike is declared missing.
    pub missing_hours: i64,
    /// A docked bike gets a state refresh at least this often even if
    /// nothing changed (seconds).
    pub refresh_backstop_secs: i64,
    /// Station-state diff history kept for trip reconstruction (hours).
    pub state_retention_hours: i64,
    /// Bike observation history kept before recovery prunes it (days).
    pub history_retention_days: i64,
    /// Active malfunctions older than this are auto-resolved (days).
    pub stale_malfunction_days: i64,

    /// Feed poll cadence (seconds).
    pub poll_interval_secs: u64,
    /// Trip reconstruction cadence (seconds).
    pub reconstruct_interval_secs: u64,
    /// Malfunction detection cadence (seconds).
    pub detect_interval_secs: u64,
    /// Full recovery cadence (seconds).
    pub recovery_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_trip_secs: 3 * 3600,
            min_trip_secs: 90,
            boomerang_secs: 300,
            short_trip_secs: 180,
            max_distance_km: 100.0,
            max_open_trip_secs: 8 * 3600,
            missing_hours: 24,
            refresh_backstop_secs: 3600,
            state_retention_hours: 24,
            history_retention_days: 7,
            stale_malfunction_days: 30,
            poll_interval_secs: 60,
            reconstruct_interval_secs: 120,
            detect_interval_secs: 900,
            recovery_interval_secs: 6 * 3600,
        }
    }
}

impl TrackerConfig {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_trip_secs: env_i64("VELOTRACE_MAX_TRIP_SECS", d.max_trip_secs),
            min_trip_secs: env_i64("VELOTRACE_MIN_TRIP_SECS", d.min_trip_secs),
            boomerang_secs: env_i64("VELOTRACE_BOOMERANG_SECS", d.boomerang_secs),
            short_trip_secs: env_i64("VELOTRACE_SHORT_TRIP_SECS", d.short_trip_secs),
            max_distance_km: env_f64("VELOTRACE_MAX_DISTANCE_KM", d.max_distance_km),
            max_open_trip_secs: env_i64("VELOTRACE_MAX_OPEN_TRIP_SECS", d.max_open_trip_secs),
            missing_hours: env_i64("VELOTRACE_MISSING_HOURS", d.missing_hours),
            refresh_backstop_secs: env_i64("VELOTRACE_REFRESH_BACKSTOP_SECS", d.refresh_backstop_secs),
            state_retention_hours: env_i64("VELOTRACE_STATE_RETENTION_HOURS", d.state_retention_hours),
            history_retention_days: env_i64("VELOTRACE_HISTORY_RETENTION_DAYS", d.history_retention_days),
            stale_malfunction_days: env_i64("VELOTRACE_STALE_MALFUNCTION_DAYS", d.stale_malfunction_days),
            poll_interval_secs: env_u64("VELOTRACE_POLL_INTERVAL_SECS", d.poll_interval_secs),
            reconstruct_interval_secs: env_u64(
                "VELOTRACE_RECONSTRUCT_INTERVAL_SECS",
                d.reconstruct_interval_secs,
            ),
            detect_interval_secs: env_u64("VELOTRACE_DETECT_INTERVAL_SECS", d.detect_interval_secs),
            recovery_interval_secs: env_u64(
                "VELOTRACE_RECOVERY_INTERVAL_SECS",
                d.recovery_interval_secs,
            ),
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let c = TrackerConfig::default();
        // The matcher window must exceed the minimum trip duration.
        assert!(c.max_trip_secs > c.min_trip_secs);
        // Short-trip threshold sits below the boomerang threshold.
        assert!(c.short_trip_secs < c.boomerang_secs);
        // Recovery's open-trip limit is looser than the matcher's.
        assert!(c.max_open_trip_secs > c.max_trip_secs);
    }

    #[test]
    fn test_env_fallback_on_garbage() {
        assert_eq!(env_i64("VELOTRACE_TEST_DOES_NOT_EXIST", 42), 42);
    }
}
