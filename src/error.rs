//! Error taxonomy for the tracking pipeline.
//!
//! Nothing in the pipeline surfaces errors to an interactive user; every
//! failure is logged with enough context (bike/station identity, timestamps)
//! to replay manually. The variants here exist so the worker and the batch
//! jobs can decide *how* to degrade:
//!
//! - [`TrackerError::TransientFetch`]: the upstream feed was unreachable or
//!   malformed. The cycle is skipped and no state is mutated.
//! - [`TrackerError::InconsistentState`]: a row references something that no
//!   longer exists. The offending row is corrected or skipped; the batch
//!   continues.
//! - [`TrackerError::ImpossibleTrip`]: duration/distance out of physical
//!   bounds. Filtered at creation time, swept by recovery if it slipped
//!   through.
//!
//! Duplicate inserts hitting a uniqueness constraint are not a variant of
//! their own: the storage layer spots them with
//! [`TrackerError::is_unique_violation`] and absorbs them as no-ops.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Upstream feed unreachable or returned garbage. Skip the cycle.
    #[error("transient feed error: {0}")]
    TransientFetch(String),

    /// A record references state that no longer exists.
    #[error("inconsistent state for bike '{bike}': {detail}")]
    InconsistentState { bike: String, detail: String },

    /// Trip metrics outside physical bounds; never materialized.
    #[error("impossible trip for bike '{bike}': {duration_secs}s / {distance_km:.1}km")]
    ImpossibleTrip {
        bike: String,
        duration_secs: i64,
        distance_km: f64,
    },
}

impl TrackerError {
    /// Whether a store-level error is a uniqueness violation the caller
    /// should absorb as a no-op.
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.is_unique_violation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_context() {
        let err = TrackerError::InconsistentState {
            bike: "12345".to_string(),
            detail: "current station vanished".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("12345"));
        assert!(msg.contains("vanished"));
    }

    #[test]
    fn test_impossible_trip_display() {
        let err = TrackerError::ImpossibleTrip {
            bike: "99".to_string(),
            duration_secs: -5,
            distance_km: 250.0,
        };
        assert!(err.to_string().contains("-5s"));
    }
}
