//! Domain types for the fleet tracker.
//!
//! The central abstraction is the observation chain: a [`Snapshot`] of which
//! bikes are docked where comes in from the feed, the differencer turns it
//! into [`MovementEvent`]s, and the reconstructor joins matching events into
//! immutable [`Trip`]s. [`Bike`] rows carry the live view of that chain plus
//! cumulative statistics; [`MalfunctionRecord`]s layer health signals on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a bike currently is, as far as the tracker knows.
///
/// Invariant maintained by the ingest and recovery passes: a bike has a
/// `current_station` exactly when its status is `Available` or
/// `Unavailable`. A bike that is `InTransit` or `Missing` is docked nowhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BikeStatus {
    /// Docked and rentable.
    Available,
    /// Docked but blocked from rental (maintenance hold, rating lock, ...).
    Unavailable,
    /// Absent from every station, presumed riding.
    InTransit,
    /// Absent long enough that we no longer expect it back on its own.
    Missing,
    /// Feed reported a status string we do not recognize.
    Unknown,
}

impl BikeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BikeStatus::Available => "available",
            BikeStatus::Unavailable => "unavailable",
            BikeStatus::InTransit => "in_transit",
            BikeStatus::Missing => "missing",
            BikeStatus::Unknown => "unknown",
        }
    }

    /// Parse a stored status string. Unrecognized values collapse to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "available" => BikeStatus::Available,
            "unavailable" => BikeStatus::Unavailable,
            "in_transit" => BikeStatus::InTransit,
            "missing" => BikeStatus::Missing,
            _ => BikeStatus::Unknown,
        }
    }

    /// Map the feed provider's status vocabulary onto the closed enum.
    /// The upstream API speaks French.
    pub fn from_feed(s: &str) -> Self {
        match s {
            "disponible" => BikeStatus::Available,
            "indisponible" => BikeStatus::Unavailable,
            _ => BikeStatus::parse(s),
        }
    }

    /// Whether this status means the bike is physically at a station.
    pub fn is_docked(self) -> bool {
        matches!(self, BikeStatus::Available | BikeStatus::Unavailable)
    }
}

/// A dock station. Identity is the provider `code`; occupancy counts are
/// overwritten on every poll.
#[derive(Debug, Clone, Serialize)]
pub struct Station {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub nb_bike: i64,
    pub nb_ebike: i64,
    pub nb_free_dock: i64,
    pub total_capacity: i64,
    pub updated_at: DateTime<Utc>,
}

/// Live tracking state and cumulative statistics for one bike.
#[derive(Debug, Clone, Serialize)]
pub struct Bike {
    pub id: i64,
    /// Provider identity, e.g. a frame number.
    pub name: String,
    pub electric: bool,
    pub current_station_id: Option<i64>,
    pub current_status: BikeStatus,
    pub last_seen_at: DateTime<Utc>,
    /// When the bike arrived at its current station, if docked.
    pub arrived_at_station: Option<DateTime<Utc>>,
    /// When the bike last left a station.
    pub left_station_at: Option<DateTime<Utc>>,
    /// The station it last departed from.
    pub previous_station_id: Option<i64>,
    pub total_trips: i64,
    pub total_distance: f64,
    pub total_duration: i64,
    pub boomerang_count: i64,
    pub potential_malfunction: bool,
    pub malfunction_score: f64,
    pub created_at: DateTime<Utc>,
}

impl Bike {
    /// The station/status invariant every write path must preserve.
    pub fn location_invariant_holds(&self) -> bool {
        self.current_station_id.is_some() == self.current_status.is_docked()
    }
}

/// Departed or arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Departed,
    Arrived,
}

impl MovementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementKind::Departed => "departed",
            MovementKind::Arrived => "arrived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "departed" => Some(MovementKind::Departed),
            "arrived" => Some(MovementKind::Arrived),
            _ => None,
        }
    }
}

/// An immutable movement fact derived from comparing consecutive snapshots.
/// The append-only log of these is the join key for trip matching.
#[derive(Debug, Clone, Serialize)]
pub struct MovementEvent {
    pub id: i64,
    pub bike_id: i64,
    pub kind: MovementKind,
    pub station_id: i64,
    pub timestamp: DateTime<Utc>,
    pub dock_position: Option<String>,
    pub bike_status: Option<BikeStatus>,
}

/// A reconstructed trip. Created exactly once per matched departure/arrival
/// pair and never mutated afterwards; only the recovery engine may delete one.
#[derive(Debug, Clone, Serialize)]
pub struct Trip {
    pub id: i64,
    pub bike_id: i64,
    pub start_station_id: i64,
    pub end_station_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds, `end_time - start_time`.
    pub duration: i64,
    /// Great-circle distance between the two stations, km.
    pub distance: f64,
    /// km/h, zero when duration is zero.
    pub avg_speed: f64,
    pub is_boomerang: bool,
    pub is_short_trip: bool,
    pub created_at: DateTime<Utc>,
}

/// Categories of bike health problems the detector can flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalfunctionKind {
    /// Repeatedly returned to its start station within minutes.
    Boomerang,
    /// Electric bike consistently below walking-adjacent speeds.
    LowSpeed,
    /// Unseen beyond the missing threshold.
    Missing,
    /// Docked, observed, but never rented for a week.
    Stuck,
    /// Electric bike misbehaving right after a long charging dock.
    BatteryIssue,
}

impl MalfunctionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MalfunctionKind::Boomerang => "boomerang",
            MalfunctionKind::LowSpeed => "low_speed",
            MalfunctionKind::Missing => "missing",
            MalfunctionKind::Stuck => "stuck",
            MalfunctionKind::BatteryIssue => "battery_issue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "boomerang" => Some(MalfunctionKind::Boomerang),
            "low_speed" => Some(MalfunctionKind::LowSpeed),
            "missing" => Some(MalfunctionKind::Missing),
            "stuck" => Some(MalfunctionKind::Stuck),
            "battery_issue" => Some(MalfunctionKind::BatteryIssue),
            _ => None,
        }
    }
}

/// One flagged health problem. At most one *active* record exists per
/// (bike, kind); the storage layer enforces this with a partial unique index.
#[derive(Debug, Clone, Serialize)]
pub struct MalfunctionRecord {
    pub id: i64,
    pub bike_id: i64,
    pub kind: MalfunctionKind,
    /// 1 (informational) to 5 (take it off the street).
    pub severity: i64,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub related_trip_id: Option<i64>,
    pub station_id: Option<i64>,
}

/// An observation of one bike docked at one station, kept as short-lived
/// history so recovery can re-derive live state after a gap.
#[derive(Debug, Clone, Serialize)]
pub struct BikeObservation {
    pub id: i64,
    pub bike_id: i64,
    pub station_id: i64,
    pub timestamp: DateTime<Utc>,
    pub status: BikeStatus,
    pub dock_position: Option<String>,
}

// ============================================================================
// Inbound snapshot shape (what the feed collaborator hands the differencer)
// ============================================================================

/// A full point-in-time capture of station occupancy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    pub stations: Vec<StationRecord>,
}

/// One station's live state within a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationRecord {
    pub code: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub nb_bike: i64,
    pub nb_ebike: i64,
    pub nb_free_dock: i64,
    pub total_capacity: i64,
    pub bikes: Vec<BikePresence>,
}

/// One bike present at a station within a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BikePresence {
    pub name: String,
    pub electric: bool,
    pub status: BikeStatus,
    pub dock_position: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_feed_mapping() {
        assert_eq!(BikeStatus::from_feed("disponible"), BikeStatus::Available);
        assert_eq!(BikeStatus::from_feed("indisponible"), BikeStatus::Unavailable);
        assert_eq!(BikeStatus::from_feed("en_panne"), BikeStatus::Unknown);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            BikeStatus::Available,
            BikeStatus::Unavailable,
            BikeStatus::InTransit,
            BikeStatus::Missing,
            BikeStatus::Unknown,
        ] {
            assert_eq!(BikeStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn test_docked_statuses() {
        assert!(BikeStatus::Available.is_docked());
        assert!(BikeStatus::Unavailable.is_docked());
        assert!(!BikeStatus::InTransit.is_docked());
        assert!(!BikeStatus::Missing.is_docked());
        assert!(!BikeStatus::Unknown.is_docked());
    }

    #[test]
    fn test_location_invariant() {
        let mut bike = Bike {
            id: 1,
            name: "10042".to_string(),
            electric: false,
            current_station_id: Some(7),
            current_status: BikeStatus::Available,
            last_seen_at: Utc::now(),
            arrived_at_station: None,
            left_station_at: None,
            previous_station_id: None,
            total_trips: 0,
            total_distance: 0.0,
            total_duration: 0,
            boomerang_count: 0,
            potential_malfunction: false,
            malfunction_score: 0.0,
            created_at: Utc::now(),
        };
        assert!(bike.location_invariant_holds());

        bike.current_status = BikeStatus::InTransit;
        assert!(!bike.location_invariant_holds());

        bike.current_station_id = None;
        assert!(bike.location_invariant_holds());
    }

    #[test]
    fn test_movement_kind_parse() {
        assert_eq!(MovementKind::parse("departed"), Some(MovementKind::Departed));
        assert_eq!(MovementKind::parse("arrived"), Some(MovementKind::Arrived));
        assert_eq!(MovementKind::parse("teleported"), None);
    }
}
