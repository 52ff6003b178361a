//! Client for the dock-network availability feed.
//!
//! The provider exposes one endpoint returning the live state of every
//! station, including the list of bikes currently docked at each. The
//! tracker polls it and converts the wire shape into a [`Snapshot`] for the
//! differencer; nothing downstream sees the provider's field names.
//!
//! Any failure here (network, auth, malformed body) is transient by
//! definition: the poll cycle that hit it is skipped and the next one
//! starts from the last stored state.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TrackerError;
use crate::model::{BikePresence, BikeStatus, Snapshot, StationRecord};

/// Default endpoint for the station search API.
const FEED_API_BASE: &str = "https://www.velib-metropole.fr/api/secured/searchStation";

/// Client for polling the station availability feed.
#[derive(Clone)]
pub struct FeedClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl FeedClient {
    /// Create a new feed client against the production endpoint.
    ///
    /// # Arguments
    ///
    /// * `auth_token` - Bearer token for the provider API, if required.
    pub fn new(auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: FEED_API_BASE.to_string(),
            auth_token,
        }
    }

    /// Create a new feed client with a custom base URL (for testing).
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            auth_token: None,
        }
    }

    /// Fetch the full network state and convert it into a snapshot.
    pub async fn fetch_snapshot(&self) -> Result<Snapshot, TrackerError> {
        let payload = FeedQuery {
            station_name: String::new(),
            disponibility: "yes".to_string(),
        };

        let mut request = self.client.post(&self.base_url).json(&payload);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TrackerError::TransientFetch(format!("feed request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(TrackerError::TransientFetch(format!(
                "feed returned HTTP {}",
                response.status()
            )));
        }

        let entries = response
            .json::<Vec<FeedStationEntry>>()
            .await
            .map_err(|e| TrackerError::TransientFetch(format!("feed body unreadable: {e}")))?;

        debug!(stations = entries.len(), "fetched feed snapshot");

        Ok(Snapshot {
            captured_at: Utc::now(),
            stations: entries.into_iter().map(StationRecord::from).collect(),
        })
    }
}

#[derive(Debug, Serialize)]
struct FeedQuery {
    #[serde(rename = "stationName")]
    station_name: String,
    disponibility: String,
}

// ============================================================================
// Wire types
// ============================================================================

/// One station entry as the provider returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedStationEntry {
    pub station: FeedStationInfo,

    #[serde(default, rename = "nbBike")]
    pub nb_bike: i64,

    #[serde(default, rename = "nbEbike")]
    pub nb_ebike: i64,

    #[serde(default, rename = "nbFreeDock")]
    pub nb_free_dock: i64,

    #[serde(default, rename = "nbFreeEDock")]
    pub nb_free_edock: i64,

    #[serde(default, rename = "nbDock")]
    pub nb_dock: i64,

    #[serde(default, rename = "nbEDock")]
    pub nb_edock: i64,

    #[serde(default)]
    pub bikes: Vec<FeedBikeEntry>,
}

/// Station identity block within a feed entry.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedStationInfo {
    pub code: String,

    #[serde(default)]
    pub name: String,

    pub gps: FeedGps,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedGps {
    #[serde(default)]
    pub latitude: f64,

    #[serde(default)]
    pub longitude: f64,
}

/// One docked bike within a feed entry.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedBikeEntry {
    #[serde(rename = "bikeName")]
    pub bike_name: String,

    /// "yes" or "no" on the wire.
    #[serde(default, rename = "bikeElectric")]
    pub bike_electric: String,

    #[serde(default, rename = "bikeStatus")]
    pub bike_status: String,

    #[serde(default, rename = "dockPosition")]
    pub dock_position: Option<String>,
}

impl From<FeedStationEntry> for StationRecord {
    fn from(entry: FeedStationEntry) -> Self {
        let bikes = entry
            .bikes
            .into_iter()
            .map(|b| BikePresence {
                name: b.bike_name,
                electric: b.bike_electric == "yes",
                status: BikeStatus::from_feed(&b.bike_status),
                dock_position: b.dock_position,
            })
            .collect();

        StationRecord {
            code: entry.station.code,
            name: entry.station.name,
            latitude: entry.station.gps.latitude,
            longitude: entry.station.gps.longitude,
            nb_bike: entry.nb_bike,
            nb_ebike: entry.nb_ebike,
            nb_free_dock: entry.nb_free_dock + entry.nb_free_edock,
            total_capacity: entry.nb_dock + entry.nb_edock,
            bikes,
        }
    }
}
