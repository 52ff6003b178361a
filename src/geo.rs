//! Great-circle distance between station coordinates.

/// Distance in kilometers between two coordinates using the Haversine formula.
///
/// Station-to-station distance is a lower bound on the path a bike actually
/// took; it is what trip distance and average speed are computed from.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let rlat1 = lat1.to_radians();
    let rlat2 = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + rlat1.cos() * rlat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    6371.0 * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        assert_eq!(haversine_km(48.8566, 2.3522, 48.8566, 2.3522), 0.0);
    }

    #[test]
    fn test_known_distance() {
        // Bastille (48.8532, 2.3692) to Concorde (48.8656, 2.3212): ~3.8 km
        let d = haversine_km(48.8532, 2.3692, 48.8656, 2.3212);
        assert!((d - 3.8).abs() < 0.5);
    }

    #[test]
    fn test_symmetry() {
        let a = haversine_km(48.85, 2.35, 48.87, 2.30);
        let b = haversine_km(48.87, 2.30, 48.85, 2.35);
        assert!((a - b).abs() < 1e-9);
    }
}
