//! Per-entity behavioural baselines
//!
//! Profiles are created lazily on first observation, mutated only by
//! `observe`, and live for the life of the process.

mod merchant;
mod user;

pub use merchant::MerchantProfile;
pub use user::{FrequencyTotals, UserProfile};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two lat/long points, in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_for_same_point() {
        assert!(haversine_km(40.71, -74.0, 40.71, -74.0).abs() < 1e-9);
    }

    #[test]
    fn haversine_new_york_to_moscow() {
        let d = haversine_km(40.71, -74.00, 55.75, 37.62);
        // ~7500 km great-circle.
        assert!((7000.0..8000.0).contains(&d), "got {d}");
    }

    #[test]
    fn haversine_short_hop() {
        // Manhattan to JFK, roughly 20 km.
        let d = haversine_km(40.7580, -73.9855, 40.6413, -73.7781);
        assert!((15.0..25.0).contains(&d), "got {d}");
    }
}
