//! Great-circle helpers shared by the filter and the trajectory accumulator.

use geo::{HaversineDistance, Point};

use crate::types::Fix;

/// Meters per degree of latitude on the mean-radius sphere `geo` uses.
const METERS_PER_DEG_LAT: f64 = 111_195.08;

/// Haversine distance in meters between two lat/lng pairs.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    Point::new(lng1, lat1).haversine_distance(&Point::new(lng2, lat2))
}

/// Haversine distance in meters between two fixes.
pub fn distance_between(a: &Fix, b: &Fix) -> f64 {
    haversine_m(a.lat, a.lng, b.lat, b.lng)
}

/// Moves a coordinate by local east/north offsets in meters.
///
/// Equirectangular approximation, accurate to well under a centimeter over the
/// tens of meters this is used for (synthetic tracks, test fixtures).
pub fn offset_m(lat: f64, lng: f64, east_m: f64, north_m: f64) -> (f64, f64) {
    let d_lat = north_m / METERS_PER_DEG_LAT;
    let d_lng = east_m / (METERS_PER_DEG_LAT * lat.to_radians().cos());
    (lat + d_lat, lng + d_lng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_zero_distance() {
        assert_eq!(haversine_m(39.9042, 116.4074, 39.9042, 116.4074), 0.0);
    }

    #[test]
    fn test_known_distance() {
        // One degree of latitude along a meridian
        let d = haversine_m(0.0, 10.0, 1.0, 10.0);
        assert_relative_eq!(d, METERS_PER_DEG_LAT, max_relative = 1e-4);
    }

    #[test]
    fn test_offset_matches_haversine() {
        let (lat, lng) = (39.9042, 116.4074);
        for (east, north) in [(10.0, 0.0), (0.0, 10.0), (15.0, 15.0), (-3.0, 1.0)] {
            let (lat2, lng2) = offset_m(lat, lng, east, north);
            let expected = f64::hypot(east, north);
            assert_relative_eq!(haversine_m(lat, lng, lat2, lng2), expected, epsilon = 0.01);
        }
    }
}
