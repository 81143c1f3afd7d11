use crate::models::presence::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Average straight-line truck speed used for ETA estimates. Routing is
/// intentionally out of scope; distances are great-circle.
const AVERAGE_SPEED_KMH: f64 = 40.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lon = (b.lon - a.lon).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lon = (delta_lon / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lon * sin_lon;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

pub fn distance_meters(a: &GeoPoint, b: &GeoPoint) -> f64 {
    haversine_km(a, b) * 1_000.0
}

pub fn eta_minutes(from: &GeoPoint, to: &GeoPoint) -> f64 {
    haversine_km(from, to) / AVERAGE_SPEED_KMH * 60.0
}

#[cfg(test)]
mod tests {
    use super::{distance_meters, eta_minutes, haversine_km};
    use crate::models::presence::GeoPoint;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 41.0082,
            lon: 28.9784,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint {
            lat: 51.5074,
            lon: -0.1278,
        };
        let paris = GeoPoint {
            lat: 48.8566,
            lon: 2.3522,
        };
        let distance = haversine_km(&london, &paris);
        assert!((distance - 343.0).abs() < 5.0);
    }

    #[test]
    fn meters_scale_matches_km() {
        let a = GeoPoint { lat: 41.0, lon: 29.0 };
        let b = GeoPoint {
            lat: 41.01,
            lon: 29.0,
        };
        let km = haversine_km(&a, &b);
        let m = distance_meters(&a, &b);
        assert!((m - km * 1_000.0).abs() < 1e-6);
        // one hundredth of a degree of latitude is roughly 1.1 km
        assert!((m - 1_112.0).abs() < 20.0);
    }

    #[test]
    fn eta_for_40_km_is_an_hour() {
        let a = GeoPoint { lat: 41.0, lon: 29.0 };
        let b = GeoPoint {
            lat: 41.0 + 40.0 / 111.19,
            lon: 29.0,
        };
        let eta = eta_minutes(&a, &b);
        assert!((eta - 60.0).abs() < 1.0);
    }
}
