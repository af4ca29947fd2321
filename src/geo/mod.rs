use crate::models::tracking::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lon = (delta_lon / 2.0).sin();

    let a = sin_lat * sin_lat + phi1.cos() * phi2.cos() * sin_lon * sin_lon;
    let central_angle = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * central_angle
}

pub fn distance_between(a: &GeoPoint, b: &GeoPoint) -> f64 {
    haversine_km(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Point `fraction` of the way from `from` to `to`, interpolated linearly in degrees.
pub fn step_towards(from: &GeoPoint, to: &GeoPoint, fraction: f64) -> GeoPoint {
    let fraction = fraction.clamp(0.0, 1.0);
    GeoPoint::new(
        from.latitude + (to.latitude - from.latitude) * fraction,
        from.longitude + (to.longitude - from.longitude) * fraction,
    )
}
