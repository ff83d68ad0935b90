use crate::models::ambulance::Coordinate;

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Assumed average road speed used for ETA estimates. Not measured.
pub const AVERAGE_SPEED_KMH: f64 = 40.0;

/// Great-circle distance in kilometers between two points given in degrees.
///
/// Uses the atan2 form of the haversine formula, which stays well conditioned
/// for coincident and near-coincident points. NaN inputs propagate.
pub fn distance(lat_a: f64, lng_a: f64, lat_b: f64, lng_b: f64) -> f64 {
    let lat1 = lat_a.to_radians();
    let lat2 = lat_b.to_radians();
    let delta_lat = (lat_b - lat_a).to_radians();
    let delta_lng = (lng_b - lng_a).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().atan2((1.0 - haversine).sqrt());

    EARTH_RADIUS_KM * central_angle
}

pub fn haversine_km(a: &Coordinate, b: &Coordinate) -> f64 {
    distance(a.lat, a.lng, b.lat, b.lng)
}

/// Rounds to one decimal place for display.
pub fn round_km(km: f64) -> f64 {
    (km * 10.0).round() / 10.0
}

/// Whole minutes needed to cover `distance_km` at `speed_kmh`.
pub fn eta_minutes(distance_km: f64, speed_kmh: f64) -> u32 {
    (distance_km / speed_kmh * 60.0).round() as u32
}
