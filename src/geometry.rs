//! Flat-Earth meter approximation and point/segment geometry shared by the
//! route matcher and stop detector. All distance math below is cheap and
//! "good enough" for a city-scale tram network; haversine is reserved for
//! the few places ground truth matters (see [`haversine_distance_m`]).

/// Meters per degree of latitude, constant everywhere on the ellipsoid to
/// the precision this tracker needs.
pub const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// Reference latitude (degrees) the flat-Earth approximation is centered
/// on. Chosen once per deployment to match the city's centroid.
pub const REFERENCE_LATITUDE_DEG: f64 = 56.838_011;

fn meters_per_degree_lon(reference_lat_deg: f64) -> f64 {
    METERS_PER_DEGREE_LAT * reference_lat_deg.to_radians().cos()
}

/// A point in (lat, lon) degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Flat-Earth distance in meters between two points, using a fixed
/// reference latitude for the longitude scale factor. Cheap, and accurate
/// enough over the span of a single tram route.
pub fn flat_distance_m(a: LatLon, b: LatLon) -> f64 {
    flat_distance_m_at(a, b, REFERENCE_LATITUDE_DEG)
}

pub fn flat_distance_m_at(a: LatLon, b: LatLon, reference_lat_deg: f64) -> f64 {
    let m_lon = meters_per_degree_lon(reference_lat_deg);
    let dy = (b.lat - a.lat) * METERS_PER_DEGREE_LAT;
    let dx = (b.lon - a.lon) * m_lon;
    (dx * dx + dy * dy).sqrt()
}

/// Ground-truth great-circle distance in meters. Used where a decision
/// turns on an actual accuracy bound (snap-error rejection).
pub fn haversine_distance_m(a: LatLon, b: LatLon) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Bearing in degrees [0, 360) from `a` to `b`, using the flat-Earth
/// approximation (accurate enough to compare against a vehicle's reported
/// course).
pub fn bearing_deg(a: LatLon, b: LatLon) -> f64 {
    bearing_deg_at(a, b, REFERENCE_LATITUDE_DEG)
}

pub fn bearing_deg_at(a: LatLon, b: LatLon, reference_lat_deg: f64) -> f64 {
    let m_lon = meters_per_degree_lon(reference_lat_deg);
    let dy = (b.lat - a.lat) * METERS_PER_DEGREE_LAT;
    let dx = (b.lon - a.lon) * m_lon;
    let deg = dx.atan2(dy).to_degrees();
    (deg + 360.0) % 360.0
}

/// Absolute angular difference between two bearings, folded into [0, 180].
pub fn angular_difference_deg(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    if diff > 180.0 { 360.0 - diff } else { diff }
}

/// Result of projecting a point onto a segment: squared distance in meters
/// and the clamped parametric position `t` in [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct SegmentProjection {
    pub distance_sq_m: f64,
    pub t: f64,
}

/// Projects `p` onto the segment `a`→`b` in flat-Earth meters, clamping the
/// parametric position to [0, 1]. Degenerate (near-zero-length) segments
/// collapse to point distance against `a`.
pub fn project_to_segment(p: LatLon, a: LatLon, b: LatLon) -> SegmentProjection {
    project_to_segment_at(p, a, b, REFERENCE_LATITUDE_DEG)
}

pub fn project_to_segment_at(p: LatLon, a: LatLon, b: LatLon, reference_lat_deg: f64) -> SegmentProjection {
    let m_lon = meters_per_degree_lon(reference_lat_deg);
    let to_xy = |pt: LatLon| (pt.lon * m_lon, pt.lat * METERS_PER_DEGREE_LAT);
    let (ax, ay) = to_xy(a);
    let (bx, by) = to_xy(b);
    let (px, py) = to_xy(p);

    let abx = bx - ax;
    let aby = by - ay;
    let len_sq = abx * abx + aby * aby;

    if len_sq < 1e-6 {
        let dx = px - ax;
        let dy = py - ay;
        return SegmentProjection {
            distance_sq_m: dx * dx + dy * dy,
            t: 0.0,
        };
    }

    let apx = px - ax;
    let apy = py - ay;
    let t = ((apx * abx + apy * aby) / len_sq).clamp(0.0, 1.0);

    let projx = ax + t * abx;
    let projy = ay + t * aby;
    let dx = px - projx;
    let dy = py - projy;

    SegmentProjection {
        distance_sq_m: dx * dx + dy * dy,
        t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_distance_matches_order_of_magnitude_of_haversine() {
        let a = LatLon::new(56.840, 60.600);
        let b = LatLon::new(56.844, 60.600);
        let flat = flat_distance_m(a, b);
        let hav = haversine_distance_m(a, b);
        assert!((flat - hav).abs() < 5.0, "flat={flat} hav={hav}");
    }

    #[test]
    fn bearing_north_is_zero() {
        let a = LatLon::new(56.000, 60.000);
        let b = LatLon::new(56.001, 60.000);
        assert!(bearing_deg(a, b) < 1.0);
    }

    #[test]
    fn bearing_south_is_180() {
        let a = LatLon::new(56.001, 60.000);
        let b = LatLon::new(56.000, 60.000);
        assert!((bearing_deg(a, b) - 180.0).abs() < 1.0);
    }

    #[test]
    fn angular_difference_folds_into_0_180() {
        assert!((angular_difference_deg(350.0, 10.0) - 20.0).abs() < 1e-9);
        assert!((angular_difference_deg(0.0, 180.0) - 180.0).abs() < 1e-9);
    }

    #[test]
    fn projection_onto_segment_clamps_to_endpoints() {
        let a = LatLon::new(56.000, 60.000);
        let b = LatLon::new(56.001, 60.000);
        let far_before = LatLon::new(55.999, 60.000);
        let proj = project_to_segment(far_before, a, b);
        assert_eq!(proj.t, 0.0);
    }

    #[test]
    fn degenerate_segment_collapses_to_point_distance() {
        let a = LatLon::new(56.000, 60.000);
        let b = LatLon::new(56.000, 60.000);
        let p = LatLon::new(56.001, 60.000);
        let proj = project_to_segment(p, a, b);
        let expected = flat_distance_m(p, a);
        assert!((proj.distance_sq_m.sqrt() - expected).abs() < 1e-6);
    }
}
