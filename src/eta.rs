//! Converts vehicle speed and upcoming-stop distances into per-stop ETAs.
//!
//! Grounded on the original `eta_calculator` module's GPS-anchored variant
//! (the "most-evolved" of the two diverged copies): the first leg is
//! anchored on the live GPS distance to avoid a systematic offset from the
//! stop-chain's own cumulative distances, and everything past it is pure
//! along-chain distance.

use crate::geometry::{self, LatLon};
use crate::models::StopOnRoute;

const MIN_SPEED_KMH: f64 = 5.0;
const KMH_TO_MS: f64 = 3.6;

/// ETA in seconds for each entry of `next_stops`, monotonically
/// non-decreasing in input order. `None` where the ETA would exceed
/// `max_eta_seconds`.
pub fn estimate(
    vehicle_lat: f64,
    vehicle_lon: f64,
    speed_kmh: f64,
    next_stops: &[StopOnRoute],
    max_eta_seconds: i64,
) -> Vec<Option<i64>> {
    let Some(first) = next_stops.first() else {
        return Vec::new();
    };

    let effective_speed_ms = speed_kmh.max(MIN_SPEED_KMH) / KMH_TO_MS;
    let vehicle = LatLon::new(vehicle_lat, vehicle_lon);
    let first_leg_m = geometry::flat_distance_m(vehicle, LatLon::new(first.lat, first.lon));
    let anchor_cumulative_m = first.cumulative_distance_m;

    next_stops
        .iter()
        .map(|stop| {
            let remaining_m = (first_leg_m + stop.cumulative_distance_m - anchor_cumulative_m).max(0.0);
            let eta_seconds = (remaining_m / effective_speed_ms).floor() as i64;
            if eta_seconds > max_eta_seconds {
                None
            } else {
                Some(eta_seconds)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: i64, lat: f64, lon: f64, cumulative_m: f64) -> StopOnRoute {
        StopOnRoute {
            stop_id: id,
            name: String::new(),
            lat,
            lon,
            order: 0,
            direction: 0,
            cumulative_distance_m: cumulative_m,
        }
    }

    #[test]
    fn simple_eta_within_expected_window() {
        let stops = vec![stop(1, 56.8445, 60.600, 500.0)];
        let etas = estimate(56.840, 60.600, 36.0, &stops, 3600);
        let eta = etas[0].expect("eta should be finite");
        assert!((40..=60).contains(&eta), "eta={eta}");
    }

    #[test]
    fn zero_speed_is_floored_and_stays_finite() {
        let stops = vec![stop(1, 56.841, 60.600, 100.0)];
        let etas = estimate(56.840, 60.600, 0.0, &stops, 3600);
        let eta = etas[0].expect("eta should be finite");
        assert!(eta > 0);
    }

    #[test]
    fn etas_are_monotonically_nondecreasing() {
        let stops = vec![
            stop(1, 56.841, 60.600, 100.0),
            stop(2, 56.845, 60.600, 500.0),
            stop(3, 56.849, 60.600, 900.0),
        ];
        let etas = estimate(56.840, 60.600, 20.0, &stops, 3600);
        let values: Vec<i64> = etas.into_iter().flatten().collect();
        for window in values.windows(2) {
            assert!(window[1] >= window[0]);
        }
    }

    #[test]
    fn eta_beyond_cap_is_none() {
        let stops = vec![stop(1, 60.0, 60.0, 1_000_000.0)];
        let etas = estimate(56.840, 60.600, 50.0, &stops, 3600);
        assert!(etas[0].is_none());
    }

    #[test]
    fn empty_next_stops_returns_empty_etas() {
        let etas = estimate(56.840, 60.600, 20.0, &[], 3600);
        assert!(etas.is_empty());
    }
}
