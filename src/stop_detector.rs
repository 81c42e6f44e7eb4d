//! Locates a vehicle within a route's ordered stop sequence, with direction
//! disambiguation via the equal-probe test and a course/stickiness scoring
//! function.
//!
//! Grounded directly on the original `stop_detector` module — the
//! hand-rolled flat-Earth math there (as opposed to the Shapely-based route
//! matcher) carries over almost unchanged; only the per-direction stop
//! storage becomes an explicit `HashMap` keyed by `(route_id, direction)`
//! instead of a nested dict.

use std::collections::HashMap;

use crate::config::TuningConfig;
use crate::geometry::{self, LatLon};
use crate::models::StopOnRoute;

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub direction: u8,
    pub prev_stop: StopOnRoute,
    pub next_stops: Vec<StopOnRoute>,
}

pub struct StopDetector {
    /// `(route_id, direction) -> stops sorted by order`, each with its
    /// `cumulative_distance_m` precomputed on load.
    stops_by_direction: HashMap<(i64, u8), Vec<StopOnRoute>>,
    course_penalty: f64,
    stickiness_penalty: f64,
    equal_probe_epsilon_m: f64,
    min_probe_m: f64,
    probe_fraction: f64,
}

impl StopDetector {
    pub fn new(tuning: &TuningConfig) -> Self {
        Self {
            stops_by_direction: HashMap::new(),
            course_penalty: tuning.course_penalty,
            stickiness_penalty: tuning.stickiness_penalty,
            equal_probe_epsilon_m: tuning.equal_probe_epsilon_m,
            min_probe_m: tuning.min_probe_m,
            probe_fraction: tuning.probe_fraction,
        }
    }

    /// Loads one direction's ordered stop sequence for a route, computing
    /// cumulative along-sequence GPS distance from the first stop.
    pub fn load_direction(&mut self, route_id: i64, direction: u8, mut stops: Vec<StopOnRoute>) {
        stops.sort_by_key(|s| s.order);
        let mut cumulative = 0.0;
        for i in 0..stops.len() {
            if i == 0 {
                stops[i].cumulative_distance_m = 0.0;
            } else {
                let prev = LatLon::new(stops[i - 1].lat, stops[i - 1].lon);
                let here = LatLon::new(stops[i].lat, stops[i].lon);
                cumulative += geometry::flat_distance_m(prev, here);
                stops[i].cumulative_distance_m = cumulative;
            }
            stops[i].direction = direction;
        }
        self.stops_by_direction.insert((route_id, direction), stops);
    }

    pub fn stops_for(&self, route_id: i64, direction: u8) -> Option<&[StopOnRoute]> {
        self.stops_by_direction.get(&(route_id, direction)).map(|v| v.as_slice())
    }

    /// Scores every direction that has stops loaded for `route_id` and
    /// returns the best-scoring candidate's section.
    pub fn detect(
        &self,
        route_id: i64,
        lat: f64,
        lon: f64,
        course: Option<f64>,
        max_next: usize,
        preferred_direction: Option<u8>,
    ) -> Option<DetectionResult> {
        let p = LatLon::new(lat, lon);
        let mut best: Option<(f64, u8, usize)> = None;

        for direction in [0u8, 1u8] {
            let Some(stops) = self.stops_by_direction.get(&(route_id, direction)) else {
                continue;
            };
            if stops.is_empty() {
                continue;
            }

            let (nearest_idx, nearest_distance_m) = nearest_stop(stops, p);
            let mut score = nearest_distance_m * nearest_distance_m;

            if let Some(course) = course {
                let seg_start = nearest_idx.min(stops.len().saturating_sub(2));
                if stops.len() >= 2 {
                    let a = LatLon::new(stops[seg_start].lat, stops[seg_start].lon);
                    let b = LatLon::new(stops[seg_start + 1].lat, stops[seg_start + 1].lon);
                    let bearing = geometry::bearing_deg(a, b);
                    if geometry::angular_difference_deg(bearing, course) > 90.0 {
                        score += self.course_penalty;
                    }
                }
            }

            if let Some(preferred) = preferred_direction {
                if preferred != direction {
                    score += self.stickiness_penalty;
                }
            }

            let section = self.equal_probe_section(stops, nearest_idx, p);

            if best.map(|(best_score, ..)| score < best_score).unwrap_or(true) {
                best = Some((score, direction, section));
            }
        }

        let (_, direction, section) = best?;
        let stops = self.stops_by_direction.get(&(route_id, direction))?;
        let next_stops = stops
            .iter()
            .skip(section + 1)
            .take(max_next)
            .cloned()
            .collect();

        Some(DetectionResult {
            direction,
            prev_stop: stops[section].clone(),
            next_stops,
        })
    }

    /// Same scoring as [`StopDetector::detect`] restricted to a single
    /// direction, with no course or stickiness penalties.
    pub fn detect_in_direction(
        &self,
        route_id: i64,
        direction: u8,
        lat: f64,
        lon: f64,
        max_next: usize,
    ) -> Option<DetectionResult> {
        let stops = self.stops_by_direction.get(&(route_id, direction))?;
        if stops.is_empty() {
            return None;
        }
        let p = LatLon::new(lat, lon);
        let (nearest_idx, _) = nearest_stop(stops, p);
        let section = self.equal_probe_section(stops, nearest_idx, p);
        let next_stops = stops.iter().skip(section + 1).take(max_next).cloned().collect();
        Some(DetectionResult {
            direction,
            prev_stop: stops[section].clone(),
            next_stops,
        })
    }

    /// Disambiguates whether the vehicle is before, at, or after the nearest
    /// stop `c`, returning the index of the section's earlier stop.
    fn equal_probe_section(&self, stops: &[StopOnRoute], c: usize, p: LatLon) -> usize {
        let n = stops.len();
        if c == 0 {
            return 0;
        }
        if c == n - 1 {
            return n - 2;
        }

        let here = LatLon::new(stops[c].lat, stops[c].lon);
        let prev = LatLon::new(stops[c - 1].lat, stops[c - 1].lon);
        let next = LatLon::new(stops[c + 1].lat, stops[c + 1].lon);

        let d_prev = geometry::flat_distance_m(here, prev);
        let d_next = geometry::flat_distance_m(here, next);
        let probe = (self.probe_fraction * d_prev.min(d_next)).max(self.min_probe_m);

        let prev_probe = point_toward(here, prev, probe);
        let next_probe = point_toward(here, next, probe);

        let dist_to_prev_probe = geometry::flat_distance_m(p, prev_probe);
        let dist_to_next_probe = geometry::flat_distance_m(p, next_probe);

        if (dist_to_prev_probe - dist_to_next_probe).abs() <= self.equal_probe_epsilon_m {
            c
        } else if dist_to_next_probe < dist_to_prev_probe {
            c
        } else {
            c - 1
        }
    }
}

fn nearest_stop(stops: &[StopOnRoute], p: LatLon) -> (usize, f64) {
    let mut best_idx = 0;
    let mut best_distance_m = f64::MAX;
    for (i, stop) in stops.iter().enumerate() {
        let d = geometry::flat_distance_m(p, LatLon::new(stop.lat, stop.lon));
        if d < best_distance_m {
            best_distance_m = d;
            best_idx = i;
        }
    }
    (best_idx, best_distance_m)
}

/// A point `distance_m` meters from `from`, along the straight line toward
/// `toward`, in flat-Earth meters.
fn point_toward(from: LatLon, toward: LatLon, distance_m: f64) -> LatLon {
    let total_m = geometry::flat_distance_m(from, toward);
    if total_m < 1e-6 {
        return from;
    }
    let t = (distance_m / total_m).min(1.0);
    LatLon::new(from.lat + t * (toward.lat - from.lat), from.lon + t * (toward.lon - from.lon))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: i64, name: &str, lat: f64, lon: f64, order: i32) -> StopOnRoute {
        StopOnRoute {
            stop_id: id,
            name: name.to_string(),
            lat,
            lon,
            order,
            direction: 0,
            cumulative_distance_m: 0.0,
        }
    }

    fn linear_detector() -> StopDetector {
        let mut d = StopDetector::new(&TuningConfig::default());
        d.load_direction(
            1,
            0,
            vec![
                stop(1, "A", 56.840, 60.600, 0),
                stop(2, "B", 56.844, 60.600, 1),
                stop(3, "C", 56.848, 60.600, 2),
                stop(4, "D", 56.852, 60.600, 3),
            ],
        );
        d
    }

    #[test]
    fn cumulative_distances_start_at_zero_and_are_nondecreasing() {
        let d = linear_detector();
        let stops = d.stops_for(1, 0).unwrap();
        assert_eq!(stops[0].cumulative_distance_m, 0.0);
        for window in stops.windows(2) {
            assert!(window[1].cumulative_distance_m >= window[0].cumulative_distance_m);
        }
    }

    #[test]
    fn midpoint_detection_scenario() {
        let d = linear_detector();
        let result = d.detect(1, 56.846, 60.600, None, 50, None).unwrap();
        assert_eq!(result.prev_stop.stop_id, 2);
        assert_eq!(result.next_stops[0].stop_id, 3);
    }

    fn bidirectional_detector() -> StopDetector {
        let mut d = StopDetector::new(&TuningConfig::default());
        d.load_direction(
            1,
            0,
            vec![
                stop(1, "A", 56.840, 60.600, 0),
                stop(2, "B", 56.844, 60.600, 1),
                stop(3, "C", 56.848, 60.600, 2),
                stop(4, "D", 56.852, 60.600, 3),
            ],
        );
        d.load_direction(
            1,
            1,
            vec![
                stop(4, "D", 56.852, 60.600, 0),
                stop(3, "C", 56.848, 60.600, 1),
                stop(2, "B", 56.844, 60.600, 2),
                stop(1, "A", 56.840, 60.600, 3),
            ],
        );
        d
    }

    #[test]
    fn direction_stickiness_without_course_keeps_preferred_direction() {
        let d = bidirectional_detector();
        let result = d.detect(1, 56.846, 60.600, None, 50, Some(0)).unwrap();
        assert_eq!(result.direction, 0);
    }

    #[test]
    fn course_penalty_overrides_stickiness() {
        let d = bidirectional_detector();
        // Course of 180 deg (southbound) opposes direction 0's northbound
        // local bearing; the 500_000 course penalty should outweigh the
        // 200_000 stickiness penalty toward direction 0.
        let result = d.detect(1, 56.846, 60.600, Some(180.0), 50, Some(0)).unwrap();
        assert_eq!(result.direction, 1);
    }

    #[test]
    fn detect_in_direction_has_no_penalties() {
        let d = bidirectional_detector();
        let result = d.detect_in_direction(1, 1, 56.846, 60.600, 50).unwrap();
        assert_eq!(result.direction, 1);
    }

    #[test]
    fn detect_returns_none_when_route_has_no_loaded_stops() {
        let d = StopDetector::new(&TuningConfig::default());
        assert!(d.detect(99, 56.0, 60.0, None, 50, None).is_none());
    }
}
