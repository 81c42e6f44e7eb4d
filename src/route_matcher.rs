//! Projects GPS fixes onto a route's polyline (1-D linear referencing).
//!
//! Grounded on the original `route_matcher` module's Shapely-based
//! projection: the same normalized-progress / perpendicular-distance /
//! direction-inference contract, reimplemented with the flat-Earth segment
//! math in [`crate::geometry`] instead of a geometry library.

use std::collections::HashMap;

use crate::config::TuningConfig;
use crate::geometry::{self, LatLon};

/// A loaded route polyline with precomputed per-segment and cumulative
/// lengths, so `match`/`interpolate` don't re-walk the whole polyline.
struct LoadedRoute {
    points: Vec<LatLon>,
    /// Cumulative distance in meters at each point, `cumulative[0] == 0`.
    cumulative_m: Vec<f64>,
    total_length_m: f64,
}

impl LoadedRoute {
    fn new(points: Vec<LatLon>) -> Self {
        let mut cumulative_m = Vec::with_capacity(points.len());
        let mut total = 0.0;
        cumulative_m.push(0.0);
        for window in points.windows(2) {
            total += geometry::flat_distance_m(window[0], window[1]);
            cumulative_m.push(total);
        }
        Self {
            points,
            cumulative_m,
            total_length_m: total,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatchResult {
    pub progress: f64,
    pub distance_m: f64,
    pub direction: u8,
}

/// Holds the catalog's loaded polylines, keyed by route id. Replaced
/// wholesale on each catalog refresh via repeated [`RouteMatcher::load`]
/// calls against a fresh instance.
pub struct RouteMatcher {
    routes: HashMap<i64, LoadedRoute>,
    max_snap_distance_m: f64,
}

impl RouteMatcher {
    pub fn new(tuning: &TuningConfig) -> Self {
        Self {
            routes: HashMap::new(),
            max_snap_distance_m: tuning.max_snap_distance_m,
        }
    }

    /// Stores the polyline for `route_id` if it has at least two points.
    /// Replaces any prior geometry for that id.
    pub fn load(&mut self, route_id: i64, points: &[(f64, f64)]) {
        if points.len() < 2 {
            self.routes.remove(&route_id);
            return;
        }
        let pts: Vec<LatLon> = points.iter().map(|&(lat, lon)| LatLon::new(lat, lon)).collect();
        self.routes.insert(route_id, LoadedRoute::new(pts));
    }

    pub fn total_length(&self, route_id: i64) -> Option<f64> {
        self.routes.get(&route_id).map(|r| r.total_length_m)
    }

    /// Projects `(lat, lon)` onto the route's polyline, returning the
    /// nearest point's normalized progress, perpendicular distance, and
    /// inferred direction. `None` if the route isn't loaded or the nearest
    /// point exceeds the configured max snap distance.
    pub fn match_point(&self, route_id: i64, lat: f64, lon: f64, course: Option<f64>) -> Option<MatchResult> {
        let route = self.routes.get(&route_id)?;
        if route.points.len() < 2 || route.total_length_m <= 0.0 {
            return None;
        }
        let p = LatLon::new(lat, lon);

        let mut best_distance_sq = f64::MAX;
        let mut best_segment = 0usize;
        let mut best_t = 0.0;

        for (i, window) in route.points.windows(2).enumerate() {
            let proj = geometry::project_to_segment(p, window[0], window[1]);
            if proj.distance_sq_m < best_distance_sq {
                best_distance_sq = proj.distance_sq_m;
                best_segment = i;
                best_t = proj.t;
            }
        }

        let distance_m = best_distance_sq.sqrt();
        if distance_m > self.max_snap_distance_m {
            return None;
        }

        let seg_start_m = route.cumulative_m[best_segment];
        let seg_len_m = route.cumulative_m[best_segment + 1] - seg_start_m;
        let along_m = seg_start_m + best_t * seg_len_m;
        let progress = (along_m / route.total_length_m).clamp(0.0, 1.0);

        let direction = infer_direction(route, progress, course);

        Some(MatchResult {
            progress,
            distance_m,
            direction,
        })
    }

    /// Interpolates a point on the polyline at normalized `progress`.
    pub fn interpolate(&self, route_id: i64, progress: f64) -> Option<(f64, f64)> {
        let route = self.routes.get(&route_id)?;
        if route.points.is_empty() {
            return None;
        }
        if route.points.len() == 1 || route.total_length_m <= 0.0 {
            let p = route.points[0];
            return Some((p.lat, p.lon));
        }

        let target_m = progress.clamp(0.0, 1.0) * route.total_length_m;
        let idx = match route.cumulative_m.binary_search_by(|c| c.partial_cmp(&target_m).unwrap()) {
            Ok(i) => i.min(route.points.len() - 2),
            Err(i) => i.saturating_sub(1).min(route.points.len() - 2),
        };

        let seg_start_m = route.cumulative_m[idx];
        let seg_len_m = route.cumulative_m[idx + 1] - seg_start_m;
        let t = if seg_len_m > 1e-9 {
            ((target_m - seg_start_m) / seg_len_m).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let a = route.points[idx];
        let b = route.points[idx + 1];
        Some((a.lat + t * (b.lat - a.lat), a.lon + t * (b.lon - a.lon)))
    }
}

/// Local-bearing-vs-course direction inference over a ±0.5% window around
/// `progress`. Near either endpoint (progress outside [0.01, 0.99]) the
/// ambiguity is too high to call, so direction defaults to forward.
fn infer_direction(route: &LoadedRoute, progress: f64, course: Option<f64>) -> u8 {
    if !(0.01..=0.99).contains(&progress) {
        return 0;
    }
    let Some(course) = course else { return 0 };

    const WINDOW_FRACTION: f64 = 0.005;
    let before_progress = (progress - WINDOW_FRACTION).max(0.0);
    let after_progress = (progress + WINDOW_FRACTION).min(1.0);

    let Some(before) = point_at_progress(route, before_progress) else { return 0 };
    let Some(after) = point_at_progress(route, after_progress) else { return 0 };

    let local_bearing = geometry::bearing_deg(before, after);
    let diff = geometry::angular_difference_deg(local_bearing, course);

    if diff > 90.0 { 1 } else { 0 }
}

fn point_at_progress(route: &LoadedRoute, progress: f64) -> Option<LatLon> {
    let target_m = progress.clamp(0.0, 1.0) * route.total_length_m;
    let idx = match route.cumulative_m.binary_search_by(|c| c.partial_cmp(&target_m).unwrap()) {
        Ok(i) => i.min(route.points.len() - 2),
        Err(i) => i.saturating_sub(1).min(route.points.len() - 2),
    };
    let seg_start_m = route.cumulative_m[idx];
    let seg_len_m = route.cumulative_m[idx + 1] - seg_start_m;
    let t = if seg_len_m > 1e-9 {
        ((target_m - seg_start_m) / seg_len_m).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let a = route.points[idx];
    let b = route.points[idx + 1];
    Some(LatLon::new(a.lat + t * (b.lat - a.lat), a.lon + t * (b.lon - a.lon)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_route() -> RouteMatcher {
        let mut m = RouteMatcher::new(&TuningConfig::default());
        m.load(1, &[(56.840, 60.600), (56.844, 60.600), (56.848, 60.600), (56.852, 60.600)]);
        m
    }

    #[test]
    fn match_returns_none_past_max_snap_distance() {
        let m = straight_route();
        let far = m.match_point(1, 60.0, 60.0, None);
        assert!(far.is_none());
    }

    #[test]
    fn match_within_distance_returns_progress_in_bounds() {
        let m = straight_route();
        let result = m.match_point(1, 56.846, 60.600, None).unwrap();
        assert!(result.distance_m <= TuningConfig::default().max_snap_distance_m);
        assert!((0.0..=1.0).contains(&result.progress));
    }

    #[test]
    fn interpolate_round_trips_near_match_progress() {
        let m = straight_route();
        let result = m.match_point(1, 56.846, 60.600, None).unwrap();
        let (lat, lon) = m.interpolate(1, result.progress).unwrap();
        let dist = geometry::haversine_distance_m(
            LatLon::new(56.846, 60.600),
            LatLon::new(lat, lon),
        );
        assert!(dist <= result.distance_m + 5.0, "dist={dist} match={}", result.distance_m);
    }

    #[test]
    fn course_opposing_local_bearing_flips_direction() {
        let m = straight_route();
        // Route runs due north; a vehicle reporting a southbound course at
        // the midpoint should be classified as direction 1 (reverse).
        let result = m.match_point(1, 56.846, 60.600, Some(180.0)).unwrap();
        assert_eq!(result.direction, 1);
    }

    #[test]
    fn course_matching_local_bearing_keeps_direction_zero() {
        let m = straight_route();
        let result = m.match_point(1, 56.846, 60.600, Some(0.0)).unwrap();
        assert_eq!(result.direction, 0);
    }

    #[test]
    fn load_ignores_polylines_with_fewer_than_two_points() {
        let mut m = RouteMatcher::new(&TuningConfig::default());
        m.load(2, &[(56.0, 60.0)]);
        assert!(m.total_length(2).is_none());
    }
}
