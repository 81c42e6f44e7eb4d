//! Drives one poll cycle end to end: fetch, per-vehicle enrichment,
//! anomaly-bounded clamping, ghost handling, travel-time recording,
//! snapshot publication, and persistence.
//!
//! Grounded on `services::vehicle_positions::VehiclePositionTracker`'s
//! shape (an in-memory per-vehicle state map driven by a periodic task)
//! generalized to the "most-evolved" orchestration semantics the original
//! `vehicle_tracker` module's sibling copy carries: GPS-matched progress
//! with section-bound and snap-error clamping, ghost retention, and
//! incremental travel-time recording, none of which the time-interpolation
//! variant this module is grounded on implements.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::broadcaster::Broadcaster;
use crate::config::TuningConfig;
use crate::eta;
use crate::geometry::{self, LatLon};
use crate::geometry_provider::GeometryProvider;
use crate::models::{
    DayType, NextStop, PrevStop, ProjectionEvent, ProjectionEventKind, Route, Snapshot, StopArrival, StopArrivals,
    StopOnRoute, TravelObservation, VehicleState,
};
use crate::persistence::{local_day_type_and_hour, RouteRow, Store, VehiclePositionRow};
use crate::route_matcher::RouteMatcher;
use crate::stop_detector::StopDetector;
use crate::upstream::{RawVehicle, UpstreamClient};

const RECENT_POSITIONS_CAP: usize = 5;
const DIAGNOSTICS_RING_CAP: usize = 500;
const MAX_NEXT_STOPS_DETECTED: usize = 50;
const MAX_NEXT_STOPS_EXPOSED: usize = 5;
const MOVEMENT_BEARING_DISPLACEMENT_M: f64 = 30.0;
const MOVEMENT_SPEED_FLOOR_KMH: f64 = 5.0;
const MONOTONIC_GUARD_DISPLACEMENT_M: f64 = 20.0;
const MONOTONIC_SLACK: f64 = 0.001;
const SECTION_BOUND_SLACK: f64 = 0.01;
const TRAVEL_TIME_MIN_SECONDS: f64 = 10.0;
const TRAVEL_TIME_MAX_SECONDS: f64 = 1800.0;
const MAX_STOP_ARRIVALS: usize = 15;

#[derive(Debug, Clone)]
struct CarryState {
    progress: Option<f64>,
    speed: f64,
    direction: u8,
    route_id: Option<i64>,
    recent_positions: VecDeque<(f64, f64)>,
    last_seen: DateTime<Utc>,
    last_passed: Option<(i64, i64, DateTime<Utc>)>,
}

impl CarryState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            progress: None,
            speed: 0.0,
            direction: 0,
            route_id: None,
            recent_positions: VecDeque::with_capacity(RECENT_POSITIONS_CAP),
            last_seen: now,
            last_passed: None,
        }
    }

    fn push_position(&mut self, lat: f64, lon: f64) {
        if self.recent_positions.len() == RECENT_POSITIONS_CAP {
            self.recent_positions.pop_front();
        }
        self.recent_positions.push_back((lat, lon));
    }

    fn displacement_m(&self) -> f64 {
        match (self.recent_positions.front(), self.recent_positions.back()) {
            (Some(&(olat, olon)), Some(&(nlat, nlon))) => {
                geometry::flat_distance_m(LatLon::new(olat, olon), LatLon::new(nlat, nlon))
            }
            _ => 0.0,
        }
    }
}

/// In-memory catalog snapshot, replaced wholesale on each refresh.
struct Catalog {
    routes: HashMap<i64, Route>,
    route_num_to_id: HashMap<String, i64>,
    route_matcher: RouteMatcher,
    stop_detector: StopDetector,
}

impl Catalog {
    fn new(tuning: &TuningConfig) -> Self {
        Self {
            routes: HashMap::new(),
            route_num_to_id: HashMap::new(),
            route_matcher: RouteMatcher::new(tuning),
            stop_detector: StopDetector::new(tuning),
        }
    }
}

#[derive(Default)]
struct TrackingState {
    vehicle_states: HashMap<String, VehicleState>,
    carry: HashMap<String, CarryState>,
    upcoming_stops: HashMap<String, Vec<StopOnRoute>>,
    diagnostics: VecDeque<ProjectionEvent>,
    travel_time_batch: Vec<TravelObservation>,
}

impl TrackingState {
    fn push_diagnostic(&mut self, event: ProjectionEvent) {
        if self.diagnostics.len() == DIAGNOSTICS_RING_CAP {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(event);
    }
}

pub struct Tracker {
    upstream: UpstreamClient,
    store: Store,
    broadcaster: Broadcaster,
    geometry_provider: GeometryProvider,
    tuning: TuningConfig,
    catalog: RwLock<Catalog>,
    state: RwLock<TrackingState>,
    poll_guard: Mutex<()>,
    refresh_guard: Mutex<()>,
}

impl Tracker {
    pub fn new(
        upstream: UpstreamClient,
        store: Store,
        broadcaster: Broadcaster,
        geometry_provider: GeometryProvider,
        tuning: TuningConfig,
    ) -> Self {
        Self {
            upstream,
            store,
            broadcaster,
            geometry_provider,
            catalog: RwLock::new(Catalog::new(&tuning)),
            tuning,
            state: RwLock::new(TrackingState::default()),
            poll_guard: Mutex::new(()),
            refresh_guard: Mutex::new(()),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Starts the two periodic tasks (`poll_vehicles`, `refresh_catalog`)
    /// and runs them forever, matching `SyncManager::start`'s
    /// spawn-then-`join!` shape.
    pub async fn start(self: Arc<Self>, poll_interval_seconds: u64, route_refresh_hours: u64) {
        info!("Starting tracker scheduler");

        if let Err(e) = self.refresh_catalog().await {
            error!(error = %e, "Initial catalog load failed, will retry on schedule");
        }

        let poll_self = self.clone();
        let poll_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(poll_interval_seconds));
            loop {
                interval.tick().await;
                poll_self.poll_vehicles().await;
            }
        });

        let refresh_self = self.clone();
        let refresh_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(route_refresh_hours * 3600));
            interval.tick().await; // skip immediate re-fire; already refreshed above
            loop {
                interval.tick().await;
                if let Err(e) = refresh_self.refresh_catalog().await {
                    error!(error = %e, "Scheduled catalog refresh failed");
                }
            }
        });

        let _ = tokio::join!(poll_handle, refresh_handle);
    }

    /// Refreshes the route/stop catalog from upstream. `max_instances = 1`:
    /// a still-running refresh causes this call to return immediately
    /// rather than queueing behind it.
    pub async fn refresh_catalog(&self) -> Result<(), String> {
        let Ok(_guard) = self.refresh_guard.try_lock() else {
            debug!("Catalog refresh already in progress, skipping this tick");
            return Ok(());
        };

        let raw_routes = self.upstream.fetch_routes().await;
        if raw_routes.is_empty() {
            return Err("upstream returned no routes".to_string());
        }

        let mut catalog = Catalog::new(&self.tuning);
        let mut route_rows = Vec::new();
        let mut route_stop_rows = Vec::new();

        for raw in &raw_routes {
            let forward_stops: Vec<(f64, f64)> = raw
                .stops
                .iter()
                .filter(|s| s.direction == 0)
                .map(|s| (s.lat, s.lon))
                .collect();

            let points = if raw.points.len() >= 2 {
                raw.points.clone()
            } else {
                self.geometry_provider.resolve(&self.store, &raw.number, &forward_stops).await
            };

            if points.len() < 2 {
                warn!(route_number = %raw.number, "Skipping route with unresolvable geometry");
                continue;
            }

            catalog.route_matcher.load(raw.id, &points);
            let total_length_m = catalog.route_matcher.total_length(raw.id).unwrap_or(0.0);

            catalog.routes.insert(
                raw.id,
                Route {
                    id: raw.id,
                    number: raw.number.clone(),
                    name: raw.name.clone(),
                    points: points.clone(),
                    total_length_m,
                },
            );
            catalog.route_num_to_id.insert(raw.number.clone(), raw.id);
            route_rows.push(RouteRow { id: raw.id, number: raw.number.clone(), name: raw.name.clone() });

            for direction in [0u8, 1u8] {
                let mut stops: Vec<StopOnRoute> = Vec::new();
                for s in raw.stops.iter().filter(|s| s.direction == direction) {
                    if s.lat == 0.0 && s.lon == 0.0 {
                        debug!(route_id = raw.id, stop_id = s.id, "Unresolved stop coordinates, dropping from route");
                        continue;
                    }
                    stops.push(StopOnRoute {
                        stop_id: s.id,
                        name: s.name.clone(),
                        lat: s.lat,
                        lon: s.lon,
                        order: s.order,
                        direction,
                        cumulative_distance_m: 0.0,
                    });
                }
                if stops.is_empty() {
                    continue;
                }
                catalog.stop_detector.load_direction(raw.id, direction, stops);
                for stop in catalog.stop_detector.stops_for(raw.id, direction).unwrap_or(&[]) {
                    route_stop_rows.push((raw.id, stop.clone()));
                }
            }
        }

        let loaded_routes = catalog.routes.len();
        *self.catalog.write().await = catalog;

        if let Err(e) = self.store.upsert_catalog(&route_rows, &route_stop_rows).await {
            error!(error = %e, "Failed to persist refreshed catalog, keeping in-memory catalog");
        }

        info!(routes = loaded_routes, "Catalog refreshed");
        Ok(())
    }

    /// Runs one poll cycle. `max_instances = 1`: if a cycle is still
    /// running, this tick is skipped rather than queued.
    pub async fn poll_vehicles(&self) {
        let Ok(_guard) = self.poll_guard.try_lock() else {
            debug!("Previous poll still running, skipping this tick");
            return;
        };

        let raw_vehicles = self.upstream.fetch_vehicles().await;
        let now = Utc::now();

        let catalog = self.catalog.read().await;
        let mut state = self.state.write().await;

        let mut seen_ids = HashSet::new();
        let mut position_rows = Vec::new();

        for rv in &raw_vehicles {
            seen_ids.insert(rv.dev_id.clone());
            self.process_vehicle(rv, now, &catalog, &mut state, &mut position_rows);
        }

        drop(catalog);

        let ghost_ids: Vec<String> = state
            .vehicle_states
            .keys()
            .filter(|id| !seen_ids.contains(*id))
            .cloned()
            .collect();

        let mut purged = Vec::new();
        for id in ghost_ids {
            let last_seen = state.carry.get(&id).map(|c| c.last_seen).unwrap_or(now);
            let age_seconds = (now - last_seen).num_seconds();
            if age_seconds > self.tuning.ghost_ttl_seconds {
                purged.push(id);
            } else if let Some(existing) = state.vehicle_states.get_mut(&id) {
                existing.signal_lost = true;
                existing.speed = 0.0;
            }
        }
        for id in &purged {
            state.vehicle_states.remove(id);
            state.carry.remove(id);
            state.upcoming_stops.remove(id);
        }

        let snapshot = Snapshot {
            vehicles: state.vehicle_states.values().cloned().collect(),
            generated_at: now,
        };

        let travel_time_batch = std::mem::take(&mut state.travel_time_batch);
        drop(state);

        self.publish_snapshot(&snapshot).await;

        if let Err(e) = self.store.append_positions(&position_rows).await {
            error!(error = %e, "Failed to persist vehicle positions, continuing");
        }
        for obs in &travel_time_batch {
            if let Err(e) = self.store.record_travel_time(obs).await {
                error!(error = %e, "Failed to record travel time observation, continuing");
            }
        }
    }

    fn process_vehicle(
        &self,
        rv: &RawVehicle,
        now: DateTime<Utc>,
        catalog: &Catalog,
        state: &mut TrackingState,
        position_rows: &mut Vec<VehiclePositionRow>,
    ) {
        let route_id = catalog.route_num_to_id.get(&rv.route_num).copied();

        // Taken out of the map rather than borrowed in place: the rest of
        // this function also needs `&mut state` for diagnostics and the
        // travel-time batch, which an in-place `&mut CarryState` borrow
        // would alias.
        let mut carry = state.carry.remove(&rv.dev_id).unwrap_or_else(|| CarryState::new(now));

        let Some(route_id) = route_id else {
            carry.last_seen = now;
            carry.speed = rv.speed_kmh;
            state.carry.insert(rv.dev_id.clone(), carry);
            let baseline = VehicleState {
                id: rv.dev_id.clone(),
                board_num: rv.board_num.clone(),
                route: rv.route_num.clone(),
                route_id: None,
                lat: rv.lat,
                lon: rv.lon,
                speed: rv.speed_kmh,
                course: rv.course_deg,
                prev_stop: None,
                next_stops: Vec::new(),
                progress: None,
                signal_lost: false,
                timestamp: rv.timestamp,
            };
            position_rows.push(VehiclePositionRow {
                vehicle_id: rv.dev_id.clone(),
                route_id: None,
                lat: rv.lat,
                lon: rv.lon,
                speed: Some(rv.speed_kmh),
                course: Some(rv.course_deg),
                progress: None,
                timestamp: rv.timestamp,
            });
            state.vehicle_states.insert(rv.dev_id.clone(), baseline);
            return;
        };

        carry.push_position(rv.lat, rv.lon);
        let displacement_m = carry.displacement_m();

        let movement_bearing = if displacement_m > MOVEMENT_BEARING_DISPLACEMENT_M {
            let (olat, olon) = *carry.recent_positions.front().unwrap();
            let (nlat, nlon) = *carry.recent_positions.back().unwrap();
            Some(geometry::bearing_deg(LatLon::new(olat, olon), LatLon::new(nlat, nlon)))
        } else if rv.speed_kmh > MOVEMENT_SPEED_FLOOR_KMH {
            Some(rv.course_deg)
        } else {
            None
        };

        let preferred_direction = if carry.route_id == Some(route_id) {
            Some(carry.direction)
        } else {
            None
        };

        let detection = catalog.stop_detector.detect(
            route_id,
            rv.lat,
            rv.lon,
            movement_bearing,
            MAX_NEXT_STOPS_DETECTED,
            preferred_direction,
        );

        let mut vehicle_state = VehicleState {
            id: rv.dev_id.clone(),
            board_num: rv.board_num.clone(),
            route: rv.route_num.clone(),
            route_id: Some(route_id),
            lat: rv.lat,
            lon: rv.lon,
            speed: rv.speed_kmh,
            course: rv.course_deg,
            prev_stop: None,
            next_stops: Vec::new(),
            progress: None,
            signal_lost: false,
            timestamp: rv.timestamp,
        };

        let mut new_direction = carry.direction;

        if let Some(detection) = &detection {
            new_direction = detection.direction;
            state.upcoming_stops.insert(rv.dev_id.clone(), detection.next_stops.clone());
            vehicle_state.prev_stop = Some(PrevStop {
                stop_id: detection.prev_stop.stop_id,
                name: detection.prev_stop.name.clone(),
            });

            let exposed = &detection.next_stops[..detection.next_stops.len().min(MAX_NEXT_STOPS_EXPOSED)];
            let etas = eta::estimate(rv.lat, rv.lon, rv.speed_kmh, exposed, self.tuning.max_eta_seconds);
            vehicle_state.next_stops = exposed
                .iter()
                .zip(etas)
                .map(|(s, eta_seconds)| NextStop {
                    stop_id: s.stop_id,
                    name: s.name.clone(),
                    lat: s.lat,
                    lon: s.lon,
                    eta_seconds,
                })
                .collect();

            self.record_travel_time_if_passed(route_id, &detection.prev_stop, now, &mut carry, state);
        }

        let matched = catalog.route_matcher.match_point(
            route_id,
            rv.lat,
            rv.lon,
            movement_bearing.or(Some(rv.course_deg)),
        );

        match matched {
            Some(m) if m.distance_m <= self.tuning.max_apply_snap_distance_m => {
                let mut progress = m.progress;

                if let Some(detection) = &detection {
                    if let Some((lo, hi)) = self.section_bound(catalog, route_id, detection) {
                        if progress < lo - SECTION_BOUND_SLACK || progress > hi + SECTION_BOUND_SLACK {
                            state.push_diagnostic(ProjectionEvent {
                                ts: now,
                                kind: ProjectionEventKind::OutOfSection,
                                vehicle_id: rv.dev_id.clone(),
                                route_id: Some(route_id),
                                detail: format!("progress {progress:.4} outside [{lo:.4}, {hi:.4}]"),
                            });
                            progress = progress.clamp(lo, hi);
                        }
                    }
                }

                let guard_active = displacement_m > MONOTONIC_GUARD_DISPLACEMENT_M || rv.speed_kmh > MOVEMENT_SPEED_FLOOR_KMH;
                if guard_active {
                    if let Some(prev_progress) = carry.progress {
                        let violates = match new_direction {
                            0 => progress < prev_progress - MONOTONIC_SLACK,
                            _ => progress > prev_progress + MONOTONIC_SLACK,
                        };
                        if violates {
                            state.push_diagnostic(ProjectionEvent {
                                ts: now,
                                kind: ProjectionEventKind::BackwardProjection,
                                vehicle_id: rv.dev_id.clone(),
                                route_id: Some(route_id),
                                detail: format!("progress {progress:.4} vs prior {prev_progress:.4}, direction {new_direction}"),
                            });
                            progress = prev_progress;
                        }
                    }
                }

                if let Some((lat, lon)) = catalog.route_matcher.interpolate(route_id, progress) {
                    let snap_error_m =
                        geometry::haversine_distance_m(LatLon::new(rv.lat, rv.lon), LatLon::new(lat, lon));
                    if snap_error_m <= self.tuning.max_final_snap_error_m {
                        vehicle_state.progress = Some(progress);
                        vehicle_state.lat = lat;
                        vehicle_state.lon = lon;
                        carry.progress = Some(progress);
                    } else {
                        state.push_diagnostic(ProjectionEvent {
                            ts: now,
                            kind: ProjectionEventKind::SnapRejectedError,
                            vehicle_id: rv.dev_id.clone(),
                            route_id: Some(route_id),
                            detail: format!("snap error {snap_error_m:.1}m exceeds bound"),
                        });
                    }
                }
            }
            _ => {
                state.push_diagnostic(ProjectionEvent {
                    ts: now,
                    kind: ProjectionEventKind::SnapRejectedFar,
                    vehicle_id: rv.dev_id.clone(),
                    route_id: Some(route_id),
                    detail: "match distance exceeds apply-snap bound".to_string(),
                });
            }
        }

        carry.route_id = Some(route_id);
        carry.direction = new_direction;
        carry.speed = rv.speed_kmh;
        carry.last_seen = now;
        state.carry.insert(rv.dev_id.clone(), carry);

        position_rows.push(VehiclePositionRow {
            vehicle_id: rv.dev_id.clone(),
            route_id: Some(route_id),
            lat: rv.lat,
            lon: rv.lon,
            speed: Some(rv.speed_kmh),
            course: Some(rv.course_deg),
            progress: vehicle_state.progress,
            timestamp: rv.timestamp,
        });

        state.vehicle_states.insert(rv.dev_id.clone(), vehicle_state);
    }

    /// Progress bounds of the section the vehicle is in, if both the
    /// previous stop and first next-stop project onto the polyline within
    /// the section-bound radius.
    fn section_bound(
        &self,
        catalog: &Catalog,
        route_id: i64,
        detection: &crate::stop_detector::DetectionResult,
    ) -> Option<(f64, f64)> {
        let first_next = detection.next_stops.first()?;
        let prev_progress = self.stop_progress(catalog, route_id, &detection.prev_stop)?;
        let next_progress = self.stop_progress(catalog, route_id, first_next)?;
        Some((prev_progress.min(next_progress), prev_progress.max(next_progress)))
    }

    fn stop_progress(&self, catalog: &Catalog, route_id: i64, stop: &StopOnRoute) -> Option<f64> {
        let m = catalog.route_matcher.match_point(route_id, stop.lat, stop.lon, None)?;
        if m.distance_m <= self.tuning.section_bound_radius_m {
            Some(m.progress)
        } else {
            None
        }
    }

    fn record_travel_time_if_passed(
        &self,
        route_id: i64,
        prev_stop: &StopOnRoute,
        now: DateTime<Utc>,
        carry: &mut CarryState,
        state: &mut TrackingState,
    ) {
        let passed_changed = match &carry.last_passed {
            Some((stop_id, last_route_id, _)) => *stop_id != prev_stop.stop_id || *last_route_id != route_id,
            None => true,
        };
        if !passed_changed {
            return;
        }

        if let Some((from_stop_id, last_route_id, last_time)) = carry.last_passed {
            if last_route_id == route_id {
                let elapsed = (now - last_time).num_seconds() as f64;
                if elapsed > TRAVEL_TIME_MIN_SECONDS && elapsed < TRAVEL_TIME_MAX_SECONDS {
                    if let Some((day_type, hour)) = local_day_type_and_hour(now) {
                        state.travel_time_batch.push(TravelObservation {
                            route_id,
                            from_stop_id,
                            to_stop_id: prev_stop.stop_id,
                            day_type,
                            hour,
                            seconds: elapsed,
                        });
                    }
                }
            }
        }

        carry.last_passed = Some((prev_stop.stop_id, route_id, now));
    }

    async fn publish_snapshot(&self, snapshot: &Snapshot) {
        match serde_json::to_vec(&ServerMessage::Update { vehicles: &snapshot.vehicles }) {
            Ok(bytes) => self.broadcaster.publish(Bytes::from(bytes)).await,
            Err(e) => error!(error = %e, "Failed to serialize snapshot for publish"),
        }
    }

    pub async fn current_snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        Snapshot {
            vehicles: state.vehicle_states.values().cloned().collect(),
            generated_at: Utc::now(),
        }
    }

    /// The initial frame a new WebSocket subscriber receives, tagged
    /// distinctly from the `update` frames that follow it.
    pub async fn snapshot_message_bytes(&self) -> Option<Bytes> {
        let snapshot = self.current_snapshot().await;
        match serde_json::to_vec(&ServerMessage::Snapshot { vehicles: &snapshot.vehicles }) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                error!(error = %e, "Failed to serialize initial snapshot");
                None
            }
        }
    }

    pub async fn vehicle_by_id(&self, id: &str) -> Option<VehicleState> {
        self.state.read().await.vehicle_states.get(id).cloned()
    }

    /// Upcoming arrivals for a stop: vehicles whose retained upcoming-stops
    /// list contains it, ETA computed on the prefix up to and including
    /// that stop, sorted ascending, capped, ghosts excluded.
    pub async fn stop_arrivals(&self, stop_id: i64, route_id_filter: Option<i64>) -> StopArrivals {
        let state = self.state.read().await;
        let mut arrivals = Vec::new();

        for (dev_id, stops) in state.upcoming_stops.iter() {
            let Some(vehicle) = state.vehicle_states.get(dev_id) else { continue };
            if vehicle.signal_lost {
                continue;
            }
            if let Some(filter) = route_id_filter {
                if vehicle.route_id != Some(filter) {
                    continue;
                }
            }
            let Some(idx) = stops.iter().position(|s| s.stop_id == stop_id) else { continue };
            let prefix = &stops[..=idx];
            let etas = eta::estimate(vehicle.lat, vehicle.lon, vehicle.speed, prefix, self.tuning.max_eta_seconds);
            if let Some(eta_seconds) = etas.last().copied().flatten() {
                arrivals.push(StopArrival {
                    vehicle_id: dev_id.clone(),
                    route: vehicle.route.clone(),
                    eta_seconds: Some(eta_seconds),
                });
            }
        }

        arrivals.sort_by_key(|a| a.eta_seconds.unwrap_or(i64::MAX));
        arrivals.truncate(MAX_STOP_ARRIVALS);
        StopArrivals { stop_id, arrivals }
    }

    pub async fn diagnostics_report(&self) -> DiagnosticsReport {
        let catalog = self.catalog.read().await;
        let state = self.state.read().await;

        let mut per_route_vehicle_counts: HashMap<String, usize> = HashMap::new();
        let mut matched = 0usize;
        let mut unmatched = 0usize;
        for v in state.vehicle_states.values() {
            if let Some(route_id) = v.route_id {
                *per_route_vehicle_counts.entry(route_id.to_string()).or_default() += 1;
            }
            if v.progress.is_some() {
                matched += 1;
            } else {
                unmatched += 1;
            }
        }

        let mut event_counts_by_kind: HashMap<String, usize> = HashMap::new();
        for event in &state.diagnostics {
            *event_counts_by_kind.entry(format!("{:?}", event.kind)).or_default() += 1;
        }

        let mut route_stop_tables: HashMap<String, Vec<Vec<StopOnRoute>>> = HashMap::new();
        for &route_id in catalog.routes.keys() {
            let mut directions = Vec::new();
            for direction in [0u8, 1u8] {
                if let Some(stops) = catalog.stop_detector.stops_for(route_id, direction) {
                    directions.push(stops.to_vec());
                }
            }
            route_stop_tables.insert(route_id.to_string(), directions);
        }

        DiagnosticsReport {
            per_route_vehicle_counts,
            matched_vehicles: matched,
            unmatched_vehicles: unmatched,
            recent_events: state.diagnostics.iter().cloned().collect(),
            event_counts_by_kind,
            route_stop_tables,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    Snapshot { vehicles: &'a [VehicleState] },
    Update { vehicles: &'a [VehicleState] },
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DiagnosticsReport {
    pub per_route_vehicle_counts: HashMap<String, usize>,
    pub matched_vehicles: usize,
    pub unmatched_vehicles: usize,
    pub recent_events: Vec<ProjectionEvent>,
    pub event_counts_by_kind: HashMap<String, usize>,
    /// Per-route, per-direction stop sequences with cumulative distances,
    /// keyed by route id (as a string, for JSON object compatibility).
    pub route_stop_tables: HashMap<String, Vec<Vec<StopOnRoute>>>,
}
