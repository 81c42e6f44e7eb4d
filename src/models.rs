//! Domain types shared between the tracking pipeline and the HTTP/WS API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A stop as it sits on a route, with its precomputed along-route distance.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StopOnRoute {
    pub stop_id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub order: i32,
    pub direction: u8,
    pub cumulative_distance_m: f64,
}

/// A single route's polyline and metadata, as owned by the tracker's
/// in-memory catalog.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: i64,
    pub number: String,
    pub name: String,
    pub points: Vec<(f64, f64)>,
    pub total_length_m: f64,
}

/// An upcoming stop with its estimated arrival, as exposed on a
/// [`VehicleState`].
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NextStop {
    pub stop_id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub eta_seconds: Option<i64>,
}

/// The previously-passed stop on a vehicle's current leg.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PrevStop {
    pub stop_id: i64,
    pub name: String,
}

/// The enriched, publishable state of a single tracked vehicle.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VehicleState {
    pub id: String,
    pub board_num: String,
    pub route: String,
    pub route_id: Option<i64>,
    pub lat: f64,
    pub lon: f64,
    pub speed: f64,
    pub course: f64,
    pub prev_stop: Option<PrevStop>,
    pub next_stops: Vec<NextStop>,
    pub progress: Option<f64>,
    pub signal_lost: bool,
    pub timestamp: DateTime<Utc>,
}

/// The full set of currently-tracked vehicles, live and ghosted, as
/// published by the broadcaster and served by the snapshot endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Snapshot {
    pub vehicles: Vec<VehicleState>,
    pub generated_at: DateTime<Utc>,
}

/// A single arrival prediction for a stop-arrivals query.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StopArrival {
    pub vehicle_id: String,
    pub route: String,
    pub eta_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StopArrivals {
    pub stop_id: i64,
    pub arrivals: Vec<StopArrival>,
}

/// Day-of-week bucket used to key travel-time segment observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DayType {
    Weekday,
    Saturday,
    Sunday,
}

impl DayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayType::Weekday => "weekday",
            DayType::Saturday => "saturday",
            DayType::Sunday => "sunday",
        }
    }

    pub fn from_chrono_weekday(weekday: chrono::Weekday) -> Self {
        use chrono::Weekday::*;
        match weekday {
            Sat => DayType::Saturday,
            Sun => DayType::Sunday,
            _ => DayType::Weekday,
        }
    }
}

/// A single observed stop-to-stop travel time, batched by the tracker
/// between flushes to persistence.
#[derive(Debug, Clone)]
pub struct TravelObservation {
    pub route_id: i64,
    pub from_stop_id: i64,
    pub to_stop_id: i64,
    pub day_type: DayType,
    pub hour: u8,
    pub seconds: f64,
}

/// A diagnostic event kind emitted by the tracking pipeline when a
/// projection is clamped or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionEventKind {
    OutOfSection,
    BackwardProjection,
    SnapRejectedFar,
    SnapRejectedError,
    UnresolvedStop,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProjectionEvent {
    pub ts: DateTime<Utc>,
    pub kind: ProjectionEventKind,
    pub vehicle_id: String,
    pub route_id: Option<i64>,
    pub detail: String,
}
