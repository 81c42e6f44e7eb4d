//! Vehicle snapshot and single-vehicle lookup endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use utoipa::IntoParams;

use crate::api::{AppState, ErrorResponse};
use crate::models::{Snapshot, VehicleState};

#[derive(Debug, Deserialize, IntoParams)]
pub struct VehicleQuery {
    /// Restrict the snapshot to vehicles on this route number.
    pub route: Option<String>,
}

/// Current snapshot of all tracked vehicles, live and ghosted.
#[utoipa::path(
    get,
    path = "/api/vehicles",
    params(VehicleQuery),
    responses(
        (status = 200, description = "Current vehicle snapshot", body = Snapshot),
    ),
    tag = "vehicles"
)]
pub async fn list_vehicles(State(state): State<AppState>, Query(query): Query<VehicleQuery>) -> Json<Snapshot> {
    let mut snapshot = state.tracker.current_snapshot().await;
    if let Some(route) = query.route {
        snapshot.vehicles.retain(|v| v.route == route);
    }
    Json(snapshot)
}

/// A single vehicle's current state.
#[utoipa::path(
    get,
    path = "/api/vehicles/{id}",
    params(
        ("id" = String, Path, description = "Vehicle device id")
    ),
    responses(
        (status = 200, description = "Vehicle state", body = VehicleState),
        (status = 404, description = "Vehicle not found", body = ErrorResponse),
    ),
    tag = "vehicles"
)]
pub async fn get_vehicle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VehicleState>, (StatusCode, Json<ErrorResponse>)> {
    state
        .tracker
        .vehicle_by_id(&id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, Json(ErrorResponse { error: "vehicle not found".to_string() })))
}
