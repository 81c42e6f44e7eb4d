//! Upcoming-arrivals endpoint for a single stop.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use utoipa::IntoParams;

use crate::api::AppState;
use crate::models::StopArrivals;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ArrivalsQuery {
    /// Restrict arrivals to vehicles on this route id.
    pub route_id: Option<i64>,
}

/// Upcoming vehicle arrivals for a stop, soonest first.
#[utoipa::path(
    get,
    path = "/api/stops/{id}/arrivals",
    params(
        ("id" = i64, Path, description = "Stop id"),
        ArrivalsQuery,
    ),
    responses(
        (status = 200, description = "Upcoming arrivals for the stop", body = StopArrivals),
    ),
    tag = "stops"
)]
pub async fn get_arrivals(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ArrivalsQuery>,
) -> Json<StopArrivals> {
    Json(state.tracker.stop_arrivals(id, query.route_id).await)
}
