//! Tracking pipeline diagnostics endpoint.

use axum::extract::State;
use axum::Json;

use crate::api::AppState;
use crate::tracker::DiagnosticsReport;

/// Per-route resolution counts, matched/unmatched vehicle counts, and the
/// recent clamping/rejection diagnostics ring buffer.
#[utoipa::path(
    get,
    path = "/api/diagnostics",
    responses(
        (status = 200, description = "Tracking pipeline diagnostics", body = DiagnosticsReport),
    ),
    tag = "diagnostics"
)]
pub async fn get_diagnostics(State(state): State<AppState>) -> Json<DiagnosticsReport> {
    Json(state.tracker.diagnostics_report().await)
}
