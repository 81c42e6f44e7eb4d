pub mod diagnostics;
pub mod error;
pub mod health;
pub mod stops;
pub mod vehicles;
pub mod ws;

pub use error::ErrorResponse;

use std::sync::Arc;

use utoipa::OpenApi;

use crate::tracker::{DiagnosticsReport, Tracker};

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<Tracker>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        vehicles::list_vehicles,
        vehicles::get_vehicle,
        stops::get_arrivals,
        diagnostics::get_diagnostics,
        health::get_health,
    ),
    components(schemas(
        crate::models::VehicleState,
        crate::models::NextStop,
        crate::models::PrevStop,
        crate::models::Snapshot,
        crate::models::StopArrival,
        crate::models::StopArrivals,
        crate::models::ProjectionEvent,
        crate::models::ProjectionEventKind,
        DiagnosticsReport,
        health::HealthResponse,
        ErrorResponse,
    )),
    tags(
        (name = "vehicles", description = "Live vehicle tracking"),
        (name = "stops", description = "Stop arrival predictions"),
        (name = "diagnostics", description = "Tracking pipeline diagnostics and health"),
    )
)]
pub struct ApiDoc;
