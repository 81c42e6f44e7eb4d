mod api;
mod broadcaster;
mod config;
mod eta;
mod geometry;
mod geometry_provider;
mod models;
mod persistence;
mod route_matcher;
mod stop_detector;
mod tracker;
mod upstream;

use std::sync::Arc;

use axum::http::{header, Method};
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;
use utoipa_swagger_ui::SwaggerUi;

use api::{ApiDoc, AppState};
use broadcaster::Broadcaster;
use config::Config;
use geometry_provider::GeometryProvider;
use persistence::Store;
use tracker::Tracker;
use upstream::UpstreamClient;

const CONFIG_PATH: &str = "config.yaml";
const OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";
const OSRM_BASE_URL: &str = "https://router.project-osrm.org";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tram_tracker=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tram tracker");

    let config = Config::load(CONFIG_PATH)?;

    let store = Store::connect(&config.database_url).await?;
    let upstream = UpstreamClient::new(config.upstream_base_url.clone())?;
    let geometry_provider = GeometryProvider::new(OVERPASS_URL, OSRM_BASE_URL)?;
    let broadcaster = Broadcaster::new();

    let tracker = Arc::new(Tracker::new(upstream, store, broadcaster, geometry_provider, config.tuning));

    let scheduler_tracker = tracker.clone();
    let poll_interval_seconds = config.poll_interval_seconds;
    let route_refresh_hours = config.route_refresh_hours;
    tokio::spawn(async move {
        scheduler_tracker.start(poll_interval_seconds, route_refresh_hours).await;
    });

    let state = AppState { tracker };

    let cors = if config.cors_permissive {
        CorsLayer::new().allow_origin(Any).allow_methods([Method::GET]).allow_headers([header::CONTENT_TYPE])
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods([Method::GET]).allow_headers([header::CONTENT_TYPE])
    };

    let (app, api_doc) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(api::vehicles::list_vehicles))
        .routes(routes!(api::vehicles::get_vehicle))
        .routes(routes!(api::stops::get_arrivals))
        .routes(routes!(api::diagnostics::get_diagnostics))
        .routes(routes!(api::health::get_health))
        .with_state(state.clone())
        .split_for_parts();

    let app = app
        .route("/ws", get(api::ws::ws_handler).with_state(state))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", api_doc))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, app).await?;

    Ok(())
}
