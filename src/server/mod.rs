//! Control and read HTTP surface

mod collector_api;
mod limits_api;
mod stats_api;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use chrono::FixedOffset;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::database::Database;
use crate::error::Result;
use crate::scheduler::Coordinator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub coordinator: Arc<Coordinator>,
    pub offset: FixedOffset,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Collector control surface
        .route("/api/collector/health", get(collector_api::health))
        .route("/api/collector/trigger", post(collector_api::trigger))
        .route(
            "/api/collector/reset/:config_id",
            post(collector_api::reset),
        )
        // Read-only usage projections
        .route("/api/usage/latest", get(stats_api::latest))
        .route("/api/usage/daily", get(stats_api::daily))
        .route("/api/usage/models", get(stats_api::models))
        .route("/api/usage/hourly", get(stats_api::hourly))
        .route("/api/usage/endpoints", get(stats_api::endpoints))
        // Rate limit configuration
        .route(
            "/api/limits",
            get(limits_api::list).post(limits_api::create),
        )
        .route(
            "/api/limits/:id",
            put(limits_api::update).delete(limits_api::delete),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the HTTP surface until the shutdown token fires, then drain
pub async fn run(state: AppState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("HTTP surface listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
