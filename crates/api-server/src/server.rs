//! API server — assembles the HTTP router and the Prometheus metrics
//! exporter.

use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use sendflow_core::config::AppConfig;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the HTTP router with all routes and middleware layers.
    pub fn into_router(self) -> Router {
        let decision_routes = Router::new()
            .route("/v1/decision", post(rest::handle_decision))
            .with_state(self.state.clone());

        let ops_routes = Router::new()
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            .with_state(self.state);

        Router::new()
            .merge(decision_routes)
            .merge(ops_routes)
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Start the metrics exporter on its dedicated port. Must be called
    /// from within the Tokio runtime.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "metrics exporter started");
        Ok(())
    }
}
