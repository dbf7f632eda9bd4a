//! REST handlers for the synchronous decision API and operational
//! endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use sendflow_core::error::SendFlowError;
use sendflow_core::types::{AppliedWeight, DecisionRequest, TimingDecision};
use sendflow_decision::TimingDecisionEngine;
use sendflow_identity::IdentityResolver;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<IdentityResolver>,
    pub engine: Arc<TimingDecisionEngine>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Serialize, Debug)]
pub struct DecisionResponse {
    #[serde(flatten)]
    pub decision: TimingDecision,
    pub debug: DecisionDebug,
}

#[derive(Serialize, Debug)]
pub struct DecisionDebug {
    pub applied_weights: Vec<AppliedWeight>,
    pub base_curve_peak_minute: u32,
    pub suppressed: bool,
    pub resolution_confidence: f64,
}

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// POST /v1/decision — resolve the identifier set and compute a trigger
/// instant inside the requested window.
pub async fn handle_decision(
    State(state): State<AppState>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let resolution = state
        .resolver
        .resolve(&request.identifiers)
        .await
        .map_err(reject)?;

    let decision = state
        .engine
        .decide(
            &resolution.universal_id,
            request.send_after,
            request.send_before,
            request.latency_estimate_seconds,
        )
        .await
        .map_err(reject)?;

    let debug = DecisionDebug {
        applied_weights: decision.applied_weights.clone(),
        base_curve_peak_minute: decision.base_curve_peak_minute,
        suppressed: decision.suppressed,
        resolution_confidence: resolution.confidence,
    };
    Ok(Json(DecisionResponse { decision, debug }))
}

fn reject(e: SendFlowError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        SendFlowError::InvalidInput(_) | SendFlowError::Serialization(_) => StatusCode::BAD_REQUEST,
        SendFlowError::WindowExpired(_) | SendFlowError::IdentityUnresolved(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        SendFlowError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SendFlowError::BackendUnavailable(_)
        | SendFlowError::CurveUnavailable(_)
        | SendFlowError::PredictorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "decision request failed");
    }
    metrics::counter!("api.errors").increment(1);
    (
        status,
        Json(ErrorResponse {
            code: e.code().to_string(),
            message: e.to_string(),
        }),
    )
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

/// GET /health — health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready — readiness probe.
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live — liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
