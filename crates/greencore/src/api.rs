//! HTTP API for the controller, health checks and Prometheus metrics

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use greencore_lib::{
    health::ComponentStatus, ControllerError, CoreController, CoreId, CoreState, SleepStatus,
    UsageSnapshot,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Body returned for every server-side failure
pub const OPAQUE_ERROR: &str = "Something went wrong. Check admin logs.";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: CoreController,
}

impl AppState {
    pub fn new(controller: CoreController) -> Self {
        Self { controller }
    }
}

/// API error type that implements `IntoResponse`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Controller(ControllerError::UnknownCore(_)) => StatusCode::NOT_FOUND,
            Self::Controller(ControllerError::PinnedCore(_)) => StatusCode::CONFLICT,
            Self::Controller(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() {
            error!(error = %self, "Request failed");
            OPAQUE_ERROR.to_string()
        } else {
            self.to_string()
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

fn parse_core_id(raw: &str) -> Result<CoreId, ApiError> {
    raw.parse::<CoreId>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub core: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchResponse {
    pub is_awake: bool,
}

/// Start the monitoring loop; a no-op when it already runs
async fn begin(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.controller.begin() {
        info!("Monitoring started via API");
    }
    StatusCode::ACCEPTED
}

/// Fleet status, or one core's status with `?core=<host>:<idx>`
async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<SleepStatus>, ApiError> {
    let core = query.core.as_deref().map(parse_core_id).transpose()?;
    let status = state.controller.is_asleep(core.as_ref())?;
    Ok(Json(status))
}

async fn sleeping(State(state): State<Arc<AppState>>) -> Json<Vec<CoreId>> {
    Json(state.controller.sleeping_core_ids())
}

async fn switch(
    State(state): State<Arc<AppState>>,
    Path(core_id): Path<String>,
) -> Result<(StatusCode, Json<SwitchResponse>), ApiError> {
    let id = parse_core_id(&core_id)?;
    let next = state.controller.switch(&id).await?;
    Ok((
        StatusCode::CREATED,
        Json(SwitchResponse {
            is_awake: next == CoreState::Awake,
        }),
    ))
}

async fn usage(State(state): State<Arc<AppState>>) -> Result<Json<UsageSnapshot>, ApiError> {
    let snapshot = state.controller.core_usage().await?;
    Ok(Json(snapshot.as_ref().clone()))
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.controller.health().health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.controller.health().readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    ))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/begin", post(begin))
        .route("/status", get(status))
        .route("/sleeping", get(sleeping))
        .route("/switch/:core_id", post(switch))
        .route("/usage", get(usage))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind the API listener
pub async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "API listener bound");
    Ok(listener)
}

/// Serve the API on a bound listener until `shutdown` resolves
///
/// The service reports ready only while this is running.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let health = state.controller.health().clone();
    let app = create_router(state);

    info!("Starting API server");
    health.set_ready(true).await;

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    health.set_ready(false).await;
    result?;
    Ok(())
}
