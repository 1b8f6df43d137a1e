//! Admin HTTP endpoints for driving profiling sessions.
//!
//! - `POST /initialize` starts a session with the next marker id and the
//!   configured benchmark duration
//! - `POST /bench/start?secs=N&id=X` starts a session with explicit values
//! - `POST /bench/stop` asks the running session to finalize
//! - `GET /bench/status` reports the coordinator state

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::capture::ProfilingBackend;
use crate::session::{SessionCoordinator, SessionError, SessionHandle, SessionState};

/// Shared state for admin handlers
pub struct AdminState<B> {
    pub coordinator: SessionCoordinator<B>,
    /// Used when a start request doesn't give one
    pub benchmark: Duration,
}

impl<B> Clone for AdminState<B> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            benchmark: self.benchmark,
        }
    }
}

pub fn router<B: ProfilingBackend>(state: AdminState<B>) -> Router {
    Router::new()
        .route("/initialize", post(initialize::<B>))
        .route("/bench/start", post(start_session::<B>))
        .route("/bench/stop", post(stop_session::<B>))
        .route("/bench/status", get(status::<B>))
        .route("/health", get(health))
        .with_state(state)
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            SessionError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::MarkerNextId(_) | SessionError::MarkerStart { .. } => {
                StatusCode::BAD_GATEWAY
            }
            SessionError::Capture { .. }
            | SessionError::Artifact { .. }
            | SessionError::Panicked { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

fn started(handle: &SessionHandle, benchmark: Duration) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "id": handle.id(),
        "benchmark_secs": benchmark.as_secs(),
    }))
}

/// Start a session with the marker's next id
async fn initialize<B: ProfilingBackend>(
    State(state): State<AdminState<B>>,
) -> Result<Json<serde_json::Value>, SessionError> {
    let handle = state.coordinator.start_next(state.benchmark).await?;
    Ok(started(&handle, state.benchmark))
}

#[derive(Debug, Deserialize)]
struct StartParams {
    secs: Option<u64>,
    id: Option<String>,
}

async fn start_session<B: ProfilingBackend>(
    State(state): State<AdminState<B>>,
    Query(params): Query<StartParams>,
) -> Result<Json<serde_json::Value>, SessionError> {
    let benchmark = params
        .secs
        .map(Duration::from_secs)
        .unwrap_or(state.benchmark);

    let handle = match params.id {
        Some(id) => state.coordinator.start(id, benchmark).await?,
        None => state.coordinator.start_next(benchmark).await?,
    };
    Ok(started(&handle, benchmark))
}

async fn stop_session<B: ProfilingBackend>(State(state): State<AdminState<B>>) -> impl IntoResponse {
    let requested = state.coordinator.request_stop();
    Json(serde_json::json!({ "requested": requested }))
}

async fn status<B: ProfilingBackend>(State(state): State<AdminState<B>>) -> Json<SessionState> {
    Json(state.coordinator.state())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
