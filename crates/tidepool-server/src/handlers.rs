//! HTTP surface: one per-session endpoint where POST carries a command
//! batch and returns the response batch, and a bodyless GET delivers the
//! out-of-band interrupt.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use tidepool_proto::CommandCodec;

use crate::session::{SessionError, SessionRegistry};

pub struct AppState {
    pub registry: SessionRegistry,
    pub codec: Arc<dyn CommandCodec>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/sessions/:session_id",
            post(process_commands).get(interrupt_session),
        )
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::Busy => StatusCode::CONFLICT,
            SessionError::Controller(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::NoContext | SessionError::Unhandled(_) | SessionError::Model(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn process_commands(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let commands = state.codec.decode(&body).map_err(|err| {
        debug!(session_id = %session_id, error = %err, "rejecting undecodable batch");
        ApiError::bad_request(err.to_string())
    })?;

    let session = state.registry.session(session_id);
    let outcome = session.process_batch(commands).await.map_err(|err| {
        debug!(session_id = %session_id, error = %err, "batch failed");
        ApiError::from(err)
    })?;
    if outcome.destroyed {
        state.registry.remove(session_id);
    }

    let bytes = state.codec.encode(&outcome.commands).map_err(|err| {
        warn!(session_id = %session_id, error = %err, "failed to encode response batch");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    })?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, state.codec.content_type())],
        bytes,
    )
        .into_response())
}

/// The interrupt deliberately skips the session's active guard: its whole
/// point is to release a worker that is currently holding it.
async fn interrupt_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> StatusCode {
    counter!("tidepool_interrupts_received_total", 1);
    if let Some(session) = state.registry.get(session_id) {
        session.interrupt();
    } else {
        debug!(session_id = %session_id, "interrupt for unknown session");
    }
    StatusCode::NO_CONTENT
}

async fn healthz() -> &'static str {
    "ok"
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
