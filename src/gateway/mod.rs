//! HTTP gateway
//!
//! ```text
//! GET  /          liveness, answers "pong"
//! GET  /language  language registry
//! GET  /node      containers known to the runtime
//! POST /run       execute code, stream interleaved output
//! ```
//!
//! `/run` answers with a JSON error envelope when the request fails before
//! any output exists. Once output starts streaming the status is already
//! 200, so a later failure aborts the body instead.

mod handlers;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::error::Error;
use crate::orchestrator::Orchestrator;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Output chunks buffered per streaming response
    pub output_buffer: usize,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        AppState {
            orchestrator,
            output_buffer: 32,
        }
    }

    pub fn with_output_buffer(mut self, chunks: usize) -> Self {
        self.output_buffer = chunks.max(1);
        self
    }
}

/// Error response carrying the safe envelope
pub struct AppError(pub Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            warn!("Rejected request: {}", self.0);
            StatusCode::BAD_REQUEST
        } else {
            error!("Request failed: {}", self.0);
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(self.0.envelope())).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::ping))
        .route("/language", get(handlers::list_languages))
        .route("/node", get(handlers::list_containers))
        .route("/run", post(handlers::run))
        .with_state(state)
        .layer(CorsLayer::permissive())
}
