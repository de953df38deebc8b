//! HTTP endpoints.
//!
//! The local router is the trusted control surface used by the node; the
//! peer router is exposed to other runners.

use std::any::Any;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::context::AppContext;
use crate::error::RunnerError;
use crate::rotation::RotationCoordinator;

pub mod local;
pub mod peer;

pub use local::create_local_router;
pub use peer::create_peer_router;

#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<AppContext>,
    pub coordinator: Arc<RotationCoordinator>,
}

impl ApiState {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        let coordinator = Arc::new(RotationCoordinator::new(Arc::clone(&ctx)));
        Self { ctx, coordinator }
    }
}

/// An error answered as `{"message": ...}`. Internal details only go to
/// the log.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal server error",
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        let (status, message) = match &err {
            RunnerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad request"),
            RunnerError::PeerMisconfigured(_) => (StatusCode::NOT_FOUND, "Peer is not configured"),
            RunnerError::PskNotFound => (StatusCode::NOT_FOUND, "Pre shared key not found"),
            RunnerError::Qkd(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Couldn't get key from QKD"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        } else {
            warn!("Request rejected: {}", err);
        }
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

pub async fn get_health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Tracing, and a plain 500 for a handler that panics.
fn with_layers(router: Router<ApiState>) -> Router<ApiState> {
    router
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
}

fn handle_panic(_: Box<dyn Any + Send + 'static>) -> Response {
    error!("Request handler panicked");
    ApiError::internal().into_response()
}
