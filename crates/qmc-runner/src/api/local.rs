use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tracing::info;

use super::{get_health, with_layers, ApiError, ApiState};
use crate::error::RunnerError;
use crate::psk::{RotationBody, RotationRequest};

pub fn create_local_router(state: ApiState) -> Router {
    with_layers(
        Router::new()
            .route("/psk", post(post_psk))
            .route("/restart", get(get_restart))
            .route("/health", get(get_health)),
    )
    .with_state(state)
}

// POST /psk {"is_local_peer": bool, "peer_id": string, "block_num": int}
async fn post_psk(State(state): State<ApiState>, body: Bytes) -> Response {
    let request = serde_json::from_slice::<RotationBody>(&body)
        .map_err(|e| RunnerError::BadRequest(e.to_string()))
        .and_then(RotationRequest::try_from);

    match request {
        Ok(request) => {
            info!("Rotation requested for block {}", request.block_number);
            state.coordinator.trigger(request);
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

// GET /restart
async fn get_restart(State(state): State<ApiState>) -> Response {
    match state.coordinator.restart_node().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}
