use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use super::{get_health, with_layers, ApiError, ApiState};
use crate::error::RunnerError;
use crate::exchange::{encrypt_for_peer, EncryptedPskResponse};

pub fn create_peer_router(state: ApiState) -> Router {
    with_layers(
        Router::new()
            .route("/peer/:peer_id/psk", get(get_psk))
            .route("/health", get(get_health)),
    )
    .with_state(state)
}

// GET /peer/{peer_id}/psk
async fn get_psk(
    State(state): State<ApiState>,
    Path(peer_id): Path<String>,
) -> Result<Json<EncryptedPskResponse>, ApiError> {
    info!("Fetching PSK for peer {}...", peer_id);

    let peer = state
        .ctx
        .exchange
        .peers()
        .get(&peer_id)
        .ok_or_else(|| RunnerError::PeerMisconfigured(peer_id.clone()))?;

    let (psk, signature) = state
        .ctx
        .store
        .load_current()
        .await
        .map_err(RunnerError::from)?
        .ok_or(RunnerError::PskNotFound)?;

    let qkd_key = peer.qkd.get_enc_key().await.map_err(RunnerError::from)?;
    let key = encrypt_for_peer(&psk, &qkd_key)?;

    Ok(Json(EncryptedPskResponse {
        key,
        key_id: qkd_key.key_id,
        signature,
    }))
}
