#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use qmc_runner::config::{PeerConfig, QkdConfig, RetryConfig, RunnerConfig, SignatureRetention};
use qmc_runner::supervisor::LivenessProbe;
use qmc_runner::{AppContext, RunnerError};
use serde_json::{json, Value};

pub const ALICE: &str = "12D3KooWKzWKFojk7A1Hw23dpiQRbLs6HrXFf4EGLsN4oZ1WsWCc";
pub const ALICE_KEY: &str = "df432c8e967aa21fdd287d3ea61fa85640a8309577f65b4ea78d49d514661654";
pub const BOB: &str = "12D3KooWQ4b1BHDUUW8VbWSCrS4RcdtRL6C8VEVb9Ye59uRp63Y1";

/// Both ends of a simulated QKD link: keys handed out by `enc_keys` can be
/// fetched again by id from `dec_keys`.
#[derive(Clone, Default)]
pub struct KeyVault {
    keys: Arc<Mutex<HashMap<String, String>>>,
    next_id: Arc<AtomicU64>,
}

async fn enc_keys(State(vault): State<KeyVault>) -> Json<Value> {
    let id = format!("key-{}", vault.next_id.fetch_add(1, Ordering::SeqCst));
    let key = qmc_crypto::codec::hex_to_base64(&hex::encode(rand::random::<[u8; 32]>())).unwrap();
    vault.keys.lock().unwrap().insert(id.clone(), key.clone());
    Json(json!({"keys": [{"key_ID": id, "key": key}]}))
}

async fn dec_keys(
    State(vault): State<KeyVault>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let id = query.get("key_ID").cloned().unwrap_or_default();
    let key = vault.keys.lock().unwrap().get(&id).cloned().unwrap_or_default();
    Json(json!({"keys": [{"key_ID": id, "key": key}]}))
}

pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Start a mock ETSI 014 key manager and return its base URL.
pub async fn start_qkd() -> String {
    let router = Router::new()
        .route("/api/v1/keys/link/enc_keys", get(enc_keys))
        .route("/api/v1/keys/link/dec_keys", get(dec_keys))
        .with_state(KeyVault::default());
    format!("{}/api/v1/keys/link", serve(router).await)
}

pub struct StaticProbe;

#[async_trait]
impl LivenessProbe for StaticProbe {
    async fn connected_peers(&self) -> Result<usize, RunnerError> {
        Ok(1)
    }
}

pub fn config(dir: &Path, local_peer_id: &str) -> RunnerConfig {
    RunnerConfig {
        local_peer_id: local_peer_id.to_string(),
        psk_file_path: dir.join("psk"),
        psk_sig_file_path: dir.join("psk_sig"),
        node_key_file_path: dir.join(".node_key"),
        node_logs_path: dir.join("node.log"),
        key_rotation_time_secs: 0,
        restart_settle_secs: 0,
        request_timeout_secs: 5,
        liveness_interval_secs: 3600,
        signature_retention: SignatureRetention::Keep,
        retry: RetryConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            max_attempts: Some(3),
        },
        ..Default::default()
    }
}

pub fn add_peer(config: &mut RunnerConfig, peer_id: &str, server_addr: &str, qkd_url: &str) {
    config.peers.insert(
        peer_id.to_string(),
        PeerConfig {
            server_addr: server_addr.to_string(),
            qkd: QkdConfig::etsi014(qkd_url),
        },
    );
}

pub fn context(config: RunnerConfig, node_command: &[&str]) -> Arc<AppContext> {
    let command = node_command.iter().map(|s| s.to_string()).collect();
    AppContext::with_probe(config, command, Arc::new(StaticProbe)).unwrap()
}
