//! Error types for the runner.

use qmc_crypto::codec::CodecError;
use qmc_crypto::identity::IdentityError;
use qmc_crypto::onetimepad::CipherError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::qkd::QkdError;
use crate::store::StoreError;
use crate::supervisor::SupervisorError;

/// Errors that can occur while exchanging, rotating or serving keys.
///
/// "No valid key yet" is not an error: exchange operations return
/// `Ok(None)` for it and callers retry.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Malformed control request; nothing was changed
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Requesting peer has no configuration entry
    #[error("peer {0} is not configured")]
    PeerMisconfigured(String),

    /// No key and signature are currently stored
    #[error("pre shared key not found")]
    PskNotFound,

    /// No peers to exchange keys with
    #[error("no peers configured")]
    NoPeers,

    /// A peer answered with an error status or an unreadable body
    #[error("peer {peer_id} request failed: {reason}")]
    PeerRequest { peer_id: String, reason: String },

    /// Liveness RPC failed or answered with an error
    #[error("node RPC error: {0}")]
    NodeRpc(String),

    /// Retry ceiling reached without a result
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// Node key does not belong to the peer it has to sign for
    #[error("node key belongs to {found}, expected {expected}")]
    NodeKeyMismatch { expected: String, found: String },

    /// A rotation for a newer block was requested first
    #[error("rotation for block {block} superseded by block {newer}")]
    Superseded { block: u64, newer: u64 },

    /// Shutdown requested while waiting
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Qkd(#[from] QkdError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for RunnerError {
    fn from(err: reqwest::Error) -> Self {
        RunnerError::Http(err.to_string())
    }
}
