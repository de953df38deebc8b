//! Peer PSK exchange and validation.
//!
//! A node that does not sign the current round asks every configured peer
//! for the PSK. Each peer answers with the value encrypted under a fresh
//! QKD key; the requester fetches the matching key from its own side of
//! the QKD link and removes the pad. Candidates are then accepted either
//! by unanimous agreement (bootstrap) or by a signature from the round's
//! known signer.

use qmc_crypto::codec::canonical_psk_hex;
use qmc_crypto::onetimepad;
use qmc_crypto::utils::psk_values_equal;
use qmc_crypto::PeerIdentity;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::peers::{PeerDirectory, PeerEndpoint};
use crate::psk::Psk;
use crate::qkd::QkdKey;
use crate::retry::RetryPolicy;

/// Body served by `GET /peer/{peer_id}/psk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPskResponse {
    pub key: String,
    pub key_id: String,
    pub signature: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// A decrypted value received from one peer.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub peer_id: String,
    pub psk: Psk,
}

/// How candidates are accepted.
#[derive(Debug, Clone, Copy)]
pub enum ValidationMode<'a> {
    /// Signer unknown: every candidate must carry the same value.
    Bootstrap,
    /// Accept the first candidate signed by `signer` for `block_number`.
    KnownSigner {
        signer: &'a PeerIdentity,
        block_number: u64,
    },
}

/// Pick the accepted PSK, if any. `None` is not an error: peers may not
/// have rotated yet.
pub fn validate(candidates: &[Candidate], mode: ValidationMode<'_>) -> Option<Psk> {
    match mode {
        ValidationMode::Bootstrap => {
            let (first, rest) = candidates.split_first()?;
            if rest
                .iter()
                .all(|c| psk_values_equal(c.psk.value(), first.psk.value()))
            {
                Some(first.psk.clone())
            } else {
                warn!(
                    "Peers disagree on the PSK ({} candidates), no consensus",
                    candidates.len()
                );
                None
            }
        }
        ValidationMode::KnownSigner {
            signer,
            block_number,
        } => candidates
            .iter()
            .find(|c| {
                let valid = c.psk.verify(block_number, signer);
                if !valid {
                    warn!("PSK from {} is not signed by {} for block {}", c.peer_id, signer, block_number);
                }
                valid
            })
            .map(|c| c.psk.clone().with_block_number(block_number)),
    }
}

/// Encrypt a stored PSK value under a QKD key for transport.
pub fn encrypt_for_peer(psk_value: &str, qkd_key: &QkdKey) -> Result<String, RunnerError> {
    let plaintext = canonical_psk_hex(psk_value)?;
    let pad = canonical_psk_hex(&qkd_key.key_hex)?;
    Ok(onetimepad::encrypt(&plaintext, &pad)?)
}

/// Recover a PSK value from a peer's ciphertext. Short or `0x`-prefixed
/// ciphertexts are normalized first.
pub fn decrypt_from_peer(ciphertext: &str, qkd_key: &QkdKey) -> Result<String, RunnerError> {
    let ciphertext = canonical_psk_hex(ciphertext)?;
    let pad = canonical_psk_hex(&qkd_key.key_hex)?;
    let plaintext = onetimepad::decrypt(&ciphertext, &pad)?;
    Ok(canonical_psk_hex(&plaintext)?)
}

#[derive(Clone)]
pub struct PeerExchange {
    local_identity: PeerIdentity,
    peers: PeerDirectory,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl PeerExchange {
    pub fn new(
        local_identity: PeerIdentity,
        peers: PeerDirectory,
        client: reqwest::Client,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            local_identity,
            peers,
            client,
            retry,
        }
    }

    pub fn from_config(
        config: &RunnerConfig,
        local_identity: PeerIdentity,
        peers: PeerDirectory,
    ) -> Result<Self, RunnerError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self::new(local_identity, peers, client, config.retry_policy()))
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    fn remote_peers(&self) -> impl Iterator<Item = &PeerEndpoint> {
        self.peers
            .iter()
            .filter(move |peer| peer.identity != self.local_identity)
    }

    /// Ask every remote peer in turn. Failing peers are logged and skipped.
    pub async fn fetch_candidates(&self) -> Vec<Candidate> {
        info!("Fetching PSK from other peers...");
        let mut candidates = Vec::new();
        for peer in self.remote_peers() {
            match self.fetch_from(peer).await {
                Ok(psk) => {
                    debug!("Got PSK candidate from {}", peer.identity);
                    candidates.push(Candidate {
                        peer_id: peer.identity.to_string(),
                        psk,
                    });
                }
                Err(e) => warn!("{} didn't send the PSK: {}", peer.identity, e),
            }
        }
        candidates
    }

    async fn fetch_from(&self, peer: &PeerEndpoint) -> Result<Psk, RunnerError> {
        let url = format!("{}/peer/{}/psk", peer.server_addr, self.local_identity);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let reason = match response.json::<ErrorBody>().await {
                Ok(body) => format!("HTTP {}: {}", status, body.message),
                Err(_) => format!("HTTP {}", status),
            };
            return Err(RunnerError::PeerRequest {
                peer_id: peer.identity.to_string(),
                reason,
            });
        }

        let body: EncryptedPskResponse =
            response.json().await.map_err(|e| RunnerError::PeerRequest {
                peer_id: peer.identity.to_string(),
                reason: format!("unreadable body: {}", e),
            })?;

        let qkd_key = peer.qkd.get_dec_key(&body.key_id).await?;
        let value = decrypt_from_peer(&body.key, &qkd_key)?;
        Psk::new(&value, body.signature)
    }

    /// One exchange attempt. `Ok(None)` means no acceptable value yet.
    pub async fn get_psk_from_peers(
        &self,
        mode: ValidationMode<'_>,
    ) -> Result<Option<Psk>, RunnerError> {
        if self.remote_peers().next().is_none() {
            return Err(RunnerError::NoPeers);
        }
        let candidates = self.fetch_candidates().await;
        Ok(validate(&candidates, mode))
    }

    /// Repeat the exchange with backoff until a value is accepted, the
    /// retry ceiling is hit or `cancel` fires.
    pub async fn fetch_until_valid(
        &self,
        mode: ValidationMode<'_>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Psk, RunnerError> {
        self.retry
            .run("PSK exchange", cancel, || self.get_psk_from_peers(mode))
            .await
    }
}
