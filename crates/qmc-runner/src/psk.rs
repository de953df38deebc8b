//! The rotation payload and its signature.

use qmc_crypto::codec::canonical_psk_hex;
use qmc_crypto::identity::{self, IdentityError};
use qmc_crypto::{NodeKey, PeerIdentity};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RunnerError;

/// Serialized form of the signed tuple. Field order is part of the format.
#[derive(Serialize)]
struct SigningPayload<'a> {
    psk: &'a str,
    block_number: u64,
}

/// Bytes signed for `(value, block_number)`: `{"psk":"<hex>","block_number":N}`.
///
/// `value` must already be canonical.
pub fn signing_payload(value: &str, block_number: u64) -> Vec<u8> {
    // Serializing a struct of a &str and a u64 cannot fail.
    serde_json::to_vec(&SigningPayload {
        psk: value,
        block_number,
    })
    .unwrap_or_default()
}

/// A PSK value with the signature binding it to one rotation round.
///
/// `block_number` is `None` for values accepted by peer consensus, where
/// the round is not known.
#[derive(Clone, PartialEq, Eq)]
pub struct Psk {
    value: String,
    block_number: Option<u64>,
    signature: String,
}

impl Psk {
    /// Pair a value with a hex signature. The value is normalized first.
    pub fn new(value: &str, signature: impl Into<String>) -> Result<Self, RunnerError> {
        Ok(Self {
            value: canonical_psk_hex(value)?,
            block_number: None,
            signature: signature.into().trim().to_ascii_lowercase(),
        })
    }

    /// Record the round this value was verified for.
    pub fn with_block_number(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    /// Sign `value` for `block_number` with the node key.
    pub fn sign(value: &str, block_number: u64, key: &NodeKey) -> Result<Self, RunnerError> {
        let value = canonical_psk_hex(value)?;
        let signature = key.sign(&signing_payload(&value, block_number));
        debug!("Signed PSK for block {}", block_number);
        Ok(Self {
            value,
            block_number: Some(block_number),
            signature: hex::encode(signature),
        })
    }

    /// Check the signature against the key embedded in `signer`.
    ///
    /// A malformed signature is a failed check, not an error.
    pub fn verify(&self, block_number: u64, signer: &PeerIdentity) -> bool {
        let Ok(signature) = hex::decode(&self.signature) else {
            debug!("PSK signature is not hex");
            return false;
        };
        identity::verify(
            &signing_payload(&self.value, block_number),
            &signature,
            &signer.public_key(),
        )
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn block_number(&self) -> Option<u64> {
        self.block_number
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

impl std::fmt::Debug for Psk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Psk")
            .field("value", &"<redacted>")
            .field("block_number", &self.block_number)
            .field("signature", &self.signature)
            .finish()
    }
}

/// Body of `POST /psk`. Every field is required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RotationBody {
    pub is_local_peer: Option<bool>,
    pub peer_id: Option<String>,
    pub block_num: Option<u64>,
}

/// One validated rotation round request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRequest {
    pub is_local_signer: bool,
    pub signer_identity: PeerIdentity,
    pub block_number: u64,
}

impl TryFrom<RotationBody> for RotationRequest {
    type Error = RunnerError;

    fn try_from(body: RotationBody) -> Result<Self, Self::Error> {
        let missing = |field: &str| RunnerError::BadRequest(format!("missing field {}", field));

        let is_local_signer = body.is_local_peer.ok_or_else(|| missing("is_local_peer"))?;
        let peer_id = body.peer_id.ok_or_else(|| missing("peer_id"))?;
        let block_number = body.block_num.ok_or_else(|| missing("block_num"))?;
        let signer_identity = PeerIdentity::parse(&peer_id)
            .map_err(|e: IdentityError| RunnerError::BadRequest(format!("peer_id: {}", e)))?;

        Ok(Self {
            is_local_signer,
            signer_identity,
            block_number,
        })
    }
}
