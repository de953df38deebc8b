//! Node keys and self-certifying peer identities.
//!
//! A peer identity is the base58btc rendering of an identity multihash that
//! wraps a protobuf-encoded ed25519 public key. No certificate authority is
//! involved: the public key used to check a peer's signatures is recovered
//! from its identifier alone.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use tracing::error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec::{self, CodecError};

/// Identity multihash (`0x00`, 36 bytes) followed by the protobuf public key
/// envelope: key type ed25519 (`08 01`), key data of 32 bytes (`12 20`).
pub const PEER_ID_HEADER: [u8; 6] = [0x00, 0x24, 0x08, 0x01, 0x12, 0x20];

/// Length of a decoded peer identity.
pub const PEER_ID_LEN: usize = PEER_ID_HEADER.len() + 32;

/// Error type for identity operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("malformed private key: {0}")]
    MalformedPrivateKey(CodecError),
    #[error("malformed peer identity: {0}")]
    MalformedPeerId(CodecError),
    #[error("unsupported peer identity encoding: header {0}")]
    UnsupportedEncoding(String),
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// A self-certifying peer identifier with its embedded ed25519 public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    encoded: String,
    public_key: [u8; 32],
}

impl PeerIdentity {
    /// Decode a peer identifier, checking the header bytes explicitly.
    ///
    /// Identifiers that use another multihash or key type fail with
    /// [`IdentityError::UnsupportedEncoding`] instead of yielding a wrong key.
    pub fn parse(encoded: &str) -> Result<Self, IdentityError> {
        let bytes = codec::base58_decode(encoded).map_err(IdentityError::MalformedPeerId)?;
        if bytes.len() != PEER_ID_LEN {
            return Err(IdentityError::InvalidKeyLength {
                expected: PEER_ID_LEN,
                got: bytes.len(),
            });
        }

        let (header, key) = bytes.split_at(PEER_ID_HEADER.len());
        if header != PEER_ID_HEADER {
            return Err(IdentityError::UnsupportedEncoding(hex::encode(header)));
        }

        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(key);
        Ok(Self {
            encoded: encoded.to_string(),
            public_key,
        })
    }

    /// Build the identifier for a raw ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut bytes = Vec::with_capacity(PEER_ID_LEN);
        bytes.extend_from_slice(&PEER_ID_HEADER);
        bytes.extend_from_slice(public_key);
        Self {
            encoded: bs58::encode(bytes).into_string(),
            public_key: *public_key,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// The ed25519 public key embedded in the identifier.
    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerIdentity").field(&self.encoded).finish()
    }
}

/// The node's ed25519 signing key.
///
/// Key material is zeroized when the key is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct NodeKey {
    #[zeroize(skip)] // SigningKey implements Zeroize internally
    sign_key: SigningKey,
}

impl NodeKey {
    /// Generate a new random key using a secure random source.
    pub fn generate() -> Self {
        Self {
            sign_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load a key from its 32-byte seed in hex, as stored in the node key file.
    pub fn from_hex(private_key_hex: &str) -> Result<Self, IdentityError> {
        let seed: [u8; 32] =
            codec::decode_hex_array(private_key_hex).map_err(IdentityError::MalformedPrivateKey)?;
        Ok(Self {
            sign_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.sign_key.to_bytes())
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.sign_key.verifying_key().to_bytes()
    }

    pub fn peer_identity(&self) -> PeerIdentity {
        PeerIdentity::from_public_key(&self.public_key())
    }

    /// Sign a payload. Returns a 64-byte signature.
    pub fn sign(&self, payload: &[u8]) -> [u8; 64] {
        let signature: Signature = self.sign_key.sign(payload);
        signature.to_bytes()
    }
}

/// Derive the public key from a hex-encoded private key.
pub fn derive_public_key(private_key_hex: &str) -> Result<[u8; 32], IdentityError> {
    Ok(NodeKey::from_hex(private_key_hex)?.public_key())
}

/// Derive the public key embedded in a peer identifier.
pub fn derive_public_key_from_peer_id(peer_id: &str) -> Result<[u8; 32], IdentityError> {
    Ok(PeerIdentity::parse(peer_id)?.public_key())
}

/// Sign a payload with a hex-encoded private key.
///
/// A malformed key is an error; nothing is signed with a partial key.
pub fn sign(payload: &[u8], private_key_hex: &str) -> Result<[u8; 64], IdentityError> {
    Ok(NodeKey::from_hex(private_key_hex)?.sign(payload))
}

/// Verify an ed25519 signature.
///
/// Never fails: a bad signature, a malformed key or a malformed signature
/// all yield `false` and are logged.
pub fn verify(payload: &[u8], signature: &[u8], pub_key: &[u8]) -> bool {
    let Ok(pub_key) = <[u8; 32]>::try_from(pub_key) else {
        error!("Invalid public key length: {}", pub_key.len());
        return false;
    };
    let Ok(signature) = <[u8; 64]>::try_from(signature) else {
        error!("Invalid signature length: {}", signature.len());
        return false;
    };
    let verifying_key = match VerifyingKey::from_bytes(&pub_key) {
        Ok(key) => key,
        Err(e) => {
            error!("Invalid public key: {}", e);
            return false;
        }
    };

    match verifying_key.verify_strict(payload, &Signature::from_bytes(&signature)) {
        Ok(()) => true,
        Err(_) => {
            error!("Invalid signature");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_ID: &str = "12D3KooWKzWKFojk7A1Hw23dpiQRbLs6HrXFf4EGLsN4oZ1WsWCc";
    const PRIVATE_KEY: &str = "df432c8e967aa21fdd287d3ea61fa85640a8309577f65b4ea78d49d514661654";
    const DATA: &str = "18617dff4efef20450dd5eafc060fd85faacca13d95ace3bda0be32e4694fcd7";

    #[test]
    fn test_public_key_from_private_key_matches_peer_id() {
        assert_eq!(
            derive_public_key(PRIVATE_KEY).unwrap(),
            derive_public_key_from_peer_id(PEER_ID).unwrap()
        );
    }

    #[test]
    fn test_peer_identity_round_trip() {
        let key = NodeKey::from_hex(PRIVATE_KEY).unwrap();
        assert_eq!(key.peer_identity().as_str(), PEER_ID);
        assert_eq!(PeerIdentity::parse(PEER_ID).unwrap(), key.peer_identity());
    }

    #[test]
    fn test_peer_identity_rejects_other_header() {
        let mut bytes = codec::base58_decode(PEER_ID).unwrap();
        bytes[3] = 0x02; // secp256k1 key type
        let encoded = bs58::encode(bytes).into_string();
        assert!(matches!(
            PeerIdentity::parse(&encoded),
            Err(IdentityError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn test_peer_identity_rejects_wrong_length() {
        let encoded = bs58::encode([0u8; 10]).into_string();
        assert!(matches!(
            PeerIdentity::parse(&encoded),
            Err(IdentityError::InvalidKeyLength { expected: 38, got: 10 })
        ));
        assert!(matches!(
            PeerIdentity::parse("not-base58-0OIl"),
            Err(IdentityError::MalformedPeerId(_))
        ));
    }

    #[test]
    fn test_signature_flow_successful() {
        let private_key = "168bcc3789d741afc6e3f422f03da05fd4877e3e5518681758043ed7734967e9";
        let public_key = derive_public_key(private_key).unwrap();

        let signature = sign(DATA.as_bytes(), private_key).unwrap();

        assert!(verify(DATA.as_bytes(), &signature, &public_key));
    }

    #[test]
    fn test_signature_flow_unsuccessful_when_pubkey_is_different() {
        let alice = "168bcc3789d741afc6e3f422f03da05fd4877e3e5518681758043ed7734967e9";
        let bob = "0000000000000000000000000000000000000000000000000000000000000000";
        let bob_public_key = derive_public_key(bob).unwrap();

        let signature = sign(DATA.as_bytes(), alice).unwrap();

        assert!(!verify(DATA.as_bytes(), &signature, &bob_public_key));
    }

    #[test]
    fn test_verification_known_vector() {
        let public_key =
            hex::decode("da94c76735530f88f286dabc3785e69d82920ecfbedae3ab068c5df58709644e").unwrap();
        let signature = hex::decode("fae47d3f21430743df8062d9c4a82cee5df7606d5672413d13aea657eb248d3f917f7487b7e154437515162903396bf3c827d54ea9ff2c9bf47290804d96630b").unwrap();

        assert!(verify(DATA.as_bytes(), &signature, &public_key));
    }

    #[test]
    fn test_verification_fails_on_tampering() {
        let key = NodeKey::generate();
        let payload = DATA.as_bytes().to_vec();
        let signature = key.sign(&payload);
        let public_key = key.public_key();

        let mut bad_payload = payload.clone();
        bad_payload[0] ^= 0x01;
        assert!(!verify(&bad_payload, &signature, &public_key));

        let mut bad_signature = signature;
        bad_signature[10] ^= 0x01;
        assert!(!verify(&payload, &bad_signature, &public_key));

        let other = NodeKey::generate().public_key();
        assert!(!verify(&payload, &signature, &other));
    }

    #[test]
    fn test_verify_never_fails_on_malformed_input() {
        let key = NodeKey::generate();
        let signature = key.sign(b"payload");

        assert!(!verify(b"payload", &signature[..10], &key.public_key()));
        assert!(!verify(b"payload", &signature, &[1u8; 5]));
        assert!(!verify(b"payload", &signature, &[0u8; 32]));
    }

    #[test]
    fn test_sign_rejects_malformed_key() {
        assert!(matches!(
            sign(b"payload", "not hex"),
            Err(IdentityError::MalformedPrivateKey(_))
        ));
        assert!(sign(b"payload", "abcd").is_err());
    }

    #[test]
    fn test_node_key_hex_round_trip() {
        let key = NodeKey::from_hex(&format!("0x{}\n", PRIVATE_KEY)).unwrap();
        assert_eq!(key.to_hex(), PRIVATE_KEY);
    }
}
