//! Encoding helpers for key material.
//!
//! Every PSK value that is persisted, transmitted or signed goes through
//! [`canonical_psk_hex`] first: 64 lowercase hex digits, zero-left-padded,
//! without a `0x` prefix.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Width of a canonical PSK value in hex digits (32 bytes).
pub const PSK_HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("invalid base64 string: {0}")]
    InvalidBase64(String),
    #[error("invalid base58 string: {0}")]
    InvalidBase58(String),
    #[error("value has {len} significant hex digits, at most {max} allowed")]
    TooLong { len: usize, max: usize },
}

/// Strip an optional `0x`/`0X` prefix.
pub fn trim_0x_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

/// Normalize a hex value to the canonical 64-digit PSK form.
///
/// Leading zeros are insignificant: `"0x1234"` and `"001234"` both become
/// sixty zeros followed by `1234`. Values with more than 64 significant
/// digits are rejected rather than truncated.
pub fn canonical_psk_hex(value: &str) -> Result<String, CodecError> {
    let digits = trim_0x_prefix(value.trim());
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CodecError::InvalidHex(value.to_string()));
    }

    let significant = digits.trim_start_matches('0');
    if significant.len() > PSK_HEX_LEN {
        return Err(CodecError::TooLong {
            len: significant.len(),
            max: PSK_HEX_LEN,
        });
    }

    Ok(format!(
        "{:0>width$}",
        significant.to_ascii_lowercase(),
        width = PSK_HEX_LEN
    ))
}

/// Decode standard base64 and re-encode the bytes as lowercase hex.
pub fn base64_to_hex(value: &str) -> Result<String, CodecError> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// Encode a hex string as standard base64.
pub fn hex_to_base64(value: &str) -> Result<String, CodecError> {
    let bytes = hex::decode(trim_0x_prefix(value.trim()))
        .map_err(|e| CodecError::InvalidHex(e.to_string()))?;
    Ok(STANDARD.encode(bytes))
}

/// Decode a bitcoin-alphabet base58 string.
pub fn base58_decode(value: &str) -> Result<Vec<u8>, CodecError> {
    bs58::decode(value)
        .into_vec()
        .map_err(|e| CodecError::InvalidBase58(e.to_string()))
}

/// Decode a hex string of exactly `N` bytes, tolerating a `0x` prefix and
/// surrounding whitespace.
pub fn decode_hex_array<const N: usize>(value: &str) -> Result<[u8; N], CodecError> {
    let bytes = hex::decode(trim_0x_prefix(value.trim()))
        .map_err(|e| CodecError::InvalidHex(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| CodecError::InvalidHex(format!("expected {} bytes, got {}", N, b.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_pads_short_values() {
        let value = canonical_psk_hex("1234").unwrap();
        assert_eq!(value.len(), PSK_HEX_LEN);
        assert_eq!(value, format!("{}1234", "0".repeat(60)));
    }

    #[test]
    fn test_canonical_trims_prefix_and_lowercases() {
        let value = canonical_psk_hex("0xABCDEF").unwrap();
        assert_eq!(value, format!("{}abcdef", "0".repeat(58)));
    }

    #[test]
    fn test_canonical_keeps_full_width_value() {
        let psk = "c7ce4948991367f8f08c473f1bdf3a45945951eb4038f735a76e840d36c27b1a";
        assert_eq!(canonical_psk_hex(psk).unwrap(), psk);
    }

    #[test]
    fn test_canonical_ignores_extra_leading_zeros() {
        let psk = "00c7ce4948991367f8f08c473f1bdf3a45945951eb4038f735a76e840d36c27b1a";
        assert_eq!(
            canonical_psk_hex(psk).unwrap(),
            "c7ce4948991367f8f08c473f1bdf3a45945951eb4038f735a76e840d36c27b1a"
        );
    }

    #[test]
    fn test_canonical_rejects_garbage() {
        assert!(matches!(canonical_psk_hex(""), Err(CodecError::InvalidHex(_))));
        assert!(matches!(canonical_psk_hex("0x"), Err(CodecError::InvalidHex(_))));
        assert!(matches!(canonical_psk_hex("xyz"), Err(CodecError::InvalidHex(_))));
        assert!(matches!(
            canonical_psk_hex(&"f".repeat(65)),
            Err(CodecError::TooLong { len: 65, max: 64 })
        ));
    }

    #[test]
    fn test_decode_base64() {
        let result = base64_to_hex("qV4XorklC1EbehIbsovSaRGlWhyw3jETpt/laDSr3BQ=").unwrap();
        assert_eq!(
            result,
            "a95e17a2b9250b511b7a121bb28bd26911a55a1cb0de3113a6dfe56834abdc14"
        );
        assert_eq!(base64_to_hex("EjQ=").unwrap(), "1234");
    }

    #[test]
    fn test_hex_to_base64() {
        assert_eq!(hex_to_base64("1234").unwrap(), "EjQ=");
        assert!(hex_to_base64("123").is_err());
    }

    #[test]
    fn test_decode_base58() {
        let result = base58_decode("12D3KooWQ4b1BHDUUW8VbWSCrS4RcdtRL6C8VEVb9Ye59uRp63Y1").unwrap();
        assert_eq!(
            hex::encode(result),
            "002408011220d3a842cd6b623801aaefd9784cb798c0931a8c8f2edb802b488094f187e10c06"
        );
        assert!(base58_decode("0OIl").is_err());
    }

    #[test]
    fn test_decode_hex_array() {
        let key: [u8; 2] = decode_hex_array("0x1234\n").unwrap();
        assert_eq!(key, [0x12, 0x34]);
        assert!(decode_hex_array::<3>("1234").is_err());
    }
}
