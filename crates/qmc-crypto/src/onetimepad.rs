//! One-time pad over hex strings.
//!
//! Plaintext and key are hex strings of the same length; the ciphertext is
//! their digit-wise XOR in lowercase hex. The cipher never pads: callers
//! bring both operands to the canonical width first.

/// Error type for one-time-pad operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

/// Encrypt a hex plaintext with a hex key of the same length.
pub fn encrypt(plaintext_hex: &str, key_hex: &str) -> Result<String, CipherError> {
    xor_hex(plaintext_hex, key_hex)
}

/// Decrypt a hex ciphertext with the key it was encrypted under.
pub fn decrypt(ciphertext_hex: &str, key_hex: &str) -> Result<String, CipherError> {
    xor_hex(ciphertext_hex, key_hex)
}

fn xor_hex(a: &str, b: &str) -> Result<String, CipherError> {
    if a.len() != b.len() {
        return Err(CipherError::MalformedInput(format!(
            "length mismatch: {} vs {} hex digits",
            a.len(),
            b.len()
        )));
    }
    if a.is_empty() {
        return Err(CipherError::MalformedInput("empty input".to_string()));
    }

    a.chars()
        .zip(b.chars())
        .map(|(x, y)| {
            let x = nibble(x)?;
            let y = nibble(y)?;
            char::from_digit(u32::from(x ^ y), 16)
                .ok_or_else(|| CipherError::MalformedInput("digit out of range".to_string()))
        })
        .collect()
}

fn nibble(c: char) -> Result<u8, CipherError> {
    c.to_digit(16)
        .map(|d| d as u8)
        .ok_or_else(|| CipherError::MalformedInput(format!("invalid hex digit {:?}", c)))
}
