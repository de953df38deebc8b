//! Constant-time comparison of key material.

use constant_time_eq::constant_time_eq;

/// Compare two byte slices in constant time.
///
/// Slices of different length compare unequal.
///
/// ```rust
/// use qmc_crypto::utils::constant_time_compare;
///
/// assert!(constant_time_compare(b"c7ce4948", b"c7ce4948"));
/// assert!(!constant_time_compare(b"c7ce4948", b"c7ce4949"));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}

/// Compare two hex strings in constant time after canonical normalization.
///
/// Values that fail to normalize never compare equal.
pub fn psk_values_equal(a: &str, b: &str) -> bool {
    match (
        crate::codec::canonical_psk_hex(a),
        crate::codec::canonical_psk_hex(b),
    ) {
        (Ok(a), Ok(b)) => constant_time_compare(a.as_bytes(), b.as_bytes()),
        _ => false,
    }
}
