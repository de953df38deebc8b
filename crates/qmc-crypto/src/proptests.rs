#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use ed25519_dalek::SigningKey;

    use crate::codec::{canonical_psk_hex, PSK_HEX_LEN};
    use crate::identity::{derive_public_key, derive_public_key_from_peer_id, sign, verify, PeerIdentity};
    use crate::onetimepad::{decrypt, encrypt};

    fn equal_length_hex() -> impl Strategy<Value = (String, String)> {
        (1usize..=128).prop_flat_map(|len| {
            let pattern = format!("[0-9a-f]{{{}}}", len);
            (
                proptest::string::string_regex(&pattern).unwrap(),
                proptest::string::string_regex(&pattern).unwrap(),
            )
        })
    }

    proptest! {
        // Cipher round-trip
        #[test]
        fn test_one_time_pad_round_trip((plaintext, key) in equal_length_hex()) {
            let ciphertext = encrypt(&plaintext, &key).unwrap();
            prop_assert_eq!(ciphertext.len(), plaintext.len());
            prop_assert_eq!(decrypt(&ciphertext, &key).unwrap(), plaintext);
        }

        // Canonical width
        #[test]
        fn test_canonical_psk_width(value in "[0-9a-fA-F]{1,64}") {
            let canonical = canonical_psk_hex(&value).unwrap();
            prop_assert_eq!(canonical.len(), PSK_HEX_LEN);
            prop_assert_eq!(canonical_psk_hex(&canonical).unwrap(), canonical.clone());
            prop_assert!(canonical.ends_with(&value.trim_start_matches('0').to_ascii_lowercase()));
        }

        // Identity/key correspondence
        #[test]
        fn test_peer_identity_matches_private_key(seed in any::<[u8; 32]>()) {
            let private_key_hex = hex::encode(seed);
            let public_key = SigningKey::from_bytes(&seed).verifying_key().to_bytes();
            let peer_id = PeerIdentity::from_public_key(&public_key);

            prop_assert_eq!(
                derive_public_key(&private_key_hex).unwrap(),
                derive_public_key_from_peer_id(peer_id.as_str()).unwrap()
            );
        }

        // Signature validity and tamper detection
        #[test]
        fn test_signature_round_trip(
            seed in any::<[u8; 32]>(),
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            flip in any::<usize>()
        ) {
            let private_key_hex = hex::encode(seed);
            let public_key = derive_public_key(&private_key_hex).unwrap();
            let signature = sign(&payload, &private_key_hex).unwrap();

            prop_assert!(verify(&payload, &signature, &public_key));

            let mut bad_payload = payload.clone();
            let idx = flip % bad_payload.len();
            bad_payload[idx] ^= 0x01;
            prop_assert!(!verify(&bad_payload, &signature, &public_key));
        }
    }
}
