use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};

pub const SIGNER_ADDRESS_BYTES: usize = 20;

/// Derives the 20-byte hex signer address for an ed25519 public key. The
/// address is the truncated SHA-256 of the raw key bytes, prefixed with `0x`.
pub fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    format!("0x{}", hex::encode(&digest[..SIGNER_ADDRESS_BYTES]))
}

/// Checks that a signer address is `0x` followed by exactly 20 hex-encoded
/// bytes. Comparison elsewhere is on the lowercase form.
pub fn is_valid_signer_address(address: &str) -> bool {
    let Some(body) = address.strip_prefix("0x") else {
        return false;
    };
    body.len() == SIGNER_ADDRESS_BYTES * 2 && body.chars().all(|c| c.is_ascii_hexdigit())
}

/// Lowercases an address for storage and comparison.
pub fn normalize_signer_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn derived_address_is_20_hex_bytes() {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let address = address_from_verifying_key(&signing_key.verifying_key());
        assert!(is_valid_signer_address(&address));
        assert_eq!(address.len(), 2 + SIGNER_ADDRESS_BYTES * 2);
    }

    #[test]
    fn address_validation_rejects_bad_inputs() {
        assert!(!is_valid_signer_address(""));
        assert!(!is_valid_signer_address("abc123"));
        assert!(!is_valid_signer_address("0x1234"));
        assert!(!is_valid_signer_address(
            "0xzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"
        ));
        assert!(is_valid_signer_address(
            "0x00112233445566778899aabbccddeeff00112233"
        ));
        assert!(is_valid_signer_address(
            "0x00112233445566778899AABBCCDDEEFF00112233"
        ));
    }

    #[test]
    fn same_key_always_derives_same_address() {
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let a = address_from_verifying_key(&key.verifying_key());
        let b = address_from_verifying_key(&key.verifying_key());
        assert_eq!(a, b);
    }
}
