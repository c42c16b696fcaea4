use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::address::{address_from_verifying_key, normalize_signer_address};

/// Reserved persona tag carried by system transactions. System transactions
/// authenticate through the signer address embedded in their body rather than
/// a registered persona.
pub const SYSTEM_PERSONA_TAG: &str = "SystemPersonaTag";

pub const PLACEHOLDER_NAMESPACE: &str = "placeholder-namespace";
pub const PLACEHOLDER_SIGNATURE: &str = "placeholder-signature";

const PUBLIC_KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignError {
    SignatureNotHex { reason: String },
    SignatureWrongLength { len: usize },
    PublicKeyInvalid,
    AddressMismatch { expected: String, found: String },
    SignatureInvalid,
    Serde(String),
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignError::SignatureNotHex { reason } => {
                write!(f, "signature is not valid hex: {reason}")
            }
            SignError::SignatureWrongLength { len } => {
                write!(f, "signature must be {} bytes, got {len}", PUBLIC_KEY_LEN + SIGNATURE_LEN)
            }
            SignError::PublicKeyInvalid => write!(f, "embedded public key is invalid"),
            SignError::AddressMismatch { expected, found } => {
                write!(f, "public key resolves to {found} but signer is {expected}")
            }
            SignError::SignatureInvalid => write!(f, "signature verification failed"),
            SignError::Serde(reason) => write!(f, "signing payload encoding failed: {reason}"),
        }
    }
}

impl std::error::Error for SignError {}

impl From<serde_json::Error> for SignError {
    fn from(error: serde_json::Error) -> Self {
        SignError::Serde(error.to_string())
    }
}

/// The wire envelope for a client intent. `body` is opaque JSON decoded per
/// message type by the shard. `signature` is hex of `pubkey || signature`
/// over [`SignedTransaction::signing_bytes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub persona_tag: String,
    pub namespace: String,
    pub nonce: u64,
    pub signature: String,
    pub body: JsonValue,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningPayload<'a> {
    persona_tag: &'a str,
    namespace: &'a str,
    nonce: u64,
    body: &'a JsonValue,
}

impl SignedTransaction {
    pub fn new_unsigned(
        persona_tag: impl Into<String>,
        namespace: impl Into<String>,
        nonce: u64,
        body: JsonValue,
    ) -> Self {
        Self {
            persona_tag: persona_tag.into(),
            namespace: namespace.into(),
            nonce,
            signature: String::new(),
            body,
        }
    }

    /// Builds and signs an envelope in one step.
    pub fn sign(
        signing_key: &SigningKey,
        persona_tag: impl Into<String>,
        namespace: impl Into<String>,
        nonce: u64,
        body: JsonValue,
    ) -> Result<Self, SignError> {
        let mut tx = Self::new_unsigned(persona_tag, namespace, nonce, body);
        let payload = tx.signing_bytes()?;
        let signature: Signature = signing_key.sign(&payload);
        let mut raw = Vec::with_capacity(PUBLIC_KEY_LEN + SIGNATURE_LEN);
        raw.extend_from_slice(&signing_key.verifying_key().to_bytes());
        raw.extend_from_slice(&signature.to_bytes());
        tx.signature = hex::encode(raw);
        Ok(tx)
    }

    pub fn is_system_transaction(&self) -> bool {
        self.persona_tag == SYSTEM_PERSONA_TAG
    }

    /// Canonical bytes covered by the signature: the envelope minus the
    /// signature field, as JSON with sorted object keys.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, SignError> {
        let payload = SigningPayload {
            persona_tag: &self.persona_tag,
            namespace: &self.namespace,
            nonce: self.nonce,
            body: &self.body,
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    /// Deterministic transaction hash: lowercase hex SHA-256 of the signing
    /// bytes. Two envelopes differing only in signature share a hash.
    pub fn hash_hex(&self) -> Result<String, SignError> {
        let bytes = self.signing_bytes()?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Verifies the embedded signature against the expected signer address:
    /// the embedded public key must resolve to `signer_address` and the
    /// ed25519 signature must cover the canonical signing bytes.
    pub fn verify(&self, signer_address: &str) -> Result<(), SignError> {
        let raw = hex::decode(self.signature.trim()).map_err(|err| SignError::SignatureNotHex {
            reason: err.to_string(),
        })?;
        if raw.len() != PUBLIC_KEY_LEN + SIGNATURE_LEN {
            return Err(SignError::SignatureWrongLength { len: raw.len() });
        }
        let mut key_bytes = [0u8; PUBLIC_KEY_LEN];
        key_bytes.copy_from_slice(&raw[..PUBLIC_KEY_LEN]);
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| SignError::PublicKeyInvalid)?;

        let derived = address_from_verifying_key(&verifying_key);
        if derived != normalize_signer_address(signer_address) {
            return Err(SignError::AddressMismatch {
                expected: normalize_signer_address(signer_address),
                found: derived,
            });
        }

        let mut sig_bytes = [0u8; SIGNATURE_LEN];
        sig_bytes.copy_from_slice(&raw[PUBLIC_KEY_LEN..]);
        let signature = Signature::from_bytes(&sig_bytes);
        let payload = self.signing_bytes()?;
        verifying_key
            .verify(&payload, &signature)
            .map_err(|_| SignError::SignatureInvalid)
    }
}
