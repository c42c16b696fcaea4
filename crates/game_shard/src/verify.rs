use std::fmt;

use game_shard_proto::address::{is_valid_signer_address, normalize_signer_address};
use game_shard_proto::sign::{PLACEHOLDER_NAMESPACE, PLACEHOLDER_SIGNATURE};
use game_shard_proto::SignedTransaction;

use crate::component::ComponentRegistry;
use crate::nonce::NonceSet;
use crate::persona::build_persona_index;
use crate::store::FinalState;

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyError {
    MissingPersonaTag,
    WrongNamespace { expected: String, found: String },
    SystemFlagMismatch { expected_system: bool },
    UnknownPersonaTag { persona_tag: String },
    BadSignature { reason: String },
    NonceReused { signer_address: String, nonce: u64 },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::MissingPersonaTag => write!(f, "personaTag must not be empty"),
            VerifyError::WrongNamespace { expected, found } => {
                write!(f, "got namespace {found:?} but it must be {expected:?}")
            }
            VerifyError::SystemFlagMismatch { expected_system } => {
                if *expected_system {
                    write!(f, "system transaction required")
                } else {
                    write!(f, "system transaction forbidden")
                }
            }
            VerifyError::UnknownPersonaTag { persona_tag } => {
                write!(f, "persona tag {persona_tag} has no registered signer")
            }
            VerifyError::BadSignature { reason } => write!(f, "invalid signature: {reason}"),
            VerifyError::NonceReused { signer_address, nonce } => {
                write!(
                    f,
                    "nonce verification failed: signer {signer_address} already used nonce {nonce}"
                )
            }
        }
    }
}

impl std::error::Error for VerifyError {}

/// Read-only view the verifier needs: the world namespace, the committed
/// snapshot for persona resolution, and the shared nonce set.
pub struct VerifyContext<'a> {
    pub namespace: &'a str,
    pub disable_signature_verification: bool,
    pub state: &'a FinalState,
    pub registry: &'a ComponentRegistry,
    pub nonces: &'a NonceSet,
}

/// Authenticates an envelope. On success returns the resolved signer address
/// (empty when verification is disabled) with the nonce pair recorded.
///
/// System transactions resolve their signer from the claim body; game
/// transactions resolve it from the persona index as of the most recent
/// committed tick.
pub fn verify_transaction(
    ctx: &VerifyContext<'_>,
    tx: &mut SignedTransaction,
    expect_system: bool,
) -> Result<String, VerifyError> {
    if tx.persona_tag.trim().is_empty() {
        return Err(VerifyError::MissingPersonaTag);
    }

    if ctx.disable_signature_verification {
        if tx.namespace.is_empty() {
            tx.namespace = PLACEHOLDER_NAMESPACE.to_string();
        }
        if tx.signature.is_empty() {
            tx.signature = PLACEHOLDER_SIGNATURE.to_string();
        }
        return Ok(String::new());
    }

    if tx.namespace != ctx.namespace {
        return Err(VerifyError::WrongNamespace {
            expected: ctx.namespace.to_string(),
            found: tx.namespace.clone(),
        });
    }

    if expect_system != tx.is_system_transaction() {
        return Err(VerifyError::SystemFlagMismatch {
            expected_system: expect_system,
        });
    }

    let signer_address = if tx.is_system_transaction() {
        let address = tx
            .body
            .get("signerAddress")
            .and_then(|value| value.as_str())
            .ok_or_else(|| VerifyError::BadSignature {
                reason: "system transaction body carries no signerAddress".to_string(),
            })?;
        if !is_valid_signer_address(address.trim()) {
            return Err(VerifyError::BadSignature {
                reason: format!("signer address {address} is not a valid 20-byte hex address"),
            });
        }
        normalize_signer_address(address)
    } else {
        let index = build_persona_index(ctx.state, ctx.registry);
        index
            .get(&tx.persona_tag.to_lowercase())
            .map(|record| record.signer_address.clone())
            .ok_or_else(|| VerifyError::UnknownPersonaTag {
                persona_tag: tx.persona_tag.clone(),
            })?
    };

    tx.verify(&signer_address)
        .map_err(|err| VerifyError::BadSignature {
            reason: err.to_string(),
        })?;

    ctx.nonces.use_nonce(&signer_address, tx.nonce)?;
    Ok(signer_address)
}
