//! Wire protocol for the game shard: signed transaction envelopes, canonical
//! hashing, and signer address handling. Shared by the shard core and by
//! external producers that submit transactions.

pub mod address;
pub mod sign;

pub use address::{address_from_verifying_key, is_valid_signer_address};
pub use sign::{SignError, SignedTransaction, SYSTEM_PERSONA_TAG};
