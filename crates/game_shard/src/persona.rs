use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use game_shard_proto::address::{is_valid_signer_address, normalize_signer_address};
use game_shard_proto::SYSTEM_PERSONA_TAG;

use crate::component::{Component, ComponentData, ComponentRegistry};
use crate::entity::{EntityId, Tick};
use crate::error::WorldError;
use crate::message::MessageType;
use crate::search::Filter;
use crate::store::FinalState;
use crate::world::SystemContext;

pub const CREATE_PERSONA_MESSAGE: &str = "create-persona";
pub const AUTHORIZE_PERSONA_ADDRESS_MESSAGE: &str = "authorize-persona-address";

/// Binds a persona tag to its signer. Stored as a component; tag comparison
/// is case-insensitive while the stored tag preserves the claimed casing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerComponent {
    pub persona_tag: String,
    pub signer_address: String,
    pub authorized_addresses: Vec<String>,
}

impl Component for SignerComponent {
    fn name() -> &'static str {
        "SignerComponent"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePersona {
    pub persona_tag: String,
    pub signer_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePersonaResult {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizePersonaAddress {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizePersonaAddressResult {
    pub success: bool,
}

pub fn create_persona_msg() -> MessageType<CreatePersona, CreatePersonaResult> {
    MessageType::new(CREATE_PERSONA_MESSAGE).with_evm_support()
}

pub fn authorize_persona_address_msg(
) -> MessageType<AuthorizePersonaAddress, AuthorizePersonaAddressResult> {
    MessageType::new(AUTHORIZE_PERSONA_ADDRESS_MESSAGE)
}

pub fn is_valid_persona_tag(tag: &str) -> bool {
    !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersonaRecord {
    pub entity: EntityId,
    pub persona_tag: String,
    pub signer_address: String,
}

/// Secondary lookup index from lowercase persona tag to its signer record,
/// rebuilt from the archetypes carrying [`SignerComponent`].
pub fn build_persona_index(
    state: &FinalState,
    registry: &ComponentRegistry,
) -> BTreeMap<String, PersonaRecord> {
    let mut index = BTreeMap::new();
    let Ok(signer_id) = registry.id_of::<SignerComponent>() else {
        return index;
    };
    for entity in state.matching_entities(&Filter::contains([signer_id])) {
        let Some(value) = state.component_value(entity, signer_id) else {
            continue;
        };
        let Ok(signer) = serde_json::from_value::<SignerComponent>(value.clone()) else {
            continue;
        };
        index.insert(
            signer.persona_tag.to_lowercase(),
            PersonaRecord {
                entity,
                persona_tag: signer.persona_tag,
                signer_address: signer.signer_address,
            },
        );
    }
    index
}

fn persona_index_from_ctx(
    ctx: &SystemContext<'_>,
) -> Result<BTreeMap<String, PersonaRecord>, WorldError> {
    let signer_id = ctx.component_id::<SignerComponent>()?;
    let mut index = BTreeMap::new();
    for entity in ctx.search(&Filter::contains([signer_id])) {
        let signer: SignerComponent = ctx.get_component(entity)?;
        index.insert(
            signer.persona_tag.to_lowercase(),
            PersonaRecord {
                entity,
                persona_tag: signer.persona_tag,
                signer_address: signer.signer_address,
            },
        );
    }
    Ok(index)
}

/// Built-in system that turns accepted `create-persona` transactions into
/// signer records. Each tag may be claimed at most once; later claims get an
/// error receipt.
pub fn register_persona_system(ctx: &mut SystemContext<'_>) -> Result<(), WorldError> {
    let mut index = persona_index_from_ctx(ctx)?;
    create_persona_msg().each(ctx, |ctx, tx_data| {
        let msg = tx_data.msg;
        if !is_valid_persona_tag(&msg.persona_tag) {
            return Err(format!(
                "persona tag {} is not valid: must only contain alphanumerics and underscores",
                msg.persona_tag
            ));
        }
        if msg.persona_tag == SYSTEM_PERSONA_TAG {
            return Err(format!("persona tag {} is reserved", msg.persona_tag));
        }
        if !is_valid_signer_address(msg.signer_address.trim()) {
            return Err(format!(
                "signer address {} is not a valid 20-byte hex address",
                msg.signer_address
            ));
        }
        let signer_address = normalize_signer_address(&msg.signer_address);
        if ctx.allowlist_enabled() && !ctx.allowlist_contains(&signer_address) {
            return Err(format!(
                "signer address {signer_address} is not allowlisted for persona registration"
            ));
        }
        let lower_persona = msg.persona_tag.to_lowercase();
        if index.contains_key(&lower_persona) {
            return Err(format!(
                "persona tag {} has already been registered",
                msg.persona_tag
            ));
        }
        let signer = SignerComponent {
            persona_tag: msg.persona_tag.clone(),
            signer_address: signer_address.clone(),
            authorized_addresses: Vec::new(),
        };
        let data = ComponentData::of(&signer).map_err(|err| err.to_string())?;
        let entity = ctx.create(vec![data]).map_err(|err| err.to_string())?;
        index.insert(
            lower_persona,
            PersonaRecord {
                entity,
                persona_tag: msg.persona_tag,
                signer_address,
            },
        );
        Ok(CreatePersonaResult { success: true })
    })
}

/// Built-in system that appends an authorized address to the sender
/// persona's signer record. Re-authorizing the same address is a no-op.
pub fn authorize_persona_address_system(ctx: &mut SystemContext<'_>) -> Result<(), WorldError> {
    let index = persona_index_from_ctx(ctx)?;
    authorize_persona_address_msg().each(ctx, |ctx, tx_data| {
        let lower_persona = tx_data.tx.persona_tag.to_lowercase();
        let record = index
            .get(&lower_persona)
            .ok_or_else(|| format!("persona {} does not exist", tx_data.tx.persona_tag))?;
        let address = normalize_signer_address(&tx_data.msg.address);
        if !is_valid_signer_address(&address) {
            return Err(format!("address {address} is invalid"));
        }
        ctx.update_component::<SignerComponent>(record.entity, |mut signer| {
            if !signer.authorized_addresses.contains(&address) {
                signer.authorized_addresses.push(address.clone());
            }
            signer
        })
        .map_err(|err| err.to_string())?;
        Ok(AuthorizePersonaAddressResult { success: true })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonaStatus {
    Available,
    Unknown,
    Assigned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaSignerReply {
    pub status: PersonaStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_address: Option<String>,
}

/// Resolves a persona tag's signer as of the given tick. Claims land one
/// tick after acceptance, so a query at or beyond the current tick cannot be
/// answered yet and reports `unknown`.
pub fn persona_signer_status(
    state: &FinalState,
    registry: &ComponentRegistry,
    persona_tag: &str,
    tick: Tick,
) -> PersonaSignerReply {
    if tick >= state.tick {
        return PersonaSignerReply {
            status: PersonaStatus::Unknown,
            signer_address: None,
        };
    }
    let index = build_persona_index(state, registry);
    match index.get(&persona_tag.to_lowercase()) {
        Some(record) => PersonaSignerReply {
            status: PersonaStatus::Assigned,
            signer_address: Some(record.signer_address.clone()),
        },
        None => PersonaSignerReply {
            status: PersonaStatus::Available,
            signer_address: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_tag_validation() {
        assert!(is_valid_persona_tag("CoolMage"));
        assert!(is_valid_persona_tag("cool_mage_99"));
        assert!(!is_valid_persona_tag(""));
        assert!(!is_valid_persona_tag("cool mage"));
        assert!(!is_valid_persona_tag("cool-mage"));
        assert!(!is_valid_persona_tag("mage!"));
    }

    #[test]
    fn status_serializes_lowercase() {
        let reply = PersonaSignerReply {
            status: PersonaStatus::Assigned,
            signer_address: Some("0xabc".to_string()),
        };
        let value = serde_json::to_value(&reply).expect("encode");
        assert_eq!(value["status"], "assigned");
        assert_eq!(value["signerAddress"], "0xabc");

        let reply = PersonaSignerReply {
            status: PersonaStatus::Available,
            signer_address: None,
        };
        let value = serde_json::to_value(&reply).expect("encode");
        assert_eq!(value["status"], "available");
        assert!(value.get("signerAddress").is_none());
    }
}
