use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use game_shard_proto::SignedTransaction;

use crate::error::WorldError;
use crate::world::SystemContext;

pub type MessageId = u64;

/// A registered message definition, erased to its name, id, and body codec.
pub struct RegisteredMessage {
    pub id: MessageId,
    pub name: String,
    pub evm_support: bool,
    decode: Box<dyn Fn(&JsonValue) -> Result<JsonValue, WorldError> + Send + Sync>,
}

impl std::fmt::Debug for RegisteredMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredMessage")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("evm_support", &self.evm_support)
            .finish()
    }
}

/// Name/id table for message types. Ids follow registration order; names are
/// unique; registration is one-shot per world.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    messages: Vec<RegisteredMessage>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<Request, Result_>(
        &mut self,
        message: &MessageType<Request, Result_>,
    ) -> Result<MessageId, WorldError>
    where
        Request: Serialize + DeserializeOwned + 'static,
        Result_: Serialize + DeserializeOwned + 'static,
    {
        if self.id_by_name(&message.name).is_ok() {
            return Err(WorldError::MessageAlreadyRegistered {
                name: message.name.clone(),
            });
        }
        let id = self.messages.len() as MessageId;
        self.messages.push(RegisteredMessage {
            id,
            name: message.name.clone(),
            evm_support: message.evm_support,
            decode: Box::new(|body| {
                let request: Request = serde_json::from_value(body.clone())?;
                Ok(serde_json::to_value(request)?)
            }),
        });
        Ok(id)
    }

    pub fn id_by_name(&self, name: &str) -> Result<MessageId, WorldError> {
        self.messages
            .iter()
            .find(|message| message.name == name)
            .map(|message| message.id)
            .ok_or_else(|| WorldError::MessageNotRegistered {
                name: name.to_string(),
            })
    }

    /// Decodes and canonicalizes an envelope body for the named message.
    pub fn decode(&self, name: &str, body: &JsonValue) -> Result<JsonValue, WorldError> {
        let message = self
            .messages
            .iter()
            .find(|message| message.name == name)
            .ok_or_else(|| WorldError::MessageNotRegistered {
                name: name.to_string(),
            })?;
        (message.decode)(body)
    }

    pub fn messages(&self) -> &[RegisteredMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A transaction of a concrete message type, as seen by a system.
#[derive(Debug, Clone, PartialEq)]
pub struct TxData<Request> {
    pub tx_hash: String,
    pub msg: Request,
    pub tx: SignedTransaction,
}

/// Typed layer over the erased registry: declares a message by name and
/// gives systems typed access to the transactions drained into the current
/// tick.
#[derive(Debug, Clone)]
pub struct MessageType<Request, Result_> {
    name: String,
    evm_support: bool,
    _marker: PhantomData<fn() -> (Request, Result_)>,
}

impl<Request, Result_> MessageType<Request, Result_>
where
    Request: Serialize + DeserializeOwned,
    Result_: Serialize,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            evm_support: false,
            _marker: PhantomData,
        }
    }

    /// Marks the message as addressable from an external chain codec.
    pub fn with_evm_support(mut self) -> Self {
        self.evm_support = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evm_support(&self) -> bool {
        self.evm_support
    }

    /// The transactions of this type drained into the current tick, in
    /// acceptance order.
    pub fn in_tick<'a>(&self, ctx: &SystemContext<'a>) -> Result<Vec<TxData<Request>>, WorldError> {
        let id = ctx.message_id(&self.name)?;
        let mut transactions = Vec::new();
        for queued in ctx.drained() {
            if queued.msg_id != id {
                continue;
            }
            let msg: Request = serde_json::from_value(queued.value.clone())?;
            transactions.push(TxData {
                tx_hash: queued.tx_hash.clone(),
                msg,
                tx: queued.envelope.clone(),
            });
        }
        Ok(transactions)
    }

    /// Runs `handler` over every drained transaction of this type, recording
    /// the returned value as the transaction result or the returned message
    /// as a transaction error.
    pub fn each<'a>(
        &self,
        ctx: &mut SystemContext<'a>,
        mut handler: impl FnMut(&mut SystemContext<'a>, TxData<Request>) -> Result<Result_, String>,
    ) -> Result<(), WorldError> {
        for tx_data in self.in_tick(ctx)? {
            let tx_hash = tx_data.tx_hash.clone();
            match handler(ctx, tx_data) {
                Ok(result) => {
                    ctx.set_result(&tx_hash, serde_json::to_value(result)?);
                }
                Err(reason) => {
                    ctx.add_error(&tx_hash, reason);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct MoveRequest {
        dx: i64,
        dy: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct MoveResult {
        ok: bool,
    }

    #[test]
    fn registration_assigns_sequential_ids() {
        let mut registry = MessageRegistry::new();
        let move_msg: MessageType<MoveRequest, MoveResult> = MessageType::new("move");
        let jump_msg: MessageType<MoveRequest, MoveResult> = MessageType::new("jump");
        assert_eq!(registry.register(&move_msg).expect("register"), 0);
        assert_eq!(registry.register(&jump_msg).expect("register"), 1);
        assert_eq!(registry.id_by_name("jump").expect("lookup"), 1);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = MessageRegistry::new();
        let first: MessageType<MoveRequest, MoveResult> = MessageType::new("move");
        let second: MessageType<MoveRequest, MoveResult> = MessageType::new("move");
        registry.register(&first).expect("register");
        assert_eq!(
            registry.register(&second),
            Err(WorldError::MessageAlreadyRegistered {
                name: "move".to_string()
            })
        );
    }

    #[test]
    fn decode_validates_the_body_shape() {
        let mut registry = MessageRegistry::new();
        let move_msg: MessageType<MoveRequest, MoveResult> = MessageType::new("move");
        registry.register(&move_msg).expect("register");
        let decoded = registry
            .decode("move", &json!({"dx": 1, "dy": -2}))
            .expect("decode");
        assert_eq!(decoded, json!({"dx": 1, "dy": -2}));
        assert!(registry.decode("move", &json!({"dx": "no"})).is_err());
        assert!(matches!(
            registry.decode("missing", &json!({})),
            Err(WorldError::MessageNotRegistered { .. })
        ));
    }

    #[test]
    fn evm_support_marker_is_carried() {
        let mut registry = MessageRegistry::new();
        let move_msg: MessageType<MoveRequest, MoveResult> =
            MessageType::new("move").with_evm_support();
        registry.register(&move_msg).expect("register");
        assert!(registry.messages()[0].evm_support);
    }
}
