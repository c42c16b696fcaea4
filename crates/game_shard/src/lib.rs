//! Deterministic simulation core of a game-shard backend.
//!
//! Signed client intents arrive over HTTP, are authenticated against
//! registered personas, queued, and processed in discrete ticks against an
//! archetype-indexed entity-component store. Every tick's writes go through
//! a command buffer that commits atomically to a durable log; receipts and
//! events stream to subscribers after each commit, and an interrupted tick
//! is replayed deterministically from the log on the next start.

pub mod archetype;
pub mod component;
pub mod config;
pub mod cql;
pub mod ecb;
pub mod entity;
pub mod error;
pub mod events;
pub mod message;
pub mod nonce;
pub mod persona;
pub mod query;
pub mod receipt;
pub mod search;
pub mod server;
pub mod store;
pub mod txpool;
pub mod verify;
pub mod world;


pub use component::{Component, ComponentData, ComponentId, ComponentRegistry};
pub use config::WorldConfig;
pub use entity::{EntityId, Tick, ENTITY_NONE};
pub use error::WorldError;
pub use message::{MessageType, TxData};
pub use persona::{CreatePersona, CreatePersonaResult, SignerComponent};
pub use receipt::{Receipt, ReceiptsReply};
pub use search::Filter;
pub use server::ShardServer;
pub use world::{
    spawn_game_loop, GameLoopHandle, ShardHandle, SystemContext, TickSource, World,
};

pub use game_shard_proto::{SignedTransaction, SYSTEM_PERSONA_TAG};
