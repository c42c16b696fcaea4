use std::fmt;
use std::io;

use crate::entity::{EntityId, Tick};

/// Central error type for the shard core. Layer-specific failures
/// ([`crate::store::StoreError`], [`crate::cql::CqlError`],
/// [`crate::verify::VerifyError`]) convert into it at the seams.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldError {
    GameNotStarted,
    GameAlreadyStarted,
    ComponentAlreadyRegistered { name: String },
    ComponentNotRegistered { name: String },
    ComponentAlreadyOnEntity { entity: EntityId, component: String },
    ComponentNotOnEntity { entity: EntityId, component: String },
    EntityNotFound { entity: EntityId },
    MessageAlreadyRegistered { name: String },
    MessageNotRegistered { name: String },
    QueryAlreadyRegistered { name: String },
    QueryNotRegistered { name: String },
    QueryFailed { name: String, reason: String },
    SystemFailed { system: String, tick: Tick, reason: String },
    SystemPanicked { system: String, tick: Tick, reason: String },
    NamespaceRequired,
    Store(String),
    Io(String),
    Serde(String),
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldError::GameNotStarted => write!(f, "game state has not been loaded"),
            WorldError::GameAlreadyStarted => write!(f, "game has already been started"),
            WorldError::ComponentAlreadyRegistered { name } => {
                write!(f, "component {name} is already registered")
            }
            WorldError::ComponentNotRegistered { name } => {
                write!(f, "component {name} is not registered")
            }
            WorldError::ComponentAlreadyOnEntity { entity, component } => {
                write!(f, "entity {entity} already has component {component}")
            }
            WorldError::ComponentNotOnEntity { entity, component } => {
                write!(f, "entity {entity} does not have component {component}")
            }
            WorldError::EntityNotFound { entity } => write!(f, "entity {entity} does not exist"),
            WorldError::MessageAlreadyRegistered { name } => {
                write!(f, "message {name} is already registered")
            }
            WorldError::MessageNotRegistered { name } => {
                write!(f, "message {name} is not registered")
            }
            WorldError::QueryAlreadyRegistered { name } => {
                write!(f, "query {name} is already registered")
            }
            WorldError::QueryNotRegistered { name } => write!(f, "query {name} is not registered"),
            WorldError::QueryFailed { name, reason } => {
                write!(f, "query {name} failed: {reason}")
            }
            WorldError::SystemFailed { system, tick, reason } => {
                write!(f, "tick {tick}: system {system} failed: {reason}")
            }
            WorldError::SystemPanicked { system, tick, reason } => {
                write!(f, "tick {tick}: system {system} panicked: {reason}")
            }
            WorldError::NamespaceRequired => {
                write!(f, "a non-default namespace is required in production")
            }
            WorldError::Store(reason) => write!(f, "storage error: {reason}"),
            WorldError::Io(reason) => write!(f, "io error: {reason}"),
            WorldError::Serde(reason) => write!(f, "encoding error: {reason}"),
        }
    }
}

impl std::error::Error for WorldError {}

impl From<io::Error> for WorldError {
    fn from(error: io::Error) -> Self {
        WorldError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for WorldError {
    fn from(error: serde_json::Error) -> Self {
        WorldError::Serde(error.to_string())
    }
}
