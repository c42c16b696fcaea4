use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::component::{Component, ComponentRegistry};
use crate::entity::{EntityId, Tick};
use crate::error::WorldError;
use crate::search::Filter;
use crate::store::FinalState;

/// Read-only view over the last committed state, handed to query handlers.
/// There is no write surface: queries cannot touch world state.
pub struct QueryContext<'a> {
    state: &'a FinalState,
    registry: &'a ComponentRegistry,
}

impl<'a> QueryContext<'a> {
    pub fn new(state: &'a FinalState, registry: &'a ComponentRegistry) -> Self {
        Self { state, registry }
    }

    pub fn current_tick(&self) -> Tick {
        self.state.tick
    }

    pub fn registry(&self) -> &ComponentRegistry {
        self.registry
    }

    pub fn search(&self, filter: &Filter) -> Vec<EntityId> {
        self.state.matching_entities(filter)
    }

    pub fn contains_entity(&self, entity: EntityId) -> bool {
        self.state.contains_entity(entity)
    }

    pub fn get_component<T: Component>(&self, entity: EntityId) -> Result<T, WorldError> {
        let id = self.registry.id_of::<T>()?;
        if !self.state.contains_entity(entity) {
            return Err(WorldError::EntityNotFound { entity });
        }
        let value = self
            .state
            .component_value(entity, id)
            .ok_or_else(|| WorldError::ComponentNotOnEntity {
                entity,
                component: T::name().to_string(),
            })?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

struct RegisteredQuery {
    name: String,
    handler: Box<dyn Fn(&QueryContext<'_>, JsonValue) -> Result<JsonValue, WorldError> + Send + Sync>,
}

/// Name-keyed registry of synchronous query handlers run against the last
/// committed snapshot. Registration is one-shot per world.
#[derive(Default)]
pub struct QueryRegistry {
    queries: Vec<RegisteredQuery>,
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.names();
        f.debug_struct("QueryRegistry").field("queries", &names).finish()
    }
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<Request, Reply>(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(&QueryContext<'_>, Request) -> Result<Reply, String> + Send + Sync + 'static,
    ) -> Result<(), WorldError>
    where
        Request: DeserializeOwned + 'static,
        Reply: Serialize + 'static,
    {
        let name = name.into();
        if self.queries.iter().any(|query| query.name == name) {
            return Err(WorldError::QueryAlreadyRegistered { name });
        }
        let query_name = name.clone();
        self.queries.push(RegisteredQuery {
            name,
            handler: Box::new(move |ctx, body| {
                let request: Request = serde_json::from_value(body)?;
                let reply = handler(ctx, request).map_err(|reason| WorldError::QueryFailed {
                    name: query_name.clone(),
                    reason,
                })?;
                Ok(serde_json::to_value(reply)?)
            }),
        });
        Ok(())
    }

    pub fn handle(
        &self,
        name: &str,
        ctx: &QueryContext<'_>,
        body: JsonValue,
    ) -> Result<JsonValue, WorldError> {
        let query = self
            .queries
            .iter()
            .find(|query| query.name == name)
            .ok_or_else(|| WorldError::QueryNotRegistered {
                name: name.to_string(),
            })?;
        (query.handler)(ctx, body)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queries.iter().any(|query| query.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.queries.iter().map(|query| query.name.as_str()).collect()
    }
}
