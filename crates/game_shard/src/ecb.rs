use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::component::ComponentId;
use crate::entity::EntityId;
use crate::error::WorldError;
use crate::search::Filter;
use crate::store::{FinalState, StateOp};

/// Entity-command buffer: the tick-local overlay over the last committed
/// snapshot. Reads consult the overlay first and fall through to the base;
/// writes only touch the overlay. `flush` turns the overlay into the ordered
/// op log for the tick's batch; dropping or `reset`ting the buffer discards
/// every write.
#[derive(Debug)]
pub struct EntityCommandBuffer {
    base: Arc<FinalState>,
    next_entity_id: EntityId,
    /// Current component set for entities touched this tick.
    component_sets: BTreeMap<EntityId, BTreeSet<ComponentId>>,
    created: Vec<EntityId>,
    destroyed: BTreeSet<EntityId>,
    writes: BTreeMap<EntityId, BTreeMap<ComponentId, JsonValue>>,
}

impl EntityCommandBuffer {
    pub fn new(base: Arc<FinalState>) -> Self {
        let next_entity_id = base.next_entity_id;
        Self {
            base,
            next_entity_id,
            component_sets: BTreeMap::new(),
            created: Vec::new(),
            destroyed: BTreeSet::new(),
            writes: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> &FinalState {
        &self.base
    }

    pub fn contains_entity(&self, entity: EntityId) -> bool {
        if self.destroyed.contains(&entity) {
            return false;
        }
        self.component_sets.contains_key(&entity) || self.base.contains_entity(entity)
    }

    pub fn entity_components(&self, entity: EntityId) -> Option<BTreeSet<ComponentId>> {
        if self.destroyed.contains(&entity) {
            return None;
        }
        if let Some(set) = self.component_sets.get(&entity) {
            return Some(set.clone());
        }
        self.base.entity_components(entity).cloned()
    }

    pub fn component_value(&self, entity: EntityId, component: ComponentId) -> Option<JsonValue> {
        let set = self.entity_components(entity)?;
        if !set.contains(&component) {
            return None;
        }
        if let Some(value) = self.writes.get(&entity).and_then(|values| values.get(&component)) {
            return Some(value.clone());
        }
        self.base.component_value(entity, component).cloned()
    }

    pub fn create_entity(&mut self, components: Vec<(ComponentId, JsonValue)>) -> EntityId {
        let entity = self.next_entity_id;
        self.next_entity_id += 1;
        let set: BTreeSet<ComponentId> = components.iter().map(|(id, _)| *id).collect();
        self.component_sets.insert(entity, set);
        self.created.push(entity);
        let values = self.writes.entry(entity).or_default();
        for (component, value) in components {
            values.insert(component, value);
        }
        entity
    }

    pub fn destroy_entity(&mut self, entity: EntityId) -> Result<(), WorldError> {
        if !self.contains_entity(entity) {
            return Err(WorldError::EntityNotFound { entity });
        }
        self.destroyed.insert(entity);
        self.component_sets.remove(&entity);
        self.writes.remove(&entity);
        Ok(())
    }

    /// Replaces the entity's component set. Values for components no longer
    /// in the set stop being readable immediately.
    pub fn set_entity_components(
        &mut self,
        entity: EntityId,
        components: BTreeSet<ComponentId>,
    ) -> Result<(), WorldError> {
        if !self.contains_entity(entity) {
            return Err(WorldError::EntityNotFound { entity });
        }
        self.component_sets.insert(entity, components);
        Ok(())
    }

    pub fn write_component(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        value: JsonValue,
    ) -> Result<(), WorldError> {
        if !self.contains_entity(entity) {
            return Err(WorldError::EntityNotFound { entity });
        }
        self.writes.entry(entity).or_default().insert(component, value);
        Ok(())
    }

    /// Entities matching `filter` against overlay state: base archetypes in
    /// creation order (entities in insertion order), then entities created
    /// this tick in creation order.
    pub fn matching_entities(&self, filter: &Filter) -> Vec<EntityId> {
        let mut matches = Vec::new();
        for record in &self.base.archetypes {
            for entity in &record.entities {
                if self.destroyed.contains(entity) {
                    continue;
                }
                let matched = match self.component_sets.get(entity) {
                    Some(set) => filter.matches(set),
                    None => filter.matches(&record.components),
                };
                if matched {
                    matches.push(*entity);
                }
            }
        }
        for entity in &self.created {
            if self.destroyed.contains(entity) {
                continue;
            }
            if let Some(set) = self.component_sets.get(entity) {
                if filter.matches(set) {
                    matches.push(*entity);
                }
            }
        }
        matches
    }

    /// Produces the ordered op log for the overlay: destroys, creations,
    /// archetype moves, then component writes. Deterministic for a given
    /// sequence of buffer operations.
    pub fn flush(&mut self) -> Vec<StateOp> {
        let mut ops = Vec::new();
        for entity in &self.destroyed {
            if self.base.contains_entity(*entity) {
                ops.push(StateOp::DestroyEntity { entity: *entity });
            }
        }
        for entity in &self.created {
            if self.destroyed.contains(entity) {
                continue;
            }
            if let Some(set) = self.component_sets.get(entity) {
                ops.push(StateOp::CreateEntity {
                    entity: *entity,
                    components: set.clone(),
                });
            }
        }
        for (entity, set) in &self.component_sets {
            if self.created.contains(entity) || self.destroyed.contains(entity) {
                continue;
            }
            if self.base.entity_components(*entity) != Some(set) {
                ops.push(StateOp::MoveEntity {
                    entity: *entity,
                    components: set.clone(),
                });
            }
        }
        for (entity, values) in &self.writes {
            if self.destroyed.contains(entity) {
                continue;
            }
            let set = match self.component_sets.get(entity) {
                Some(set) => Some(set.clone()),
                None => self.base.entity_components(*entity).cloned(),
            };
            let Some(set) = set else { continue };
            for (component, value) in values {
                if set.contains(component) {
                    ops.push(StateOp::SetComponent {
                        entity: *entity,
                        component: *component,
                        value: value.clone(),
                    });
                }
            }
        }
        self.reset();
        ops
    }

    pub fn reset(&mut self) {
        self.next_entity_id = self.base.next_entity_id;
        self.component_sets.clear();
        self.created.clear();
        self.destroyed.clear();
        self.writes.clear();
    }
}
