use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::component::ComponentId;
use crate::entity::EntityId;

pub type ArchetypeId = u64;

/// One archetype: an unordered component set plus the ordered list of member
/// entities. Entity order is insertion order, which keeps iteration
/// deterministic across runs for a fixed registration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchetypeRecord {
    pub id: ArchetypeId,
    pub components: BTreeSet<ComponentId>,
    pub entities: Vec<EntityId>,
}

impl ArchetypeRecord {
    pub fn new(id: ArchetypeId, components: BTreeSet<ComponentId>) -> Self {
        Self {
            id,
            components,
            entities: Vec::new(),
        }
    }

    pub fn remove_entity(&mut self, entity: EntityId) {
        self.entities.retain(|member| *member != entity);
    }
}
