use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::archetype::{ArchetypeId, ArchetypeRecord};
use crate::component::ComponentId;
use crate::entity::{EntityId, Tick, FIRST_ENTITY_ID};
use crate::error::WorldError;
use crate::search::Filter;
use crate::txpool::QueuedTransaction;

pub const STATE_VERSION: u32 = 1;

const STATE_FILE: &str = "state.json";
const PENDING_FILE: &str = "pending.json";

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    BatchAlreadyOpen { pending_tick: Tick, requested_tick: Tick },
    NoOpenBatch,
    UnknownEntity { entity: EntityId },
    EntityExists { entity: EntityId },
    UnsupportedVersion { version: u32, expected: u32 },
    ComponentRegistryMismatch { persisted: Vec<String>, registered: Vec<String> },
    Io(String),
    Serde(String),
}

impl From<io::Error> for StoreError {
    fn from(error: io::Error) -> Self {
        StoreError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serde(error.to_string())
    }
}

impl From<StoreError> for WorldError {
    fn from(error: StoreError) -> Self {
        WorldError::Store(format!("{error:?}"))
    }
}

/// One primitive state operation recorded by a tick. Applying a batch of ops
/// in order transforms the previous committed state into the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum StateOp {
    CreateEntity {
        entity: EntityId,
        components: BTreeSet<ComponentId>,
    },
    DestroyEntity {
        entity: EntityId,
    },
    MoveEntity {
        entity: EntityId,
        components: BTreeSet<ComponentId>,
    },
    SetComponent {
        entity: EntityId,
        component: ComponentId,
        value: JsonValue,
    },
    UseNonces {
        pairs: Vec<(String, u64)>,
    },
    AdvanceTick {
        timestamp: u64,
    },
}

fn default_state_version() -> u32 {
    STATE_VERSION
}

/// The committed snapshot: everything needed to resume the shard after a
/// restart. `tick` is the next tick to be produced; receipts exist only for
/// ticks below it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalState {
    #[serde(default = "default_state_version")]
    pub version: u32,
    pub tick: Tick,
    pub timestamp: u64,
    pub component_names: Vec<String>,
    pub next_entity_id: EntityId,
    pub archetypes: Vec<ArchetypeRecord>,
    pub entity_archetype: BTreeMap<EntityId, ArchetypeId>,
    pub components: BTreeMap<EntityId, BTreeMap<ComponentId, JsonValue>>,
    pub used_nonces: BTreeSet<(String, u64)>,
}

impl Default for FinalState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            tick: 0,
            timestamp: 0,
            component_names: Vec::new(),
            next_entity_id: FIRST_ENTITY_ID,
            archetypes: Vec::new(),
            entity_archetype: BTreeMap::new(),
            components: BTreeMap::new(),
            used_nonces: BTreeSet::new(),
        }
    }
}

impl FinalState {
    fn validate_version(&self) -> Result<(), StoreError> {
        if self.version == STATE_VERSION {
            Ok(())
        } else {
            Err(StoreError::UnsupportedVersion {
                version: self.version,
                expected: STATE_VERSION,
            })
        }
    }

    pub fn contains_entity(&self, entity: EntityId) -> bool {
        self.entity_archetype.contains_key(&entity)
    }

    pub fn entity_components(&self, entity: EntityId) -> Option<&BTreeSet<ComponentId>> {
        let archetype = self.entity_archetype.get(&entity)?;
        self.archetypes
            .get(*archetype as usize)
            .map(|record| &record.components)
    }

    pub fn component_value(&self, entity: EntityId, component: ComponentId) -> Option<&JsonValue> {
        self.components.get(&entity)?.get(&component)
    }

    /// Entities matching `filter`, iterated archetype-by-archetype in
    /// archetype creation order, entities in insertion order.
    pub fn matching_entities(&self, filter: &Filter) -> Vec<EntityId> {
        let mut matches = Vec::new();
        for record in &self.archetypes {
            if filter.matches(&record.components) {
                matches.extend(record.entities.iter().copied());
            }
        }
        matches
    }

    fn archetype_for(&self, components: &BTreeSet<ComponentId>) -> Option<ArchetypeId> {
        self.archetypes
            .iter()
            .find(|record| &record.components == components)
            .map(|record| record.id)
    }

    fn ensure_archetype(&mut self, components: BTreeSet<ComponentId>) -> ArchetypeId {
        if let Some(id) = self.archetype_for(&components) {
            return id;
        }
        let id = self.archetypes.len() as ArchetypeId;
        self.archetypes.push(ArchetypeRecord::new(id, components));
        id
    }

    pub fn apply_op(&mut self, op: &StateOp) -> Result<(), StoreError> {
        match op {
            StateOp::CreateEntity { entity, components } => {
                if self.contains_entity(*entity) {
                    return Err(StoreError::EntityExists { entity: *entity });
                }
                let archetype = self.ensure_archetype(components.clone());
                self.archetypes[archetype as usize].entities.push(*entity);
                self.entity_archetype.insert(*entity, archetype);
                if *entity >= self.next_entity_id {
                    self.next_entity_id = entity + 1;
                }
            }
            StateOp::DestroyEntity { entity } => {
                let archetype = self
                    .entity_archetype
                    .remove(entity)
                    .ok_or(StoreError::UnknownEntity { entity: *entity })?;
                self.archetypes[archetype as usize].remove_entity(*entity);
                self.components.remove(entity);
            }
            StateOp::MoveEntity { entity, components } => {
                let old = self
                    .entity_archetype
                    .get(entity)
                    .copied()
                    .ok_or(StoreError::UnknownEntity { entity: *entity })?;
                self.archetypes[old as usize].remove_entity(*entity);
                let archetype = self.ensure_archetype(components.clone());
                self.archetypes[archetype as usize].entities.push(*entity);
                self.entity_archetype.insert(*entity, archetype);
                if let Some(values) = self.components.get_mut(entity) {
                    values.retain(|component, _| components.contains(component));
                }
            }
            StateOp::SetComponent { entity, component, value } => {
                if !self.contains_entity(*entity) {
                    return Err(StoreError::UnknownEntity { entity: *entity });
                }
                self.components
                    .entry(*entity)
                    .or_default()
                    .insert(*component, value.clone());
            }
            StateOp::UseNonces { pairs } => {
                for pair in pairs {
                    self.used_nonces.insert(pair.clone());
                }
            }
            StateOp::AdvanceTick { timestamp } => {
                self.tick += 1;
                self.timestamp = *timestamp;
            }
        }
        Ok(())
    }
}

/// The inputs and op log of the tick currently being produced. Persisted at
/// batch start so a crash mid-tick can re-derive the tick from the same
/// inputs; ops live in memory only and are regenerated on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub tick: Tick,
    pub timestamp: u64,
    pub drained: Vec<QueuedTransaction>,
    #[serde(default, skip_serializing)]
    pub ops: Vec<StateOp>,
}

/// Durable key-value log with two regions: the committed [`FinalState`] and
/// at most one [`PendingBatch`]. When bound to a directory, both regions are
/// persisted as JSON with write-to-temp-then-rename, so a power loss leaves
/// either the pre-tick state alone or the pre-tick state plus a complete
/// pending batch.
#[derive(Debug)]
pub struct LogStore {
    dir: Option<PathBuf>,
    state: Arc<FinalState>,
    pending: Option<PendingBatch>,
}

impl LogStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            state: Arc::new(FinalState::default()),
            pending: None,
        }
    }

    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let state_path = dir.join(STATE_FILE);
        let state: FinalState = if state_path.exists() {
            let loaded: FinalState = read_json_from_path(&state_path)?;
            loaded.validate_version()?;
            loaded
        } else {
            FinalState::default()
        };
        let pending_path = dir.join(PENDING_FILE);
        let pending = if pending_path.exists() {
            Some(read_json_from_path(&pending_path)?)
        } else {
            None
        };
        Ok(Self {
            dir: Some(dir),
            state: Arc::new(state),
            pending,
        })
    }

    pub fn state(&self) -> Arc<FinalState> {
        Arc::clone(&self.state)
    }

    pub fn pending(&self) -> Option<&PendingBatch> {
        self.pending.as_ref()
    }

    /// Reconciles the registered component names with the persisted registry
    /// metadata. Existing names must match registered names exactly and in
    /// order; new names may only be appended.
    pub fn record_component_names(&mut self, registered: &[String]) -> Result<(), StoreError> {
        let persisted = &self.state.component_names;
        if persisted.len() > registered.len()
            || persisted.as_slice() != &registered[..persisted.len()]
        {
            return Err(StoreError::ComponentRegistryMismatch {
                persisted: persisted.clone(),
                registered: registered.to_vec(),
            });
        }
        if persisted.len() != registered.len() {
            let mut next = (*self.state).clone();
            next.component_names = registered.to_vec();
            self.install_state(next)?;
        }
        Ok(())
    }

    pub fn begin_batch(
        &mut self,
        tick: Tick,
        timestamp: u64,
        drained: Vec<QueuedTransaction>,
    ) -> Result<(), StoreError> {
        if let Some(pending) = &self.pending {
            if pending.tick != tick {
                return Err(StoreError::BatchAlreadyOpen {
                    pending_tick: pending.tick,
                    requested_tick: tick,
                });
            }
        }
        let batch = PendingBatch {
            tick,
            timestamp,
            drained,
            ops: Vec::new(),
        };
        self.persist_pending(&batch)?;
        self.pending = Some(batch);
        Ok(())
    }

    pub fn append_ops(&mut self, ops: Vec<StateOp>) -> Result<(), StoreError> {
        let pending = self.pending.as_mut().ok_or(StoreError::NoOpenBatch)?;
        pending.ops.extend(ops);
        Ok(())
    }

    /// Applies the pending ops to the committed state, persists the new
    /// state, and clears the pending batch. On failure the batch is left in
    /// place so the tick can be re-derived.
    pub fn commit_batch(&mut self) -> Result<Arc<FinalState>, StoreError> {
        let batch = self.pending.take().ok_or(StoreError::NoOpenBatch)?;
        let mut next = (*self.state).clone();
        for op in &batch.ops {
            if let Err(err) = next.apply_op(op) {
                self.pending = Some(batch);
                return Err(err);
            }
        }
        if let Err(err) = self.install_state(next) {
            self.pending = Some(batch);
            return Err(err);
        }
        self.clear_pending_file()?;
        Ok(self.state())
    }

    pub fn discard_batch(&mut self) -> Result<(), StoreError> {
        self.pending = None;
        self.clear_pending_file()
    }

    fn install_state(&mut self, next: FinalState) -> Result<(), StoreError> {
        if let Some(dir) = &self.dir {
            write_json_atomic(&dir.join(STATE_FILE), &next)?;
        }
        self.state = Arc::new(next);
        Ok(())
    }

    fn persist_pending(&self, batch: &PendingBatch) -> Result<(), StoreError> {
        if let Some(dir) = &self.dir {
            write_json_atomic(&dir.join(PENDING_FILE), batch)?;
        }
        Ok(())
    }

    fn clear_pending_file(&self) -> Result<(), StoreError> {
        if let Some(dir) = &self.dir {
            let path = dir.join(PENDING_FILE);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json_from_path<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}
