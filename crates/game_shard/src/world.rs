use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use game_shard_proto::SignedTransaction;

use crate::component::{Component, ComponentData, ComponentId, ComponentRegistry};
use crate::config::{WorldConfig, DEFAULT_NAMESPACE};
use crate::cql::{self, CqlError, QueryResponse};
use crate::ecb::EntityCommandBuffer;
use crate::entity::{EntityId, Tick};
use crate::error::WorldError;
use crate::events::EventHub;
use crate::message::{MessageId, MessageRegistry, MessageType};
use crate::nonce::NonceSet;
use crate::persona::{
    authorize_persona_address_msg, authorize_persona_address_system, create_persona_msg,
    persona_signer_status, register_persona_system, PersonaSignerReply, SignerComponent,
    CREATE_PERSONA_MESSAGE,
};
use crate::query::{QueryContext, QueryRegistry};
use crate::receipt::{Receipt, ReceiptHistory, ReceiptsReply, TickReceipts};
use crate::search::Filter;
use crate::store::{FinalState, LogStore, StateOp};
use crate::txpool::{QueuedTransaction, TxQueue};
use crate::verify::{verify_transaction, VerifyContext, VerifyError};

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Holder for the latest committed snapshot. Readers grab an `Arc` without
/// blocking the tick thread; a commit swaps the `Arc` atomically.
#[derive(Debug)]
pub struct SnapshotCell {
    inner: RwLock<Arc<FinalState>>,
}

impl SnapshotCell {
    fn new(state: Arc<FinalState>) -> Self {
        Self {
            inner: RwLock::new(state),
        }
    }

    pub fn get(&self) -> Arc<FinalState> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    fn replace(&self, state: Arc<FinalState>) {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = state;
    }
}

/// Per-system view of an in-progress tick: the ECS surface over the tick's
/// command buffer, the drained transactions, and the receipt accumulator.
pub struct SystemContext<'a> {
    tick: Tick,
    timestamp: u64,
    system_name: &'a str,
    registry: &'a ComponentRegistry,
    messages: &'a MessageRegistry,
    ecb: &'a mut EntityCommandBuffer,
    drained: &'a [QueuedTransaction],
    receipts: &'a mut TickReceipts,
    events_out: &'a mut Vec<String>,
    allowlist: &'a BTreeSet<String>,
    allowlist_enabled: bool,
}

impl<'a> SystemContext<'a> {
    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    /// Wall-clock milliseconds captured at tick start, clamped to be
    /// monotonic-non-decreasing across ticks.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn system_name(&self) -> &str {
        self.system_name
    }

    pub fn component_id<T: Component>(&self) -> Result<ComponentId, WorldError> {
        self.registry.id_of::<T>()
    }

    pub fn message_id(&self, name: &str) -> Result<MessageId, WorldError> {
        self.messages.id_by_name(name)
    }

    pub fn drained(&self) -> &[QueuedTransaction] {
        self.drained
    }

    pub fn set_result(&mut self, tx_hash: &str, result: JsonValue) {
        self.receipts.set_result(tx_hash, result);
    }

    pub fn add_error(&mut self, tx_hash: &str, error: impl Into<String>) {
        self.receipts.add_error(tx_hash, error);
    }

    /// Queues an event for publication after the tick commits. Events from a
    /// failed tick are discarded with the rest of its writes.
    pub fn emit_event(&mut self, event: impl Into<String>) {
        self.events_out.push(event.into());
    }

    pub fn allowlist_enabled(&self) -> bool {
        self.allowlist_enabled
    }

    pub fn allowlist_contains(&self, signer_address: &str) -> bool {
        self.allowlist.contains(signer_address)
    }

    pub fn search(&self, filter: &Filter) -> Vec<EntityId> {
        self.ecb.matching_entities(filter)
    }

    pub fn create(&mut self, components: Vec<ComponentData>) -> Result<EntityId, WorldError> {
        let mut resolved = Vec::with_capacity(components.len());
        for data in components {
            let id = self.registry.id_by_name(data.name)?;
            resolved.push((id, data.value));
        }
        Ok(self.ecb.create_entity(resolved))
    }

    pub fn create_many(
        &mut self,
        count: usize,
        components: Vec<ComponentData>,
    ) -> Result<Vec<EntityId>, WorldError> {
        let mut resolved = Vec::with_capacity(components.len());
        for data in components {
            let id = self.registry.id_by_name(data.name)?;
            resolved.push((id, data.value));
        }
        let mut entities = Vec::with_capacity(count);
        for _ in 0..count {
            entities.push(self.ecb.create_entity(resolved.clone()));
        }
        Ok(entities)
    }

    pub fn remove(&mut self, entity: EntityId) -> Result<(), WorldError> {
        self.ecb.destroy_entity(entity)
    }

    pub fn add_component<T: Component + Default>(
        &mut self,
        entity: EntityId,
    ) -> Result<(), WorldError> {
        let id = self.component_id::<T>()?;
        let mut set = self
            .ecb
            .entity_components(entity)
            .ok_or(WorldError::EntityNotFound { entity })?;
        if !set.insert(id) {
            return Err(WorldError::ComponentAlreadyOnEntity {
                entity,
                component: T::name().to_string(),
            });
        }
        self.ecb.set_entity_components(entity, set)?;
        self.ecb
            .write_component(entity, id, serde_json::to_value(T::default())?)
    }

    pub fn remove_component<T: Component>(&mut self, entity: EntityId) -> Result<(), WorldError> {
        let id = self.component_id::<T>()?;
        let mut set = self
            .ecb
            .entity_components(entity)
            .ok_or(WorldError::EntityNotFound { entity })?;
        if !set.remove(&id) {
            return Err(WorldError::ComponentNotOnEntity {
                entity,
                component: T::name().to_string(),
            });
        }
        self.ecb.set_entity_components(entity, set)
    }

    pub fn get_component<T: Component>(&self, entity: EntityId) -> Result<T, WorldError> {
        let id = self.registry.id_of::<T>()?;
        if !self.ecb.contains_entity(entity) {
            return Err(WorldError::EntityNotFound { entity });
        }
        let value = self
            .ecb
            .component_value(entity, id)
            .ok_or_else(|| WorldError::ComponentNotOnEntity {
                entity,
                component: T::name().to_string(),
            })?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn set_component<T: Component>(
        &mut self,
        entity: EntityId,
        component: &T,
    ) -> Result<(), WorldError> {
        let id = self.registry.id_of::<T>()?;
        let set = self
            .ecb
            .entity_components(entity)
            .ok_or(WorldError::EntityNotFound { entity })?;
        if !set.contains(&id) {
            return Err(WorldError::ComponentNotOnEntity {
                entity,
                component: T::name().to_string(),
            });
        }
        self.ecb
            .write_component(entity, id, serde_json::to_value(component)?)
    }

    pub fn update_component<T: Component>(
        &mut self,
        entity: EntityId,
        update: impl FnOnce(T) -> T,
    ) -> Result<(), WorldError> {
        let current = self.get_component::<T>(entity)?;
        let updated = update(current);
        self.set_component(entity, &updated)
    }
}

type SystemFn = Box<dyn Fn(&mut SystemContext<'_>) -> Result<(), WorldError> + Send + Sync>;

struct RegisteredSystem {
    name: String,
    func: SystemFn,
}

/// The deterministic simulation core: component/message/query registration,
/// the per-tick state machine, crash recovery, and the handles shared with
/// the HTTP edge.
pub struct World {
    config: WorldConfig,
    registry: ComponentRegistry,
    store: LogStore,
    init_systems: Vec<RegisteredSystem>,
    systems: Vec<RegisteredSystem>,
    messages: Arc<MessageRegistry>,
    queries: Arc<QueryRegistry>,
    queue: Arc<TxQueue>,
    nonces: Arc<NonceSet>,
    receipts: Arc<ReceiptHistory>,
    events: Arc<EventHub>,
    snapshot: Arc<SnapshotCell>,
    allowlist: BTreeSet<String>,
    started: bool,
    recovering: Arc<AtomicBool>,
    game_loop_running: Arc<AtomicBool>,
    server_running: Arc<AtomicBool>,
    last_timestamp: u64,
}

impl World {
    pub fn new(config: WorldConfig) -> Result<Self, WorldError> {
        if config.production && config.namespace == DEFAULT_NAMESPACE {
            return Err(WorldError::NamespaceRequired);
        }
        let store = match &config.state_dir {
            Some(dir) => LogStore::open(dir)?,
            None => LogStore::in_memory(),
        };
        let snapshot = Arc::new(SnapshotCell::new(store.state()));

        let mut registry = ComponentRegistry::new();
        registry.register(SignerComponent::name())?;

        let mut messages = MessageRegistry::new();
        messages.register(&create_persona_msg())?;
        messages.register(&authorize_persona_address_msg())?;

        let receipts = Arc::new(ReceiptHistory::new(config.receipt_history_size));

        let systems: Vec<RegisteredSystem> = vec![
            RegisteredSystem {
                name: "register_persona_system".to_string(),
                func: Box::new(register_persona_system),
            },
            RegisteredSystem {
                name: "authorize_persona_address_system".to_string(),
                func: Box::new(authorize_persona_address_system),
            },
        ];

        Ok(Self {
            config,
            registry,
            store,
            init_systems: Vec::new(),
            systems,
            messages: Arc::new(messages),
            queries: Arc::new(QueryRegistry::new()),
            queue: Arc::new(TxQueue::new()),
            nonces: Arc::new(NonceSet::new()),
            receipts,
            events: Arc::new(EventHub::new()),
            snapshot,
            allowlist: BTreeSet::new(),
            started: false,
            recovering: Arc::new(AtomicBool::new(false)),
            game_loop_running: Arc::new(AtomicBool::new(false)),
            server_running: Arc::new(AtomicBool::new(false)),
            last_timestamp: 0,
        })
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn current_tick(&self) -> Tick {
        self.store.state().tick
    }

    pub fn state(&self) -> Arc<FinalState> {
        self.snapshot.get()
    }

    pub fn register_component<T: Component>(&mut self) -> Result<(), WorldError> {
        if self.started {
            return Err(WorldError::GameAlreadyStarted);
        }
        self.registry.register(T::name())?;
        Ok(())
    }

    pub fn register_system(
        &mut self,
        name: impl Into<String>,
        system: impl Fn(&mut SystemContext<'_>) -> Result<(), WorldError> + Send + Sync + 'static,
    ) -> Result<(), WorldError> {
        if self.started {
            return Err(WorldError::GameAlreadyStarted);
        }
        self.systems.push(RegisteredSystem {
            name: name.into(),
            func: Box::new(system),
        });
        Ok(())
    }

    /// Registers a system that runs once, before the regular systems of tick
    /// 0 on a freshly-initialized world.
    pub fn register_init_system(
        &mut self,
        name: impl Into<String>,
        system: impl Fn(&mut SystemContext<'_>) -> Result<(), WorldError> + Send + Sync + 'static,
    ) -> Result<(), WorldError> {
        if self.started {
            return Err(WorldError::GameAlreadyStarted);
        }
        self.init_systems.push(RegisteredSystem {
            name: name.into(),
            func: Box::new(system),
        });
        Ok(())
    }

    pub fn register_message<Request, Result_>(
        &mut self,
        message: &MessageType<Request, Result_>,
    ) -> Result<(), WorldError>
    where
        Request: Serialize + DeserializeOwned + 'static,
        Result_: Serialize + DeserializeOwned + 'static,
    {
        if self.started {
            return Err(WorldError::GameAlreadyStarted);
        }
        let messages = Arc::get_mut(&mut self.messages).ok_or(WorldError::GameAlreadyStarted)?;
        messages.register(message)?;
        Ok(())
    }

    pub fn register_query<Request, Reply>(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(&QueryContext<'_>, Request) -> Result<Reply, String> + Send + Sync + 'static,
    ) -> Result<(), WorldError>
    where
        Request: DeserializeOwned + 'static,
        Reply: Serialize + 'static,
    {
        if self.started {
            return Err(WorldError::GameAlreadyStarted);
        }
        let queries = Arc::get_mut(&mut self.queries).ok_or(WorldError::GameAlreadyStarted)?;
        queries.register(name, handler)?;
        Ok(())
    }

    /// Adds a signer address to the persona-claim allowlist. Only consulted
    /// when the allowlist is enabled in the config.
    pub fn allow_signer_address(&mut self, signer_address: impl AsRef<str>) {
        self.allowlist
            .insert(game_shard_proto::address::normalize_signer_address(
                signer_address.as_ref(),
            ));
    }

    /// Loads (or initializes) the durable state and finishes any tick that
    /// was interrupted mid-commit. After this call, registration is closed
    /// and ticks may run.
    pub fn load_game_state(&mut self) -> Result<(), WorldError> {
        if self.started {
            return Err(WorldError::GameAlreadyStarted);
        }
        self.store.record_component_names(self.registry.names())?;
        let state = self.store.state();
        self.last_timestamp = state.timestamp;
        self.started = true;

        if let Some(pending) = self.store.pending().cloned() {
            if pending.tick == state.tick {
                self.recovering.store(true, Ordering::SeqCst);
                log::info!(
                    "recovering tick {} from pending batch ({} transactions)",
                    pending.tick,
                    pending.drained.len()
                );
                let result = self.execute_tick(pending.tick, pending.timestamp, &pending.drained);
                self.recovering.store(false, Ordering::SeqCst);
                result?;
            } else {
                // Stale batch from an already-committed tick.
                self.store.discard_batch()?;
            }
        }

        // The replay may have committed nonce pairs; the verifier checks the
        // in-memory set, so it must be seeded from the post-recovery state.
        self.nonces.load(self.store.state().used_nonces.clone());
        self.snapshot.replace(self.store.state());
        Ok(())
    }

    /// Runs one tick: drain, execute systems over a fresh command buffer,
    /// then commit atomically and publish receipts. On a system error the
    /// buffer is discarded, no write survives, and the durable pending batch
    /// keeps the drained transactions replayable.
    pub fn tick(&mut self) -> Result<(), WorldError> {
        if !self.started {
            return Err(WorldError::GameNotStarted);
        }
        let tick = self.store.state().tick;
        let timestamp = now_unix_ms().max(self.last_timestamp);

        let mut drained = match self.store.pending() {
            Some(pending) if pending.tick == tick => pending.drained.clone(),
            _ => Vec::new(),
        };
        drained.extend(self.queue.drain());

        self.store.begin_batch(tick, timestamp, drained.clone())?;
        match self.execute_tick(tick, timestamp, &drained) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!("tick {tick} failed: {err}");
                Err(err)
            }
        }
    }

    fn execute_tick(
        &mut self,
        tick: Tick,
        timestamp: u64,
        drained: &[QueuedTransaction],
    ) -> Result<(), WorldError> {
        let (ops, receipts, events) = self.run_systems(tick, timestamp, drained)?;
        self.store.append_ops(ops)?;
        let state = self.store.commit_batch()?;
        self.snapshot.replace(Arc::clone(&state));
        self.last_timestamp = timestamp;

        let receipts = receipts.into_receipts(tick);
        for event in events {
            self.events.publish(event);
        }
        self.publish_receipts(tick, &receipts);
        self.receipts.append(tick, receipts);
        log::debug!("tick {tick} committed");
        Ok(())
    }

    fn run_systems(
        &self,
        tick: Tick,
        timestamp: u64,
        drained: &[QueuedTransaction],
    ) -> Result<(Vec<StateOp>, TickReceipts, Vec<String>), WorldError> {
        let mut ecb = EntityCommandBuffer::new(self.store.state());
        let mut receipts = TickReceipts::for_drained(drained);
        let mut events_out = Vec::new();

        let init: &[RegisteredSystem] = if tick == 0 { &self.init_systems } else { &[] };
        for system in init.iter().chain(self.systems.iter()) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut ctx = SystemContext {
                    tick,
                    timestamp,
                    system_name: &system.name,
                    registry: &self.registry,
                    messages: &self.messages,
                    ecb: &mut ecb,
                    drained,
                    receipts: &mut receipts,
                    events_out: &mut events_out,
                    allowlist: &self.allowlist,
                    allowlist_enabled: self.config.allowlist_enabled,
                };
                (system.func)(&mut ctx)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    return Err(WorldError::SystemFailed {
                        system: system.name.clone(),
                        tick,
                        reason: err.to_string(),
                    });
                }
                Err(payload) => {
                    return Err(WorldError::SystemPanicked {
                        system: system.name.clone(),
                        tick,
                        reason: panic_reason(payload),
                    });
                }
            }
        }

        let mut ops = ecb.flush();
        let pairs: Vec<(String, u64)> = drained
            .iter()
            .filter(|queued| !queued.signer_address.is_empty())
            .map(|queued| (queued.signer_address.clone(), queued.envelope.nonce))
            .collect();
        if !pairs.is_empty() {
            ops.push(StateOp::UseNonces { pairs });
        }
        ops.push(StateOp::AdvanceTick { timestamp });
        Ok((ops, receipts, events_out))
    }

    fn publish_receipts(&self, tick: Tick, receipts: &[Receipt]) {
        if receipts.is_empty() {
            return;
        }
        match serde_json::to_string(&serde_json::json!({
            "tick": tick,
            "receipts": receipts,
        })) {
            Ok(event) => self.events.publish(event),
            Err(err) => log::error!("failed to encode receipts for tick {tick}: {err}"),
        }
    }

    /// Direct enqueue path for trusted callers (tests, in-process drivers):
    /// skips signature verification and gives the envelope a unique unsigned
    /// nonce so transaction hashes stay distinct.
    pub fn add_to_queue<Request, Result_>(
        &self,
        message: &MessageType<Request, Result_>,
        msg: Request,
        persona_tag: &str,
    ) -> Result<String, WorldError>
    where
        Request: Serialize + DeserializeOwned,
        Result_: Serialize,
    {
        let msg_id = self.messages.id_by_name(message.name())?;
        let nonce = self.queue.next_unsigned_nonce();
        let body = serde_json::to_value(&msg)?;
        let envelope =
            SignedTransaction::new_unsigned(persona_tag, &self.config.namespace, nonce, body);
        let tx_hash = envelope
            .hash_hex()
            .map_err(|err| WorldError::Serde(err.to_string()))?;
        let value = self.messages.decode(message.name(), &envelope.body)?;
        self.queue.add_transaction(QueuedTransaction {
            msg_id,
            tx_hash: tx_hash.clone(),
            signer_address: String::new(),
            envelope,
            value,
        });
        Ok(tx_hash)
    }

    /// Shared view for the HTTP edge and other threads: ingestion, queries,
    /// receipts, events, and health.
    pub fn handle(&self) -> ShardHandle {
        ShardHandle {
            config: self.config.clone(),
            registry: self.registry.clone(),
            messages: Arc::clone(&self.messages),
            queries: Arc::clone(&self.queries),
            queue: Arc::clone(&self.queue),
            nonces: Arc::clone(&self.nonces),
            receipts: Arc::clone(&self.receipts),
            events: Arc::clone(&self.events),
            snapshot: Arc::clone(&self.snapshot),
            recovering: Arc::clone(&self.recovering),
            game_loop_running: Arc::clone(&self.game_loop_running),
            server_running: Arc::clone(&self.server_running),
        }
    }

    /// Committed-state read of a component, for callers outside a tick.
    pub fn get_component<T: Component>(&self, entity: EntityId) -> Result<T, WorldError> {
        let state = self.snapshot.get();
        QueryContext::new(&state, &self.registry).get_component(entity)
    }

    pub fn receipts_for_tick(&self, tick: Tick) -> Option<Vec<Receipt>> {
        self.receipts.receipts_for_tick(tick)
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("namespace", &self.config.namespace)
            .field("tick", &self.store.state().tick)
            .field("started", &self.started)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitError {
    Recovering,
    UnknownMessage { name: String },
    MalformedBody { reason: String },
    Verify(VerifyError),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Recovering => write!(f, "game world is recovering state"),
            SubmitError::UnknownMessage { name } => write!(f, "unknown message {name}"),
            SubmitError::MalformedBody { reason } => write!(f, "malformed body: {reason}"),
            SubmitError::Verify(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Reply for the endpoints listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointsResult {
    pub tx_endpoints: Vec<String>,
    pub query_endpoints: Vec<String>,
    pub debug_endpoints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReply {
    pub is_server_running: bool,
    pub is_game_loop_running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEntity {
    pub id: EntityId,
    pub components: BTreeMap<String, JsonValue>,
}

/// Cloneable shared surface over a running world. Everything here reads the
/// committed snapshot or pushes into the ingestion queue; nothing blocks an
/// in-progress tick.
#[derive(Clone)]
pub struct ShardHandle {
    config: WorldConfig,
    registry: ComponentRegistry,
    messages: Arc<MessageRegistry>,
    queries: Arc<QueryRegistry>,
    queue: Arc<TxQueue>,
    nonces: Arc<NonceSet>,
    receipts: Arc<ReceiptHistory>,
    events: Arc<EventHub>,
    snapshot: Arc<SnapshotCell>,
    recovering: Arc<AtomicBool>,
    game_loop_running: Arc<AtomicBool>,
    server_running: Arc<AtomicBool>,
}

impl ShardHandle {
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn current_tick(&self) -> Tick {
        self.snapshot.get().tick
    }

    pub fn state(&self) -> Arc<FinalState> {
        self.snapshot.get()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    pub fn set_server_running(&self, running: bool) {
        self.server_running.store(running, Ordering::SeqCst);
    }

    pub fn subscribe_events(&self) -> Receiver<String> {
        self.events.subscribe()
    }

    /// Full ingestion pipeline for a wire envelope: message lookup, body
    /// decode, signature verification (including the atomic nonce write),
    /// then enqueue. Returns the transaction hash and the tick the
    /// transaction will be visible in.
    pub fn submit_transaction(
        &self,
        message_name: &str,
        mut tx: SignedTransaction,
        expect_system: bool,
    ) -> Result<(String, Tick), SubmitError> {
        if self.is_recovering() {
            return Err(SubmitError::Recovering);
        }
        let msg_id =
            self.messages
                .id_by_name(message_name)
                .map_err(|_| SubmitError::UnknownMessage {
                    name: message_name.to_string(),
                })?;

        let state = self.snapshot.get();
        let verify_ctx = VerifyContext {
            namespace: &self.config.namespace,
            disable_signature_verification: self.config.disable_signature_verification,
            state: &state,
            registry: &self.registry,
            nonces: &self.nonces,
        };
        let signer_address =
            verify_transaction(&verify_ctx, &mut tx, expect_system).map_err(SubmitError::Verify)?;

        let value = self
            .messages
            .decode(message_name, &tx.body)
            .map_err(|err| SubmitError::MalformedBody {
                reason: err.to_string(),
            })?;

        let tx_hash = tx.hash_hex().map_err(|err| SubmitError::MalformedBody {
            reason: err.to_string(),
        })?;
        self.queue.add_transaction(QueuedTransaction {
            msg_id,
            tx_hash: tx_hash.clone(),
            signer_address,
            envelope: tx,
            value,
        });
        Ok((tx_hash, state.tick))
    }

    pub fn parse_cql(&self, input: &str) -> Result<Filter, CqlError> {
        cql::parse(input, &self.registry)
    }

    pub fn evaluate_cql(&self, filter: &Filter) -> Result<Vec<QueryResponse>, WorldError> {
        let state = self.snapshot.get();
        cql::evaluate(filter, &state)
    }

    pub fn run_query(&self, name: &str, body: JsonValue) -> Result<JsonValue, WorldError> {
        let state = self.snapshot.get();
        let ctx = QueryContext::new(&state, &self.registry);
        self.queries.handle(name, &ctx, body)
    }

    pub fn receipts_since(&self, start_tick: Tick) -> ReceiptsReply {
        self.receipts.window(start_tick, self.current_tick())
    }

    pub fn persona_signer(&self, persona_tag: &str, tick: Tick) -> PersonaSignerReply {
        let state = self.snapshot.get();
        persona_signer_status(&state, &self.registry, persona_tag, tick)
    }

    pub fn endpoints(&self) -> EndpointsResult {
        let mut tx_endpoints = Vec::new();
        for message in self.messages.messages() {
            if message.name == CREATE_PERSONA_MESSAGE {
                tx_endpoints.push(format!("/tx/persona/{}", message.name));
            } else {
                tx_endpoints.push(format!("/tx/game/{}", message.name));
            }
        }
        let mut query_endpoints: Vec<String> = self
            .queries
            .names()
            .into_iter()
            .map(|name| format!("/query/game/{name}"))
            .collect();
        query_endpoints.extend([
            "/query/http/endpoints".to_string(),
            "/query/persona/signer".to_string(),
            "/query/receipts/list".to_string(),
            "/query/game/cql".to_string(),
        ]);
        EndpointsResult {
            tx_endpoints,
            query_endpoints,
            debug_endpoints: vec!["/debug/state".to_string()],
        }
    }

    pub fn health(&self) -> HealthReply {
        HealthReply {
            is_server_running: self.server_running.load(Ordering::SeqCst),
            is_game_loop_running: self.game_loop_running.load(Ordering::SeqCst),
        }
    }

    /// Dump of every live entity with decoded component values.
    pub fn debug_state(&self) -> Vec<DebugEntity> {
        let state = self.snapshot.get();
        let mut entities = Vec::new();
        for (entity, _) in &state.entity_archetype {
            let Some(components) = state.entity_components(*entity) else {
                continue;
            };
            let mut values = BTreeMap::new();
            for component in components {
                let name = self
                    .registry
                    .name_by_id(*component)
                    .unwrap_or("unknown")
                    .to_string();
                let value = state
                    .component_value(*entity, *component)
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                values.insert(name, value);
            }
            entities.push(DebugEntity {
                id: *entity,
                components: values,
            });
        }
        entities
    }
}

/// What drives ticks: a fixed interval or an injected channel (used by tests
/// and recovery tooling to step the world manually).
pub enum TickSource {
    Interval(Duration),
    Channel(Receiver<()>),
}

/// Owns the game-loop thread. Dropping the handle leaves the loop running;
/// `shutdown` interrupts the idle wait and returns the world after any
/// in-progress tick finishes.
pub struct GameLoopHandle {
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<World>>,
}

impl GameLoopHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(mut self) -> Result<World, WorldError> {
        self.shutdown.store(true, Ordering::SeqCst);
        let join = self.join.take().ok_or(WorldError::GameNotStarted)?;
        join.join()
            .map_err(|_| WorldError::Io("game loop thread panicked".to_string()))
    }
}

/// Spawns the tick loop on its own thread. Tick errors are logged and the
/// loop keeps serving; the failed tick's transactions stay replayable in the
/// pending batch.
pub fn spawn_game_loop(world: World, ticks: TickSource) -> GameLoopHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let running = Arc::clone(&world.game_loop_running);
    let flag = Arc::clone(&shutdown);
    let join = thread::spawn(move || {
        let mut world = world;
        world.game_loop_running.store(true, Ordering::SeqCst);
        loop {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            let fire = match &ticks {
                TickSource::Interval(interval) => wait_interval(&flag, *interval),
                TickSource::Channel(receiver) => {
                    match receiver.recv_timeout(Duration::from_millis(100)) {
                        Ok(()) => true,
                        Err(RecvTimeoutError::Timeout) => false,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            };
            if fire && !flag.load(Ordering::SeqCst) {
                if let Err(err) = world.tick() {
                    log::error!("game loop: {err}");
                }
            }
        }
        world.game_loop_running.store(false, Ordering::SeqCst);
        world
    });
    GameLoopHandle {
        shutdown,
        running,
        join: Some(join),
    }
}

fn wait_interval(shutdown: &AtomicBool, interval: Duration) -> bool {
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(Duration::from_millis(25).min(interval));
    }
    !shutdown.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    impl Component for Counter {
        fn name() -> &'static str {
            "counter"
        }
    }

    fn test_world() -> World {
        let config = WorldConfig::default().with_namespace("test-ns");
        World::new(config).expect("world")
    }

    #[test]
    fn tick_before_load_fails() {
        let mut world = test_world();
        assert_eq!(world.tick(), Err(WorldError::GameNotStarted));
    }

    #[test]
    fn registration_is_closed_after_load() {
        let mut world = test_world();
        world.load_game_state().expect("load");
        assert_eq!(
            world.register_component::<Counter>(),
            Err(WorldError::GameAlreadyStarted)
        );
        assert_eq!(
            world.register_system("late", |_ctx| Ok(())),
            Err(WorldError::GameAlreadyStarted)
        );
    }

    #[test]
    fn production_requires_non_default_namespace() {
        let config = WorldConfig::default().with_production(true);
        assert_eq!(World::new(config).err(), Some(WorldError::NamespaceRequired));
    }

    #[test]
    fn ticks_advance_by_exactly_one() {
        let mut world = test_world();
        world.load_game_state().expect("load");
        for expected in 0..10u64 {
            assert_eq!(world.current_tick(), expected);
            world.tick().expect("tick");
        }
        assert_eq!(world.current_tick(), 10);
    }

    #[test]
    fn init_system_runs_only_on_tick_zero() {
        let mut world = test_world();
        world.register_component::<Counter>().expect("register");
        world
            .register_init_system("seed", |ctx| {
                let data = ComponentData::of(&Counter { value: 0 })?;
                ctx.create(vec![data])?;
                Ok(())
            })
            .expect("register");
        world.load_game_state().expect("load");
        world.tick().expect("tick 0");
        world.tick().expect("tick 1");
        let state = world.state();
        let counter_id = 1u32; // SignerComponent is 0, counter is 1
        assert_eq!(
            state.matching_entities(&Filter::contains([counter_id])).len(),
            1
        );
    }

    #[test]
    fn system_writes_survive_ticks_and_are_ordered() {
        let mut world = test_world();
        world.register_component::<Counter>().expect("register");
        world
            .register_init_system("seed", |ctx| {
                let data = ComponentData::of(&Counter { value: 0 })?;
                ctx.create(vec![data])?;
                Ok(())
            })
            .expect("register");
        world
            .register_system("increment", |ctx| {
                let id = ctx.component_id::<Counter>()?;
                for entity in ctx.search(&Filter::contains([id])) {
                    ctx.update_component::<Counter>(entity, |mut counter| {
                        counter.value += 1;
                        counter
                    })?;
                }
                Ok(())
            })
            .expect("register");
        world
            .register_system("double_check", |ctx| {
                // Later systems observe earlier systems' writes in the same tick.
                let id = ctx.component_id::<Counter>()?;
                for entity in ctx.search(&Filter::contains([id])) {
                    let counter: Counter = ctx.get_component(entity)?;
                    if counter.value as u64 != ctx.current_tick() + 1 {
                        return Err(WorldError::Store("ordering violated".to_string()));
                    }
                }
                Ok(())
            })
            .expect("register");
        world.load_game_state().expect("load");
        world.tick().expect("tick 0");
        world.tick().expect("tick 1");
        world.tick().expect("tick 2");

        let state = world.state();
        let entity = state.matching_entities(&Filter::contains([1]))[0];
        let counter: Counter = world.get_component(entity).expect("read");
        assert_eq!(counter.value, 3);
    }

    #[test]
    fn failed_system_rolls_back_every_write() {
        let mut world = test_world();
        world.register_component::<Counter>().expect("register");
        world
            .register_init_system("seed", |ctx| {
                let data = ComponentData::of(&Counter { value: 0 })?;
                ctx.create(vec![data])?;
                Ok(())
            })
            .expect("register");
        world
            .register_system("increment_then_fail_on_third", |ctx| {
                let id = ctx.component_id::<Counter>()?;
                for entity in ctx.search(&Filter::contains([id])) {
                    ctx.update_component::<Counter>(entity, |mut counter| {
                        counter.value += 1;
                        counter
                    })?;
                }
                if ctx.current_tick() == 2 {
                    return Err(WorldError::Store("tick 2 is cursed".to_string()));
                }
                Ok(())
            })
            .expect("register");
        world.load_game_state().expect("load");
        world.tick().expect("tick 0");
        world.tick().expect("tick 1");
        assert!(matches!(
            world.tick(),
            Err(WorldError::SystemFailed { tick: 2, .. })
        ));
        // Tick did not advance and the write was rolled back.
        assert_eq!(world.current_tick(), 2);
        let state = world.state();
        let entity = state.matching_entities(&Filter::contains([1]))[0];
        let counter: Counter = world.get_component(entity).expect("read");
        assert_eq!(counter.value, 2);
    }

    #[test]
    fn panicking_system_is_captured_and_rolled_back() {
        let mut world = test_world();
        world
            .register_system("panics", |ctx| {
                if ctx.current_tick() == 1 {
                    panic!("boom");
                }
                Ok(())
            })
            .expect("register");
        world.load_game_state().expect("load");
        world.tick().expect("tick 0");
        let err = world.tick().expect_err("tick 1 panics");
        assert!(matches!(
            err,
            WorldError::SystemPanicked { tick: 1, ref reason, .. } if reason == "boom"
        ));
        assert_eq!(world.current_tick(), 1);
        // The next tick replays the failed tick number.
        let err = world.tick().expect_err("still panicking");
        assert!(matches!(err, WorldError::SystemPanicked { tick: 1, .. }));
    }

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Toggle {
        value: i64,
    }

    impl Component for Toggle {
        fn name() -> &'static str {
            "toggle"
        }
    }

    #[test]
    fn adding_and_removing_components_moves_archetypes() {
        let mut world = test_world();
        world.register_component::<Counter>().expect("register");
        world.register_component::<Toggle>().expect("register");
        world
            .register_init_system("seed", |ctx| {
                let data = ComponentData::of(&Counter { value: 0 })?;
                ctx.create(vec![data])?;
                Ok(())
            })
            .expect("register");
        world
            .register_system("toggle", |ctx| {
                let counter_id = ctx.component_id::<Counter>()?;
                for entity in ctx.search(&Filter::contains([counter_id])) {
                    ctx.update_component::<Counter>(entity, |mut counter| {
                        counter.value += 1;
                        counter
                    })?;
                    let counter: Counter = ctx.get_component(entity)?;
                    if counter.value % 2 == 1 {
                        ctx.add_component::<Toggle>(entity)?;
                    } else {
                        ctx.remove_component::<Toggle>(entity)?;
                    }
                }
                Ok(())
            })
            .expect("register");
        world.load_game_state().expect("load");

        let counter_id = 1u32;
        let toggle_id = 2u32;

        world.tick().expect("tick 0");
        let state = world.state();
        let entity = state.matching_entities(&Filter::contains([counter_id]))[0];
        assert_eq!(
            state.matching_entities(&Filter::exact([counter_id, toggle_id])),
            vec![entity]
        );
        let toggle: Toggle = world.get_component(entity).expect("toggle present");
        assert_eq!(toggle, Toggle::default());

        world.tick().expect("tick 1");
        let state = world.state();
        assert!(state
            .matching_entities(&Filter::exact([counter_id, toggle_id]))
            .is_empty());
        assert_eq!(
            state.matching_entities(&Filter::exact([counter_id])),
            vec![entity]
        );
        assert!(matches!(
            world.get_component::<Toggle>(entity),
            Err(WorldError::ComponentNotOnEntity { .. })
        ));

        // The entity is still findable by its remaining component.
        let counter: Counter = world.get_component(entity).expect("counter");
        assert_eq!(counter.value, 2);
    }

    #[test]
    fn removed_entities_disappear_from_search() {
        let mut world = test_world();
        world.register_component::<Counter>().expect("register");
        world
            .register_init_system("seed", |ctx| {
                let data = ComponentData::of(&Counter { value: 0 })?;
                ctx.create(vec![data.clone()])?;
                ctx.create(vec![data])?;
                Ok(())
            })
            .expect("register");
        world
            .register_system("cull_first", |ctx| {
                if ctx.current_tick() == 1 {
                    let id = ctx.component_id::<Counter>()?;
                    let entities = ctx.search(&Filter::contains([id]));
                    ctx.remove(entities[0])?;
                }
                Ok(())
            })
            .expect("register");
        world.load_game_state().expect("load");

        world.tick().expect("tick 0");
        assert_eq!(world.state().matching_entities(&Filter::contains([1u32])).len(), 2);
        world.tick().expect("tick 1");
        let state = world.state();
        let remaining = state.matching_entities(&Filter::contains([1u32]));
        assert_eq!(remaining.len(), 1);
        assert!(!state.contains_entity(1));
        assert!(matches!(
            world.get_component::<Counter>(1),
            Err(WorldError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn tick_timestamps_never_regress() {
        let mut world = test_world();
        world.load_game_state().expect("load");
        let mut last = 0;
        for _ in 0..5 {
            world.tick().expect("tick");
            let timestamp = world.state().timestamp;
            assert!(timestamp >= last);
            last = timestamp;
        }
    }

    #[test]
    fn receipts_exist_for_every_drained_transaction() {
        let mut world = test_world();
        let noop: MessageType<Counter, Counter> = MessageType::new("noop");
        world.register_message(&noop).expect("register");
        world.load_game_state().expect("load");
        let hash = world
            .add_to_queue(&noop, Counter { value: 1 }, "tester")
            .expect("queue");
        world.tick().expect("tick");
        let receipts = world.receipts_for_tick(0).expect("receipts");
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].tx_hash, hash);
        assert_eq!(receipts[0].result, None);
        assert!(receipts[0].errors.is_empty());
    }

    #[test]
    fn events_publish_only_after_commit() {
        let mut world = test_world();
        world
            .register_system("emitter", |ctx| {
                ctx.emit_event(format!("tick-{}", ctx.current_tick()));
                if ctx.current_tick() == 1 {
                    return Err(WorldError::Store("no events for tick 1".to_string()));
                }
                Ok(())
            })
            .expect("register");
        let handle = world.handle();
        let receiver = handle.subscribe_events();
        world.load_game_state().expect("load");
        world.tick().expect("tick 0");
        assert!(world.tick().is_err());
        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(1)).expect("event"),
            "tick-0"
        );
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn game_loop_ticks_on_channel_signals() {
        let mut world = test_world();
        world.load_game_state().expect("load");
        let handle = world.handle();
        let (sender, receiver) = std::sync::mpsc::channel();
        let game_loop = spawn_game_loop(world, TickSource::Channel(receiver));
        sender.send(()).expect("signal");
        sender.send(()).expect("signal");
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.current_tick() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.current_tick(), 2);
        assert!(game_loop.is_running());
        let world = game_loop.shutdown().expect("shutdown");
        assert_eq!(world.current_tick(), 2);
    }
}
