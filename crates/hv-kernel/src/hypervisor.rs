use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use futures::FutureExt;
use hv_cbor::Hash;
use hv_store::{StateTree, Store};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::actor::Actor;
use crate::config::{HypervisorConfig, IdentityScheme};
use crate::container::{
    ActorDirectory, ContainerFactory, ContainerRegistry, ModuleHandle, PendingActor,
};
use crate::driver::{Dispatch, Driver, HypervisorHandle};
use crate::error::{ExecutionError, KernelError, panic_reason};
use crate::id::{ActorId, derive_id};
use crate::message::{Destination, IntoMessages, Message, MessageReceipt};
use crate::record::{self, ActorRecord};
use crate::scheduler::Scheduler;

struct TreeState<S: Store> {
    tree: StateTree<S>,
    /// Global creation nonce for top-level actors.
    nonce: u64,
}

struct Inner<S: Store> {
    state: Mutex<TreeState<S>>,
    scheduler: Scheduler,
    registry: RwLock<Arc<ContainerRegistry>>,
    config: HypervisorConfig,
    /// Serializes idle waits and state-root creation.
    snapshot: tokio::sync::Mutex<()>,
    runtime: Handle,
}

/// Owns the state tree and the scheduler; creates, loads and drives actors.
///
/// Cheap to clone. Drivers only ever get a [`HypervisorHandle`].
pub struct Hypervisor<S: Store> {
    inner: Arc<Inner<S>>,
}

impl<S: Store> Clone for Hypervisor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub struct HypervisorBuilder<S: Store> {
    store: Arc<S>,
    config: HypervisorConfig,
    root: Option<Hash>,
    containers: Vec<Arc<dyn ContainerFactory>>,
    drivers: Vec<Arc<dyn Driver>>,
}

impl<S: Store + 'static> HypervisorBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: HypervisorConfig::default(),
            root: None,
            containers: Vec::new(),
            drivers: Vec::new(),
        }
    }

    pub fn config(mut self, config: HypervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from an existing state root instead of an empty tree.
    pub fn root(mut self, root: Hash) -> Self {
        self.root = Some(root);
        self
    }

    pub fn container(mut self, factory: impl ContainerFactory + 'static) -> Self {
        self.containers.push(Arc::new(factory));
        self
    }

    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Must be called from within a tokio runtime; message delivery is spawned
    /// onto it. Runs every driver's startup hook.
    pub async fn build(self) -> Result<Hypervisor<S>, KernelError> {
        let tree = match self.root {
            Some(root) => StateTree::open(self.store, root)?,
            None => StateTree::new(self.store)?,
        };
        let nonce = record::read_nonce(&tree)?;

        let mut registry = ContainerRegistry::default();
        for factory in self.containers {
            registry.register(factory);
        }

        let mut drivers: BTreeMap<String, Arc<dyn Driver>> = BTreeMap::new();
        for driver in &self.drivers {
            let id = driver.id().to_string();
            if drivers.insert(id.clone(), driver.clone()).is_some() {
                return Err(KernelError::DuplicateDriver(id));
            }
        }
        if let Some(default) = &self.config.default_driver {
            if !drivers.contains_key(default) {
                warn!("default driver '{default}' is not registered");
            }
        }

        let inner = Arc::new(Inner {
            state: Mutex::new(TreeState { tree, nonce }),
            scheduler: Scheduler::new(drivers),
            registry: RwLock::new(Arc::new(registry)),
            config: self.config,
            snapshot: tokio::sync::Mutex::new(()),
            runtime: Handle::current(),
        });

        let weak: Weak<dyn Dispatch> = Arc::downgrade(&inner) as Weak<dyn Dispatch>;
        for driver in self.drivers {
            driver
                .startup(HypervisorHandle::new(weak.clone()))
                .await
                .map_err(|e| KernelError::DriverStartup {
                    id: driver.id().to_string(),
                    reason: format!("{e:#}"),
                })?;
            debug!("driver '{}' started", driver.id());
        }

        Ok(Hypervisor { inner })
    }
}

impl<S: Store + 'static> Hypervisor<S> {
    pub fn builder(store: Arc<S>) -> HypervisorBuilder<S> {
        HypervisorBuilder::new(store)
    }

    pub fn config(&self) -> &HypervisorConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn handle(&self) -> HypervisorHandle {
        let weak: Weak<dyn Dispatch> = Arc::downgrade(&self.inner) as Weak<dyn Dispatch>;
        HypervisorHandle::new(weak)
    }

    /// Add a container kind at runtime. Re-registering a tag replaces it.
    pub fn register_container(&self, factory: impl ContainerFactory + 'static) {
        let mut registry = self.inner.registry.write().expect("registry poisoned");
        Arc::make_mut(&mut *registry).register(Arc::new(factory));
    }

    /// Create a top-level actor. With `id` unset a fresh one is derived from the
    /// global nonce. The record is provisional until the next state root.
    pub fn create_actor(
        &self,
        type_tag: u32,
        code: &[u8],
        id: Option<ActorId>,
    ) -> Result<ModuleHandle, KernelError> {
        let factory = self
            .inner
            .registry()
            .get(type_tag)
            .cloned()
            .ok_or(KernelError::UnknownContainerType(type_tag))?;

        let mut state = self.inner.lock_state();
        let (id, next_nonce) = match id {
            Some(id) => (id, state.nonce),
            None => (self.inner.next_id(state.nonce), state.nonce + 1),
        };
        let handle = factory
            .on_creation(code, id)
            .map_err(|e| KernelError::Container {
                type_tag,
                reason: format!("{e:#}"),
            })?;
        record::write_new(&mut state.tree, id, type_tag, code)?;
        state.nonce = next_nonce;
        debug!("created actor {id} (type {type_tag})");
        Ok(handle)
    }

    /// Rehydrate an actor from the tree and run its startup hook.
    ///
    /// Every call builds a new instance; the scheduler keeps at most one
    /// resident per ID.
    pub async fn load_actor(&self, id: ActorId) -> Result<Actor, KernelError> {
        self.inner.load_actor(id).await
    }

    pub fn send(&self, messages: impl IntoMessages) {
        self.inner.clone().dispatch(messages.into_messages());
    }

    /// Wait until no message is queued or in flight.
    pub async fn idle(&self) -> Result<(), KernelError> {
        let _guard = self.inner.snapshot.lock().await;
        self.inner.wait_idle().await
    }

    /// Wait for idle, persist the global nonce and flush the tree.
    ///
    /// The scheduler stays frozen from the idle point until the flush is done,
    /// so messages sent meanwhile land in the next epoch.
    pub async fn create_state_root(&self) -> Result<Hash, KernelError> {
        let _guard = self.inner.snapshot.lock().await;
        while let Some(rx) = self.inner.scheduler.freeze_when_idle()? {
            let _ = rx.await;
        }
        let result = self.inner.flush();
        self.inner.thaw();
        result
    }

    /// Repoint the tree at `root`. Fails while messages are in flight.
    pub fn set_state_root(&self, root: Hash) -> Result<(), KernelError> {
        if !self.inner.scheduler.try_freeze() {
            return Err(KernelError::SchedulerRunning);
        }
        let result = self.inner.reset(root);
        self.inner.thaw();
        result
    }

    /// Root of the last flush.
    pub fn state_root(&self) -> Hash {
        self.inner.lock_state().tree.root()
    }

    pub fn nonce(&self) -> u64 {
        self.inner.lock_state().nonce
    }

    pub fn actor_record(&self, id: ActorId) -> Result<ActorRecord, KernelError> {
        record::read_record(&self.inner.lock_state().tree, id)
    }

    pub fn actor_code(&self, id: ActorId) -> Result<Vec<u8>, KernelError> {
        record::read_code(&self.inner.lock_state().tree, id)
    }

    pub fn actor_storage(&self, id: ActorId) -> Result<Vec<Vec<u8>>, KernelError> {
        record::read_storage(&self.inner.lock_state().tree, id)
    }
}

impl<S: Store + 'static> Inner<S> {
    fn lock_state(&self) -> MutexGuard<'_, TreeState<S>> {
        self.state.lock().expect("state tree poisoned")
    }

    fn registry(&self) -> Arc<ContainerRegistry> {
        self.registry.read().expect("registry poisoned").clone()
    }

    fn next_id(&self, nonce: u64) -> ActorId {
        match self.config.identity {
            IdentityScheme::ContentHashed => derive_id(None, nonce),
            IdentityScheme::Numeric => ActorId::from_nonce(nonce),
        }
    }

    fn spawn_drain(self: &Arc<Self>) {
        self.runtime.spawn(self.clone().drain());
    }

    fn thaw(self: &Arc<Self>) {
        if self.scheduler.thaw() {
            self.spawn_drain();
        }
    }

    fn flush(&self) -> Result<Hash, KernelError> {
        let mut state = self.lock_state();
        let nonce = state.nonce;
        record::write_nonce(&mut state.tree, nonce)?;
        let root = state.tree.flush()?;
        debug!("state root {root} (nonce {nonce})");
        Ok(root)
    }

    fn reset(&self, root: Hash) -> Result<(), KernelError> {
        let mut state = self.lock_state();
        state.tree.set_root(root)?;
        state.nonce = record::read_nonce(&state.tree)?;
        debug!("state root set to {root}");
        Ok(())
    }

    async fn wait_idle(&self) -> Result<(), KernelError> {
        while let Some(rx) = self.scheduler.wait_idle()? {
            let _ = rx.await;
        }
        Ok(())
    }

    async fn load_actor(&self, id: ActorId) -> Result<Actor, KernelError> {
        let (record, code, storage) = {
            let state = self.lock_state();
            (
                record::read_record(&state.tree, id)?,
                record::read_code(&state.tree, id)?,
                record::read_storage(&state.tree, id)?,
            )
        };
        let registry = self.registry();
        let factory = registry
            .get(record.type_tag)
            .ok_or(KernelError::UnknownContainerType(record.type_tag))?;
        let container = catch_unwind(AssertUnwindSafe(|| factory.instantiate(&code)))
            .map_err(|payload| format!("panicked: {}", panic_reason(payload)))
            .and_then(|built| built.map_err(|e| format!("{e:#}")))
            .map_err(|reason| KernelError::Container {
                type_tag: record.type_tag,
                reason,
            })?;
        let mut actor = Actor::new(id, record, storage, container);
        actor
            .startup(&registry, self)
            .await
            .map_err(|e| KernelError::Startup {
                id,
                reason: e.to_string(),
            })?;
        debug!("loaded actor {id}");
        Ok(actor)
    }

    /// Shut down every resident actor into the tree, in ID order.
    fn evict(&self, resident: &mut HashMap<ActorId, Actor>) {
        if resident.is_empty() {
            return;
        }
        let mut actors: Vec<Actor> = resident.drain().map(|(_, actor)| actor).collect();
        actors.sort_by_key(Actor::id);
        let mut state = self.lock_state();
        for actor in actors {
            if let Err(err) = actor.shutdown(&mut state.tree) {
                error!("failed to persist actor {}: {err}", actor.id());
            }
        }
    }

    async fn drain(self: Arc<Self>) {
        let mut resident: HashMap<ActorId, Actor> = HashMap::new();
        loop {
            while let Some(message) = self.scheduler.pop() {
                let target = match &message.func.dest {
                    Destination::Actor(id) => Some(*id),
                    Destination::Driver(_) => None,
                };
                let delivered = AssertUnwindSafe(self.deliver(message, &mut resident))
                    .catch_unwind()
                    .await;
                if let Err(payload) = delivered {
                    error!("delivery to {target:?} panicked: {}", panic_reason(payload));
                    if let Some(id) = target {
                        resident.remove(&id);
                    }
                }
            }
            self.evict(&mut resident);
            if self.scheduler.finish() {
                break;
            }
        }
        debug!("scheduler idle");
    }

    async fn deliver(&self, mut message: Message, resident: &mut HashMap<ActorId, Actor>) {
        let id = match &message.func.dest {
            Destination::Driver(driver) => {
                let driver = driver.clone();
                return self.deliver_to_driver(&driver, message).await;
            }
            Destination::Actor(id) => *id,
        };

        if !resident.contains_key(&id) {
            match self.load_actor(id).await {
                Ok(actor) => {
                    resident.insert(id, actor);
                }
                Err(KernelError::UnknownActor(_)) if self.config.default_driver.is_some() => {
                    let driver = self.config.default_driver.clone().unwrap_or_default();
                    debug!("no actor {id}; routing to default driver '{driver}'");
                    return self.deliver_to_driver(&driver, message).await;
                }
                Err(err) => {
                    match &err {
                        KernelError::UnknownActor(_) => warn!("dropping message for unknown actor {id}"),
                        other => error!("failed to load actor {id}: {other}"),
                    }
                    message.complete(MessageReceipt {
                        actor: Some(id),
                        ticks: message.from_ticks(),
                        gas_used: 0,
                        error: Some(ExecutionError::from(&err)),
                    });
                    return;
                }
            }
        }
        let Some(actor) = resident.get_mut(&id) else {
            return;
        };

        let registry = self.registry();
        let outcome = actor
            .run_message(message, &registry, self, self.config.meter)
            .await;
        if outcome.poisoned {
            // keep what earlier messages committed, then drop the instance
            if let Some(actor) = resident.remove(&id) {
                self.evict(&mut HashMap::from([(id, actor)]));
            }
        }
        self.scheduler.queue(outcome.outbox);
    }

    // Drivers sit outside gas and tick accounting.
    async fn deliver_to_driver(&self, id: &str, mut message: Message) {
        let error = match self.scheduler.driver(id) {
            Some(driver) => match AssertUnwindSafe(driver.on_message(&message))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => None,
                Ok(Err(err)) => {
                    warn!("driver '{id}' failed: {err:#}");
                    Some(ExecutionError::Driver(format!("{err:#}")))
                }
                Err(payload) => {
                    let reason = panic_reason(payload);
                    error!("driver '{id}' panicked: {reason}");
                    Some(ExecutionError::Driver(format!("panicked: {reason}")))
                }
            },
            None => {
                warn!("no driver registered as '{id}'");
                Some(ExecutionError::UnknownDriver(id.to_string()))
            }
        };
        let ticks = message.from_ticks();
        message.complete(MessageReceipt {
            actor: None,
            ticks,
            gas_used: 0,
            error,
        });
    }
}

impl<S: Store + 'static> Dispatch for Inner<S> {
    fn dispatch(self: Arc<Self>, messages: Vec<Message>) {
        if self.scheduler.queue(messages) {
            self.spawn_drain();
        }
    }
}

/// Child IDs are checked and committed against the live tree.
impl<S: Store + 'static> ActorDirectory for Inner<S> {
    fn contains(&self, id: ActorId) -> Result<bool, ExecutionError> {
        record::exists(&self.lock_state().tree, id).map_err(tree_failure)
    }

    fn admit(&self, created: &[PendingActor]) -> Result<(), ExecutionError> {
        if created.is_empty() {
            return Ok(());
        }
        let mut state = self.lock_state();
        for child in created {
            if record::exists(&state.tree, child.id).map_err(tree_failure)? {
                return Err(ExecutionError::ActorExists(child.id));
            }
        }
        for child in created {
            record::write_new(&mut state.tree, child.id, child.type_tag, &child.code)
                .map_err(|e| ExecutionError::from(&e))?;
            debug!("created actor {} (type {})", child.id, child.type_tag);
        }
        Ok(())
    }
}

fn tree_failure(err: hv_store::TreeError) -> ExecutionError {
    ExecutionError::from(&KernelError::from(err))
}
