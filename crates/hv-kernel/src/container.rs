//! The capability set every container kind implements, and the context a
//! running container uses to call back into its actor.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::id::{ActorId, derive_id};
use crate::message::Message;

/// Returned when an actor is created: its ID and what its code exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleHandle {
    pub actor: ActorId,
    pub type_tag: u32,
    pub exports: Vec<String>,
}

/// Shape of one exported function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    /// Minimum number of arguments the function reads.
    pub arity: usize,
}

/// Static half of a container kind: validation and instantiation.
pub trait ContainerFactory: Send + Sync {
    fn type_tag(&self) -> u32;

    /// Validate `code` for a new actor and describe it.
    fn on_creation(&self, code: &[u8], id: ActorId) -> anyhow::Result<ModuleHandle>;

    fn instantiate(&self, code: &[u8]) -> anyhow::Result<Box<dyn Container>>;
}

/// A live container instance owned by exactly one actor.
#[async_trait]
pub trait Container: Send {
    /// Runs once when the actor is loaded, before its first message.
    async fn on_startup(&mut self, cx: &mut ActorContext<'_>) -> anyhow::Result<()>;

    async fn on_message(&mut self, cx: &mut ActorContext<'_>, message: &Message) -> anyhow::Result<()>;

    fn get_interface(&self, name: &str) -> Option<Interface>;
}

/// Registered container kinds keyed by type tag.
#[derive(Clone, Default)]
pub struct ContainerRegistry {
    factories: BTreeMap<u32, Arc<dyn ContainerFactory>>,
}

impl ContainerRegistry {
    /// Re-registering a tag replaces the previous factory.
    pub fn register(&mut self, factory: Arc<dyn ContainerFactory>) {
        self.factories.insert(factory.type_tag(), factory);
    }

    pub fn get(&self, type_tag: u32) -> Option<&Arc<dyn ContainerFactory>> {
        self.factories.get(&type_tag)
    }

    pub fn type_tags(&self) -> impl Iterator<Item = u32> + '_ {
        self.factories.keys().copied()
    }
}

impl std::fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// Upper bound on an actor's storage slots.
pub const MAX_STORAGE_SLOTS: usize = 4096;

/// The context's view of the state tree: which IDs are taken, and where
/// children go once their parent's message succeeds.
pub trait ActorDirectory: Send + Sync {
    fn contains(&self, id: ActorId) -> Result<bool, ExecutionError>;

    /// Record every child or none of them.
    fn admit(&self, created: &[PendingActor]) -> Result<(), ExecutionError>;
}

/// A child created during a message, written to the tree only if the message
/// succeeds.
#[derive(Debug, Clone)]
pub struct PendingActor {
    pub id: ActorId,
    pub type_tag: u32,
    pub code: Vec<u8>,
}

/// What the container sees of its actor while handling one message.
///
/// Storage, the child nonce, created children and outbound messages are
/// working copies; the actor adopts them only when the handler succeeds.
/// Ticks charged are written through immediately.
pub struct ActorContext<'a> {
    id: ActorId,
    ticks: &'a mut u64,
    registry: &'a ContainerRegistry,
    directory: &'a dyn ActorDirectory,
    gas: Option<GasMeter>,
    exhausted: Option<ExecutionError>,
    nonce: u64,
    storage: Vec<Vec<u8>>,
    outbox: Vec<Message>,
    created: Vec<PendingActor>,
    startup: bool,
}

#[derive(Debug, Clone, Copy)]
struct GasMeter {
    budget: u64,
    remaining: u64,
}

pub(crate) struct Effects {
    pub nonce: u64,
    pub storage: Vec<Vec<u8>>,
    pub outbox: Vec<Message>,
    pub created: Vec<PendingActor>,
}

impl<'a> ActorContext<'a> {
    pub(crate) fn for_message(
        id: ActorId,
        ticks: &'a mut u64,
        registry: &'a ContainerRegistry,
        directory: &'a dyn ActorDirectory,
        nonce: u64,
        storage: Vec<Vec<u8>>,
        gas: Option<u64>,
    ) -> Self {
        Self {
            id,
            ticks,
            registry,
            directory,
            gas: gas.map(|budget| GasMeter {
                budget,
                remaining: budget,
            }),
            exhausted: None,
            nonce,
            storage,
            outbox: Vec::new(),
            created: Vec::new(),
            startup: false,
        }
    }

    pub(crate) fn for_startup(
        id: ActorId,
        ticks: &'a mut u64,
        registry: &'a ContainerRegistry,
        directory: &'a dyn ActorDirectory,
        nonce: u64,
        storage: Vec<Vec<u8>>,
    ) -> Self {
        let mut cx = Self::for_message(id, ticks, registry, directory, nonce, storage, None);
        cx.startup = true;
        cx
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn ticks(&self) -> u64 {
        *self.ticks
    }

    /// Gas left for the current message; `None` when metering is off.
    pub fn gas_remaining(&self) -> Option<u64> {
        self.gas.map(|g| g.remaining)
    }

    /// Charge `count` gas and advance the clock by the same amount.
    ///
    /// Once this fails the message is aborted even if the container swallows
    /// the error.
    pub fn increment_ticks(&mut self, count: u64) -> Result<(), ExecutionError> {
        if let Some(err) = &self.exhausted {
            return Err(err.clone());
        }
        let Some(gas) = self.gas.as_mut() else {
            return Ok(());
        };
        if count > gas.remaining {
            let err = ExecutionError::OutOfGas {
                requested: count,
                remaining: gas.remaining,
            };
            gas.remaining = 0;
            self.exhausted = Some(err.clone());
            return Err(err);
        }
        let Some(ticks) = self.ticks.checked_add(count) else {
            self.exhausted = Some(ExecutionError::ClockOverflow);
            return Err(ExecutionError::ClockOverflow);
        };
        gas.remaining -= count;
        *self.ticks = ticks;
        Ok(())
    }

    pub fn storage(&self) -> &[Vec<u8>] {
        &self.storage
    }

    /// Write `value` into `slot`, growing storage with empty entries as needed.
    /// Each new slot costs one unit of gas.
    pub fn store(&mut self, slot: usize, value: Vec<u8>) -> Result<(), ExecutionError> {
        if slot >= MAX_STORAGE_SLOTS {
            return Err(ExecutionError::SlotOutOfRange {
                slot,
                limit: MAX_STORAGE_SLOTS,
            });
        }
        let len = self.storage.len();
        if len <= slot {
            self.increment_ticks((slot + 1 - len) as u64)?;
            self.storage.resize(slot + 1, Vec::new());
        }
        self.storage[slot] = value;
        Ok(())
    }

    /// Stamp `message` with this actor's clock and ID and queue it for after
    /// the handler returns.
    pub fn send(&mut self, mut message: Message) -> Result<(), ExecutionError> {
        if self.startup {
            return Err(ExecutionError::Unavailable("send".into()));
        }
        message.stamp(*self.ticks, self.id);
        self.outbox.push(message);
        Ok(())
    }

    /// Create a child actor. Its ID comes from this actor's nonce, which is
    /// only advanced if the handler succeeds.
    pub fn create_actor(&mut self, type_tag: u32, code: &[u8]) -> Result<ModuleHandle, ExecutionError> {
        if self.startup {
            return Err(ExecutionError::Unavailable("create_actor".into()));
        }
        let factory = self
            .registry
            .get(type_tag)
            .ok_or(ExecutionError::UnknownContainerType(type_tag))?;
        let id = derive_id(Some(self.id), self.nonce);
        if self.directory.contains(id)? {
            // skip the taken ID so a retry derives a fresh one
            self.nonce += 1;
            return Err(ExecutionError::ActorExists(id));
        }
        let handle = factory
            .on_creation(code, id)
            .map_err(|e| ExecutionError::Container(format!("{e:#}")))?;
        self.nonce += 1;
        self.created.push(PendingActor {
            id,
            type_tag,
            code: code.to_vec(),
        });
        Ok(handle)
    }

    pub(crate) fn gas_used(&self) -> u64 {
        self.gas.map(|g| g.budget - g.remaining).unwrap_or(0)
    }

    pub(crate) fn exhausted(&self) -> Option<&ExecutionError> {
        self.exhausted.as_ref()
    }

    pub(crate) fn into_effects(self) -> Effects {
        Effects {
            nonce: self.nonce,
            storage: self.storage,
            outbox: self.outbox,
            created: self.created,
        }
    }
}

/// In-memory directory for unit tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct TestDirectory {
    pub taken: std::sync::Mutex<std::collections::BTreeSet<ActorId>>,
}

#[cfg(test)]
impl ActorDirectory for TestDirectory {
    fn contains(&self, id: ActorId) -> Result<bool, ExecutionError> {
        Ok(self.taken.lock().unwrap().contains(&id))
    }

    fn admit(&self, created: &[PendingActor]) -> Result<(), ExecutionError> {
        let mut taken = self.taken.lock().unwrap();
        if let Some(child) = created.iter().find(|c| taken.contains(&c.id)) {
            return Err(ExecutionError::ActorExists(child.id));
        }
        taken.extend(created.iter().map(|c| c.id));
        Ok(())
    }
}
