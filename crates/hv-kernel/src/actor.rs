use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::FutureExt;
use hv_store::{StateTree, Store, TreeError};
use tracing::{debug, error, warn};

use crate::container::{ActorContext, ActorDirectory, Container, ContainerRegistry};
use crate::error::ExecutionError;
use crate::id::ActorId;
use crate::message::{Message, MessageReceipt};
use crate::record::{self, ActorRecord};

/// Everything a finished message hands back to the scheduler.
#[derive(Debug, Default)]
pub struct MessageOutcome {
    pub outbox: Vec<Message>,
    pub error: Option<ExecutionError>,
    /// The container panicked; this instance must not run again.
    pub poisoned: bool,
}

/// A loaded actor: one container instance plus the state it runs against.
pub struct Actor {
    id: ActorId,
    type_tag: u32,
    nonce: u64,
    ticks: u64,
    storage: Vec<Vec<u8>>,
    container: Box<dyn Container>,
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("type_tag", &self.type_tag)
            .field("nonce", &self.nonce)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

impl Actor {
    pub(crate) fn new(
        id: ActorId,
        record: ActorRecord,
        storage: Vec<Vec<u8>>,
        container: Box<dyn Container>,
    ) -> Self {
        Self {
            id,
            type_tag: record.type_tag,
            nonce: record.nonce,
            ticks: 0,
            storage,
            container,
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn type_tag(&self) -> u32 {
        self.type_tag
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn storage(&self) -> &[Vec<u8>] {
        &self.storage
    }

    /// Run the container's startup hook. Only storage changes survive it.
    pub async fn startup(
        &mut self,
        registry: &ContainerRegistry,
        directory: &dyn ActorDirectory,
    ) -> Result<(), ExecutionError> {
        let mut cx = ActorContext::for_startup(
            self.id,
            &mut self.ticks,
            registry,
            directory,
            self.nonce,
            self.storage.clone(),
        );
        AssertUnwindSafe(self.container.on_startup(&mut cx))
            .catch_unwind()
            .await
            .map_err(ExecutionError::from_panic)?
            .map_err(ExecutionError::from_container)?;
        self.storage = cx.into_effects().storage;
        Ok(())
    }

    /// Execute one message. Failures, panics included, are captured in the
    /// receipt and the outcome; they never propagate.
    ///
    /// Children the message created are admitted through `directory` before
    /// any other effect is adopted; if that fails the message fails.
    pub async fn run_message(
        &mut self,
        mut message: Message,
        registry: &ContainerRegistry,
        directory: &dyn ActorDirectory,
        meter: bool,
    ) -> MessageOutcome {
        self.ticks = self.ticks.max(message.from_ticks());
        let port = message.take_receipt();
        let name = message.func.name.clone();

        let mut outcome = MessageOutcome::default();
        let mut gas_used = 0;
        let container = &self.container;
        let interface = match catch_unwind(AssertUnwindSafe(|| container.get_interface(&name))) {
            Ok(interface) => Ok(interface),
            Err(payload) => Err(ExecutionError::from_panic(payload)),
        };
        match interface {
            Err(err) => {
                outcome.poisoned = true;
                outcome.error = Some(err);
            }
            Ok(None) => {
                outcome.error = Some(ExecutionError::UnknownFunction(name.clone()));
            }
            Ok(Some(iface)) if message.args.len() < iface.arity => {
                outcome.error = Some(ExecutionError::BadArguments {
                    func: name.clone(),
                    expected: iface.arity,
                    got: message.args.len(),
                });
            }
            Ok(Some(_)) => {
                let mut cx = ActorContext::for_message(
                    self.id,
                    &mut self.ticks,
                    registry,
                    directory,
                    self.nonce,
                    self.storage.clone(),
                    meter.then_some(message.gas),
                );
                let result = match AssertUnwindSafe(self.container.on_message(&mut cx, &message))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result.map_err(ExecutionError::from_container),
                    Err(payload) => {
                        outcome.poisoned = true;
                        Err(ExecutionError::from_panic(payload))
                    }
                };
                gas_used = cx.gas_used();
                let result = match cx.exhausted().cloned() {
                    Some(exhausted) if !outcome.poisoned => Err(exhausted),
                    _ => result,
                };
                match result {
                    Ok(()) => {
                        let effects = cx.into_effects();
                        match directory.admit(&effects.created) {
                            Ok(()) => {
                                self.nonce = effects.nonce;
                                self.storage = effects.storage;
                                outcome.outbox = effects.outbox;
                            }
                            Err(err) => outcome.error = Some(err),
                        }
                    }
                    Err(err) => outcome.error = Some(err),
                }
            }
        }

        match &outcome.error {
            Some(err) if outcome.poisoned => error!("actor {} panicked in '{}': {err}", self.id, name),
            Some(err) => warn!("actor {} failed '{}': {err}", self.id, name),
            None => debug!(
                "actor {} ran '{}' (ticks {}, gas {gas_used})",
                self.id, name, self.ticks
            ),
        }
        if let Some(port) = port {
            let _ = port.send(MessageReceipt {
                actor: Some(self.id),
                ticks: self.ticks,
                gas_used,
                error: outcome.error.clone(),
            });
        }
        outcome
    }

    /// Persist `(type_tag, nonce)` and storage. Must run before eviction.
    pub fn shutdown<S: Store>(&self, tree: &mut StateTree<S>) -> Result<(), TreeError> {
        record::write_state(
            tree,
            self.id,
            ActorRecord {
                type_tag: self.type_tag,
                nonce: self.nonce,
            },
            &self.storage,
        )
    }
}
