use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::ActorId;

/// Failures of infrastructure operations. These propagate to the caller of the
/// hypervisor and are never retried.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] hv_store::StoreError),
    #[error("state tree error: {0}")]
    Tree(#[from] hv_store::TreeError),
    #[error("unknown actor {0}")]
    UnknownActor(ActorId),
    #[error("actor {0} already exists")]
    ActorExists(ActorId),
    #[error("no container registered for type tag {0}")]
    UnknownContainerType(u32),
    #[error("malformed state for actor {id}: {reason}")]
    MalformedState { id: ActorId, reason: String },
    #[error("container type {type_tag} rejected module: {reason}")]
    Container { type_tag: u32, reason: String },
    #[error("actor {id} failed to start: {reason}")]
    Startup { id: ActorId, reason: String },
    #[error("driver '{0}' registered twice")]
    DuplicateDriver(String),
    #[error("driver '{id}' failed to start: {reason}")]
    DriverStartup { id: String, reason: String },
    #[error("scheduler is running; state root cannot be changed")]
    SchedulerRunning,
    /// Crate-internal guard. Public callers are serialized by the snapshot
    /// lock and never see it.
    #[error("another caller is already waiting for idle")]
    IdleWaiterBusy,
    #[error("hypervisor has shut down")]
    Shutdown,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure of a single message execution. Delivered through the message
/// receipt; never unwinds into the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("out of gas: requested {requested}, {remaining} remaining")]
    OutOfGas { requested: u64, remaining: u64 },
    #[error("function '{0}' is not exported")]
    UnknownFunction(String),
    #[error("function '{func}' expects {expected} argument(s), got {got}")]
    BadArguments {
        func: String,
        expected: usize,
        got: usize,
    },
    #[error("unknown actor {0}")]
    UnknownActor(ActorId),
    #[error("actor {0} already exists")]
    ActorExists(ActorId),
    #[error("no container registered for type tag {0}")]
    UnknownContainerType(u32),
    #[error("storage slot {slot} is past the limit of {limit}")]
    SlotOutOfRange { slot: usize, limit: usize },
    #[error("actor clock overflowed")]
    ClockOverflow,
    #[error("container panicked: {0}")]
    Panicked(String),
    #[error("no driver registered as '{0}'")]
    UnknownDriver(String),
    #[error("driver error: {0}")]
    Driver(String),
    #[error("container error: {0}")]
    Container(String),
    #[error("{0} is not available during startup")]
    Unavailable(String),
    #[error("kernel error: {0}")]
    Kernel(String),
}

impl ExecutionError {
    /// Recover a typed error that a container propagated through `anyhow`.
    pub fn from_container(err: anyhow::Error) -> Self {
        match err.downcast::<ExecutionError>() {
            Ok(err) => err,
            Err(err) => ExecutionError::Container(format!("{err:#}")),
        }
    }

    /// Describe a panic caught at the container boundary.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        ExecutionError::Panicked(panic_reason(payload))
    }
}

pub(crate) fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

impl From<&KernelError> for ExecutionError {
    fn from(err: &KernelError) -> Self {
        match err {
            KernelError::UnknownActor(id) => ExecutionError::UnknownActor(*id),
            KernelError::ActorExists(id) => ExecutionError::ActorExists(*id),
            KernelError::UnknownContainerType(tag) => ExecutionError::UnknownContainerType(*tag),
            other => ExecutionError::Kernel(other.to_string()),
        }
    }
}
