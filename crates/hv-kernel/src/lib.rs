//! Actor hypervisor: deterministic identities, metered message execution, a
//! single-drain scheduler and reproducible state roots over [`hv_store`].

pub mod actor;
pub mod config;
pub mod container;
pub mod driver;
pub mod error;
pub mod hypervisor;
pub mod id;
pub mod message;
pub mod record;
pub mod scheduler;
pub mod script;

pub use actor::{Actor, MessageOutcome};
pub use config::{HypervisorConfig, IdentityScheme};
pub use container::{
    ActorContext, ActorDirectory, Container, ContainerFactory, ContainerRegistry, Interface,
    MAX_STORAGE_SLOTS, ModuleHandle, PendingActor,
};
pub use driver::{Driver, HypervisorHandle};
pub use error::{ExecutionError, KernelError};
pub use hypervisor::{Hypervisor, HypervisorBuilder};
pub use id::{ActorId, derive_id};
pub use message::{Destination, FuncRef, IntoMessages, Message, MessageReceipt};
pub use record::ActorRecord;
pub use scheduler::Scheduler;
pub use script::{Op, SCRIPT_TYPE, ScriptFactory, ScriptModule, Target};
