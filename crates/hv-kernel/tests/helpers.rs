//! Shared helpers for hypervisor integration tests.
//!
//! Each integration test compiles this module separately, so some helpers may
//! look unused from a single test file.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use hv_kernel::{
    ActorId, Driver, FuncRef, Hypervisor, HypervisorConfig, HypervisorHandle, Message, Op,
    ScriptFactory, ScriptModule,
};
use hv_store::MemStore;

/// What a recording driver saw of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub func: String,
    pub from_ticks: u64,
    pub from_id: Option<ActorId>,
    pub args: Vec<Vec<u8>>,
}

/// Driver that remembers every message delivered to it.
pub struct RecordingDriver {
    id: String,
    seen: Mutex<Vec<Seen>>,
    handle: OnceLock<HypervisorHandle>,
    delay: Option<Duration>,
}

impl RecordingDriver {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            seen: Mutex::new(Vec::new()),
            handle: OnceLock::new(),
            delay: None,
        })
    }

    /// Sleeps before acknowledging each message.
    pub fn slow(id: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            seen: Mutex::new(Vec::new()),
            handle: OnceLock::new(),
            delay: Some(delay),
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn handle(&self) -> &HypervisorHandle {
        self.handle.get().expect("driver not started")
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn startup(&self, hypervisor: HypervisorHandle) -> anyhow::Result<()> {
        let _ = self.handle.set(hypervisor);
        Ok(())
    }

    async fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.seen.lock().unwrap().push(Seen {
            func: message.func.name.clone(),
            from_ticks: message.from_ticks(),
            from_id: message.from_id(),
            args: message.args.clone(),
        });
        Ok(())
    }
}

pub async fn hypervisor(config: HypervisorConfig) -> Hypervisor<MemStore> {
    hypervisor_with(Arc::new(MemStore::new()), config, vec![]).await
}

pub async fn hypervisor_with(
    store: Arc<MemStore>,
    config: HypervisorConfig,
    drivers: Vec<Arc<dyn Driver>>,
) -> Hypervisor<MemStore> {
    let mut builder = Hypervisor::builder(store).config(config).container(ScriptFactory);
    for driver in drivers {
        builder = builder.driver(driver);
    }
    builder.build().await.expect("build hypervisor")
}

pub fn code(module: ScriptModule) -> Vec<u8> {
    module.to_code().expect("encode script")
}

pub fn spawn(hv: &Hypervisor<MemStore>, module: ScriptModule) -> ActorId {
    hv.create_actor(hv_kernel::SCRIPT_TYPE, &code(module), None)
        .expect("create actor")
        .actor
}

pub fn call(id: ActorId, func: &str, gas: u64) -> Message {
    Message::new(FuncRef::actor(id, func), vec![], gas)
}

pub fn store(slot: usize, value: &[u8]) -> Op {
    Op::Store {
        slot,
        value: value.to_vec(),
    }
}
