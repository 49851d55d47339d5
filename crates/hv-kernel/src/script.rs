//! Built-in container kind that runs a fixed list of operations per export.
//!
//! Used by tests, fixtures and the CLI. There are no loops or branches.

use std::collections::BTreeMap;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use hv_cbor::to_canonical_cbor;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::container::{ActorContext, Container, ContainerFactory, Interface, ModuleHandle};
use crate::id::ActorId;
use crate::message::{Destination, FuncRef, Message};

pub const SCRIPT_TYPE: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptModule {
    #[serde(default)]
    pub exports: BTreeMap<String, Vec<Op>>,
    /// Run on every load. Only `Charge`, `Store` and `Fail` are meaningful.
    #[serde(default)]
    pub startup: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Charge(u64),
    Store {
        slot: usize,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    /// Copy message argument `arg` into storage `slot`.
    StoreArg { slot: usize, arg: usize },
    Send {
        to: Target,
        func: String,
        #[serde(default)]
        args: Vec<ByteBuf>,
        gas: u64,
    },
    Spawn {
        type_tag: u32,
        #[serde(with = "serde_bytes")]
        code: Vec<u8>,
    },
    Fail(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Actor(ActorId),
    /// The n-th actor spawned earlier in the same invocation.
    Child(usize),
    /// Whoever sent the message being handled.
    Sender,
    Driver(String),
}

impl ScriptModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(mut self, name: impl Into<String>, ops: Vec<Op>) -> Self {
        self.exports.insert(name.into(), ops);
        self
    }

    pub fn on_startup(mut self, ops: Vec<Op>) -> Self {
        self.startup = ops;
        self
    }

    pub fn to_code(&self) -> Result<Vec<u8>, serde_cbor::Error> {
        to_canonical_cbor(self)
    }

    pub fn from_code(code: &[u8]) -> anyhow::Result<Self> {
        serde_cbor::from_slice(code).context("decode script module")
    }

    fn arity(ops: &[Op]) -> usize {
        ops.iter()
            .filter_map(|op| match op {
                Op::StoreArg { arg, .. } => Some(arg + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }
}

pub struct ScriptFactory;

impl ContainerFactory for ScriptFactory {
    fn type_tag(&self) -> u32 {
        SCRIPT_TYPE
    }

    fn on_creation(&self, code: &[u8], id: ActorId) -> anyhow::Result<ModuleHandle> {
        let module = ScriptModule::from_code(code)?;
        Ok(ModuleHandle {
            actor: id,
            type_tag: SCRIPT_TYPE,
            exports: module.exports.keys().cloned().collect(),
        })
    }

    fn instantiate(&self, code: &[u8]) -> anyhow::Result<Box<dyn Container>> {
        Ok(Box::new(ScriptContainer {
            module: ScriptModule::from_code(code)?,
        }))
    }
}

pub struct ScriptContainer {
    module: ScriptModule,
}

impl ScriptContainer {
    fn run(ops: &[Op], cx: &mut ActorContext<'_>, message: Option<&Message>) -> anyhow::Result<()> {
        let mut children: Vec<ActorId> = Vec::new();
        for op in ops {
            match op {
                Op::Charge(n) => cx.increment_ticks(*n)?,
                Op::Store { slot, value } => cx.store(*slot, value.clone())?,
                Op::StoreArg { slot, arg } => {
                    let value = message
                        .and_then(|m| m.args.get(*arg))
                        .ok_or_else(|| anyhow!("argument {arg} not supplied"))?;
                    cx.store(*slot, value.clone())?;
                }
                Op::Send { to, func, args, gas } => {
                    let dest = match to {
                        Target::Actor(id) => Destination::Actor(*id),
                        Target::Child(n) => Destination::Actor(
                            *children
                                .get(*n)
                                .ok_or_else(|| anyhow!("no child #{n} spawned yet"))?,
                        ),
                        Target::Sender => Destination::Actor(
                            message
                                .and_then(Message::from_id)
                                .ok_or_else(|| anyhow!("message has no sending actor"))?,
                        ),
                        Target::Driver(id) => Destination::Driver(id.clone()),
                    };
                    let args = args.iter().map(|a| a.to_vec()).collect();
                    let func = FuncRef {
                        dest,
                        name: func.clone(),
                    };
                    cx.send(Message::new(func, args, *gas))?;
                }
                Op::Spawn { type_tag, code } => {
                    let handle = cx.create_actor(*type_tag, code)?;
                    children.push(handle.actor);
                }
                Op::Fail(reason) => bail!("{reason}"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Container for ScriptContainer {
    async fn on_startup(&mut self, cx: &mut ActorContext<'_>) -> anyhow::Result<()> {
        Self::run(&self.module.startup, cx, None)
    }

    async fn on_message(&mut self, cx: &mut ActorContext<'_>, message: &Message) -> anyhow::Result<()> {
        let ops = self
            .module
            .exports
            .get(&message.func.name)
            .ok_or_else(|| anyhow!("function '{}' is not exported", message.func.name))?;
        Self::run(ops, cx, Some(message))
    }

    fn get_interface(&self, name: &str) -> Option<Interface> {
        self.module.exports.get(name).map(|ops| Interface {
            name: name.to_string(),
            arity: ScriptModule::arity(ops),
        })
    }
}
