use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ExecutionError;
use crate::id::ActorId;

/// Where a message is delivered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Actor(ActorId),
    Driver(String),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Actor(id) => write!(f, "{id}"),
            Destination::Driver(id) => write!(f, "driver:{id}"),
        }
    }
}

/// A function exported by an actor, or a driver entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncRef {
    pub dest: Destination,
    pub name: String,
}

impl FuncRef {
    pub fn actor(id: ActorId, name: impl Into<String>) -> Self {
        Self {
            dest: Destination::Actor(id),
            name: name.into(),
        }
    }

    pub fn driver(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            dest: Destination::Driver(id.into()),
            name: name.into(),
        }
    }
}

/// Delivered exactly once per message after it finishes, whatever the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    /// Actor that ran the message; `None` for driver deliveries.
    pub actor: Option<ActorId>,
    /// Receiver's clock after execution.
    pub ticks: u64,
    pub gas_used: u64,
    pub error: Option<ExecutionError>,
}

impl MessageReceipt {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct Message {
    pub func: FuncRef,
    pub args: Vec<Vec<u8>>,
    pub gas: u64,
    from_ticks: u64,
    from_id: Option<ActorId>,
    receipt: Option<oneshot::Sender<MessageReceipt>>,
}

impl Message {
    /// `from_ticks` and `from_id` stay unset until an actor sends it.
    pub fn new(func: FuncRef, args: Vec<Vec<u8>>, gas: u64) -> Self {
        Self {
            func,
            args,
            gas,
            from_ticks: 0,
            from_id: None,
            receipt: None,
        }
    }

    /// Causal stamp for messages injected from outside the actor graph.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.from_ticks = ticks;
        self
    }

    pub fn from_ticks(&self) -> u64 {
        self.from_ticks
    }

    pub fn from_id(&self) -> Option<ActorId> {
        self.from_id
    }

    /// Register for the receipt. Must be called before the message is sent;
    /// a second call replaces the first receiver.
    pub fn subscribe(&mut self) -> oneshot::Receiver<MessageReceipt> {
        let (tx, rx) = oneshot::channel();
        self.receipt = Some(tx);
        rx
    }

    pub(crate) fn stamp(&mut self, ticks: u64, from: ActorId) {
        self.from_ticks = ticks;
        self.from_id = Some(from);
    }

    pub(crate) fn take_receipt(&mut self) -> Option<oneshot::Sender<MessageReceipt>> {
        self.receipt.take()
    }

    pub(crate) fn complete(&mut self, receipt: MessageReceipt) {
        if let Some(tx) = self.receipt.take() {
            let _ = tx.send(receipt);
        }
    }
}

/// Anything `send` accepts: one message or a batch.
pub trait IntoMessages {
    fn into_messages(self) -> Vec<Message>;
}

impl IntoMessages for Message {
    fn into_messages(self) -> Vec<Message> {
        vec![self]
    }
}

impl IntoMessages for Vec<Message> {
    fn into_messages(self) -> Vec<Message> {
        self
    }
}

impl<const N: usize> IntoMessages for [Message; N] {
    fn into_messages(self) -> Vec<Message> {
        Vec::from(self)
    }
}
