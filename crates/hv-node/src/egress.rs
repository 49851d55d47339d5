use async_trait::async_trait;
use hv_kernel::{ActorId, Driver, ExecutionError, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

pub const EGRESS_ID: &str = "egress";

const CHANNEL_CAPACITY: usize = 256;

/// Something leaving the node: a message sent to the egress driver, or an
/// execution error from an ingress transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EgressEvent {
    Message {
        func: String,
        from: Option<ActorId>,
        from_ticks: u64,
        args: Vec<serde_bytes::ByteBuf>,
    },
    Error {
        actor: ActorId,
        func: String,
        error: ExecutionError,
    },
}

/// Publishes everything addressed to `"egress"` on a broadcast channel.
pub struct EgressDriver {
    tx: broadcast::Sender<EgressEvent>,
}

impl Default for EgressDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EgressDriver {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EgressEvent> {
        self.tx.subscribe()
    }

    /// Lagging or absent subscribers are not an error.
    pub fn publish(&self, event: EgressEvent) {
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl Driver for EgressDriver {
    fn id(&self) -> &str {
        EGRESS_ID
    }

    async fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        debug!("egress '{}' from {:?}", message.func.name, message.from_id());
        self.publish(EgressEvent::Message {
            func: message.func.name.clone(),
            from: message.from_id(),
            from_ticks: message.from_ticks(),
            args: message
                .args
                .iter()
                .cloned()
                .map(serde_bytes::ByteBuf::from)
                .collect(),
        });
        Ok(())
    }
}
