use std::sync::{Arc, Mutex};

use hv_cbor::{Hash, to_canonical_cbor};
use hv_kernel::{
    ActorId, Driver, FuncRef, Hypervisor, HypervisorConfig, Message, ModuleHandle, ScriptFactory,
};
use hv_store::Store;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::egress::{EgressDriver, EgressEvent};
use crate::error::NodeError;
use crate::tx::{Transaction, TxTarget};

/// Reply to an ingress transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressReply {
    pub actor: ActorId,
    /// Present when the transaction created the actor.
    pub module: Option<ModuleHandle>,
}

/// In-process node: a hypervisor with the built-in container kinds and the
/// egress driver, fed by encoded transactions.
pub struct Node<S: Store> {
    hv: Hypervisor<S>,
    egress: Arc<EgressDriver>,
    /// Tasks turning failed ingress receipts into egress events.
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Store + 'static> Node<S> {
    pub async fn open(
        store: Arc<S>,
        root: Option<Hash>,
        config: HypervisorConfig,
    ) -> Result<Self, NodeError> {
        let egress = Arc::new(EgressDriver::new());
        let mut builder = Hypervisor::builder(store)
            .config(config)
            .container(ScriptFactory)
            .driver(egress.clone() as Arc<dyn Driver>);
        if let Some(root) = root {
            builder = builder.root(root);
        }
        let hv = builder.build().await?;
        info!("node opened at {}", hv.state_root());
        Ok(Self {
            hv,
            egress,
            forwarders: Mutex::new(Vec::new()),
        })
    }

    pub fn hypervisor(&self) -> &Hypervisor<S> {
        &self.hv
    }

    pub fn egress(&self) -> broadcast::Receiver<EgressEvent> {
        self.egress.subscribe()
    }

    /// Decode and apply one CBOR transaction; the reply is a CBOR
    /// [`IngressReply`].
    pub async fn ingress(&self, raw: &[u8]) -> Result<Vec<u8>, NodeError> {
        let tx = Transaction::decode(raw)?;
        let reply = self.submit(tx)?;
        encode(&reply)
    }

    /// Apply a transaction. Execution errors from the call are forwarded to
    /// egress once the message finishes, and no later than the next
    /// [`Node::state_root`]. Must run inside a tokio runtime.
    pub fn submit(&self, tx: Transaction) -> Result<IngressReply, NodeError> {
        let (actor, module) = match tx.target {
            TxTarget::Create { type_tag, code } => {
                let module = self.hv.create_actor(type_tag, &code, None)?;
                (module.actor, Some(module))
            }
            TxTarget::Actor(id) => (id, None),
        };
        if let Some(func) = tx.func {
            let args = tx.args.into_iter().map(|a| a.into_vec()).collect();
            let mut message = Message::new(FuncRef::actor(actor, func.clone()), args, tx.ticks);
            let receipt = message.subscribe();
            let egress = self.egress.clone();
            let forwarder = tokio::spawn(async move {
                if let Ok(receipt) = receipt.await {
                    if let Some(error) = receipt.error {
                        egress.publish(EgressEvent::Error { actor, func, error });
                    }
                }
            });
            let mut forwarders = self.forwarders.lock().expect("forwarders poisoned");
            forwarders.retain(|f| !f.is_finished());
            forwarders.push(forwarder);
            debug!("ingress call to {actor}");
            self.hv.send(message);
        }
        Ok(IngressReply { actor, module })
    }

    pub fn nonce(&self, id: ActorId) -> Result<u64, NodeError> {
        Ok(self.hv.actor_record(id)?.nonce)
    }

    pub fn code(&self, id: ActorId) -> Result<Vec<u8>, NodeError> {
        Ok(self.hv.actor_code(id)?)
    }

    pub fn storage(&self, id: ActorId) -> Result<Vec<Vec<u8>>, NodeError> {
        Ok(self.hv.actor_storage(id)?)
    }

    pub fn nonce_cbor(&self, id: ActorId) -> Result<Vec<u8>, NodeError> {
        encode(&self.nonce(id)?)
    }

    pub fn code_cbor(&self, id: ActorId) -> Result<Vec<u8>, NodeError> {
        encode(&serde_bytes::ByteBuf::from(self.code(id)?))
    }

    pub fn storage_cbor(&self, id: ActorId) -> Result<Vec<u8>, NodeError> {
        let storage: Vec<serde_bytes::ByteBuf> = self
            .storage(id)?
            .into_iter()
            .map(serde_bytes::ByteBuf::from)
            .collect();
        encode(&storage)
    }

    /// Wait for quiescence and commit. Every error event for calls submitted
    /// before this is published by the time it returns.
    pub async fn state_root(&self) -> Result<Hash, NodeError> {
        let root = self.hv.create_state_root().await?;
        let pending = std::mem::take(&mut *self.forwarders.lock().expect("forwarders poisoned"));
        for forwarder in pending {
            let _ = forwarder.await;
        }
        Ok(root)
    }

    pub fn set_state_root(&self, root: Hash) -> Result<(), NodeError> {
        Ok(self.hv.set_state_root(root)?)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, NodeError> {
    to_canonical_cbor(value).map_err(NodeError::Encode)
}
