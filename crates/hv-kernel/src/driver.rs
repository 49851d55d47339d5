use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::KernelError;
use crate::message::{IntoMessages, Message};

/// A non-actor message destination (egress, logging, system addresses).
#[async_trait]
pub trait Driver: Send + Sync {
    fn id(&self) -> &str;

    /// Called once while the hypervisor is being built.
    async fn startup(&self, _hypervisor: HypervisorHandle) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle a message addressed to this driver. Failures are reported on
    /// the message receipt and never retried.
    async fn on_message(&self, message: &Message) -> anyhow::Result<()>;
}

pub(crate) trait Dispatch: Send + Sync {
    fn dispatch(self: Arc<Self>, messages: Vec<Message>);
}

/// Non-owning reference to a hypervisor, handed to drivers at startup.
#[derive(Clone)]
pub struct HypervisorHandle {
    inner: Weak<dyn Dispatch>,
}

impl HypervisorHandle {
    pub(crate) fn new(inner: Weak<dyn Dispatch>) -> Self {
        Self { inner }
    }

    pub fn send(&self, messages: impl IntoMessages) -> Result<(), KernelError> {
        let inner = self.inner.upgrade().ok_or(KernelError::Shutdown)?;
        inner.dispatch(messages.into_messages());
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl std::fmt::Debug for HypervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}
