use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::driver::Driver;
use crate::error::KernelError;
use crate::id::ActorId;
use crate::message::Message;

/// Delivery order: sender clock first, then sender (external input before any
/// actor), then arrival.
type QueueKey = (u64, Option<ActorId>, u64);

#[derive(Default)]
struct State {
    queue: BTreeMap<QueueKey, Message>,
    next_seq: u64,
    running: bool,
    /// Snapshots in progress. While non-zero, queued messages wait.
    frozen: u32,
    idle_waiter: Option<oneshot::Sender<()>>,
}

impl State {
    fn register_waiter(&mut self) -> Result<oneshot::Receiver<()>, KernelError> {
        if self.idle_waiter.as_ref().is_some_and(|w| !w.is_closed()) {
            return Err(KernelError::IdleWaiterBusy);
        }
        let (tx, rx) = oneshot::channel();
        self.idle_waiter = Some(tx);
        Ok(rx)
    }
}

/// Pending messages, running/idle tracking and the driver table.
///
/// Only one drain task exists at a time: [`Scheduler::queue`] reports when the
/// caller has to start one, and [`Scheduler::finish`] is the only way back to
/// idle. A frozen scheduler accepts messages but starts no drain until
/// [`Scheduler::thaw`].
pub struct Scheduler {
    state: Mutex<State>,
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl Scheduler {
    pub(crate) fn new(drivers: BTreeMap<String, Arc<dyn Driver>>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            drivers,
        }
    }

    /// Returns `true` when this call moved the scheduler from idle to running.
    /// Never `true` while frozen.
    pub(crate) fn queue(&self, messages: Vec<Message>) -> bool {
        if messages.is_empty() {
            return false;
        }
        let mut state = self.state.lock().expect("scheduler poisoned");
        for message in messages {
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .queue
                .insert((message.from_ticks(), message.from_id(), seq), message);
        }
        if state.running || state.frozen > 0 {
            return false;
        }
        state.running = true;
        true
    }

    pub(crate) fn pop(&self) -> Option<Message> {
        let mut state = self.state.lock().expect("scheduler poisoned");
        state.queue.pop_first().map(|(_, message)| message)
    }

    /// Go idle if nothing was queued since the last `pop`. Returns `false`
    /// when the drain has to keep going.
    pub(crate) fn finish(&self) -> bool {
        let mut state = self.state.lock().expect("scheduler poisoned");
        if !state.queue.is_empty() {
            return false;
        }
        state.running = false;
        if let Some(waiter) = state.idle_waiter.take() {
            let _ = waiter.send(());
        }
        true
    }

    /// `None` if already idle; otherwise a receiver fired on the next idle
    /// transition. Only one waiter may be registered at a time.
    pub(crate) fn wait_idle(&self) -> Result<Option<oneshot::Receiver<()>>, KernelError> {
        let mut state = self.state.lock().expect("scheduler poisoned");
        if !state.running {
            return Ok(None);
        }
        state.register_waiter().map(Some)
    }

    /// Freeze if idle. Otherwise behaves like [`Scheduler::wait_idle`] and the
    /// caller retries once the receiver fires.
    pub(crate) fn freeze_when_idle(&self) -> Result<Option<oneshot::Receiver<()>>, KernelError> {
        let mut state = self.state.lock().expect("scheduler poisoned");
        if !state.running {
            state.frozen += 1;
            return Ok(None);
        }
        state.register_waiter().map(Some)
    }

    /// Freeze only if idle right now.
    pub(crate) fn try_freeze(&self) -> bool {
        let mut state = self.state.lock().expect("scheduler poisoned");
        if state.running {
            return false;
        }
        state.frozen += 1;
        true
    }

    /// Undo one freeze. Returns `true` when messages queued meanwhile need a
    /// drain started, exactly like [`Scheduler::queue`].
    pub(crate) fn thaw(&self) -> bool {
        let mut state = self.state.lock().expect("scheduler poisoned");
        state.frozen = state.frozen.saturating_sub(1);
        if state.frozen > 0 || state.running || state.queue.is_empty() {
            return false;
        }
        state.running = true;
        true
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("scheduler poisoned").running
    }

    pub fn pending(&self) -> usize {
        self.state.lock().expect("scheduler poisoned").queue.len()
    }

    pub fn driver(&self, id: &str) -> Option<&Arc<dyn Driver>> {
        self.drivers.get(id)
    }

    pub fn driver_ids(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }
}
