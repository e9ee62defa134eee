//! Widget-side conversation session. Remembers the thread id the relay
//! handed back so later turns continue the same conversation.
//!
//! Every `reset` starts a new epoch. A turn reads the epoch before it is sent
//! and may only bind the session if no reset happened while it was in flight.

use std::sync::{Mutex, MutexGuard};

use palaver_core::types::ThreadId;
use tracing::debug;

#[derive(Debug, Default)]
struct Binding {
    thread: Option<ThreadId>,
    epoch: u64,
}

#[derive(Debug, Default)]
pub struct Session {
    binding: Mutex<Binding>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a known conversation.
    pub fn with_thread(thread: ThreadId) -> Self {
        Self {
            binding: Mutex::new(Binding {
                thread: Some(thread),
                epoch: 0,
            }),
        }
    }

    fn binding(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.binding().thread.clone()
    }

    /// Current thread id together with the epoch it belongs to.
    pub fn snapshot(&self) -> (Option<ThreadId>, u64) {
        let b = self.binding();
        (b.thread.clone(), b.epoch)
    }

    /// Record the thread id from a turn response sent during `epoch`. Only the
    /// first id sticks, and nothing is recorded once the session was reset.
    pub fn adopt_if(&self, epoch: u64, thread: &ThreadId) -> bool {
        let mut b = self.binding();
        if b.epoch != epoch {
            debug!("ignoring {thread}: session was reset");
            return false;
        }
        if b.thread.is_some() {
            return false;
        }
        debug!("session bound to {thread}");
        b.thread = Some(thread.clone());
        true
    }

    /// Replace the thread with one created during `epoch`, opening a new epoch
    /// so turns still in flight on the old thread cannot rebind it.
    pub fn rebind_if(&self, epoch: u64, thread: &ThreadId) -> bool {
        let mut b = self.binding();
        if b.epoch != epoch {
            return false;
        }
        debug!("session moved to {thread}");
        b.thread = Some(thread.clone());
        b.epoch += 1;
        true
    }

    /// Forget the thread; the next turn starts a new conversation.
    pub fn reset(&self) {
        let mut b = self.binding();
        b.thread = None;
        b.epoch += 1;
    }
}
