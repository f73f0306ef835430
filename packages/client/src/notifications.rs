//! Servers that announced work, and a wait that can be interrupted.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use netschedule_core::ServerAddress;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Result of [`ServerNotifications::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A server announced work; it is removed from the ready set.
    Notified(ServerAddress),
    /// [`ServerNotifications::interrupt`] was called.
    Interrupted,
    TimedOut,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<ServerAddress>,
    interrupted: bool,
}

/// Ready set of servers plus a single wake permit.
///
/// `Notify` keeps at most one permit, so any number of pushes or
/// interrupts while nobody waits wakes the next waiter exactly once.
#[derive(Debug, Default)]
pub struct ServerNotifications {
    state: Mutex<State>,
    wake: Notify,
}

impl ServerNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `server` has work; returns false if it was already ready.
    pub fn push(&self, server: ServerAddress) -> bool {
        {
            let mut state = self.lock();
            if state.ready.contains(&server) {
                return false;
            }
            state.ready.push_back(server);
        }
        self.wake.notify_one();
        true
    }

    /// Make a blocked (or the next) waiter return [`WaitOutcome::Interrupted`].
    ///
    /// Ready servers are kept.
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.wake.notify_one();
    }

    /// Remove every ready server, oldest first.
    pub fn drain(&self) -> Vec<ServerAddress> {
        self.lock().ready.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ready.is_empty()
    }

    /// Wait until a server is ready, an interrupt arrives or `deadline`.
    pub async fn wait(&self, deadline: Instant) -> WaitOutcome {
        loop {
            {
                let mut state = self.lock();
                if state.interrupted {
                    state.interrupted = false;
                    return WaitOutcome::Interrupted;
                }
                if let Some(server) = state.ready.pop_front() {
                    return WaitOutcome::Notified(server);
                }
            }
            if tokio::time::timeout_at(deadline, self.wake.notified())
                .await
                .is_err()
            {
                return WaitOutcome::TimedOut;
            }
        }
    }
}
