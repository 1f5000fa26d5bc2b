//! Subscription lifecycle state shared between caller, container and worker.

use super::manager::ContainerInner;
use super::types::{SubscriptionId, SubscriptionState};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Lifecycle state of one subscription.
///
/// Transitions are compare-and-swap on `state`; `signal`/`changed` only wake
/// threads waiting for a transition.
pub(crate) struct SubscriptionShared {
    id: SubscriptionId,
    collection: String,
    state: AtomicU8,
    signal: Mutex<()>,
    changed: Condvar,
}

impl SubscriptionShared {
    pub(crate) fn new(id: SubscriptionId, collection: String) -> Self {
        Self {
            id,
            collection,
            state: AtomicU8::new(SubscriptionState::Pending as u8),
            signal: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn collection(&self) -> &str {
        &self.collection
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Move to `next` if allowed from the current state. The first writer of
    /// a terminal state wins; later writers get false.
    fn transition(&self, next: SubscriptionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !SubscriptionState::from_u8(current).can_become(next) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // Taking the lock orders this wakeup after any waiter's state check.
        let _guard = self.signal.lock();
        self.changed.notify_all();
        true
    }

    pub(crate) fn activate(&self) -> bool {
        self.transition(SubscriptionState::Active)
    }

    pub(crate) fn cancel(&self) -> bool {
        self.transition(SubscriptionState::Cancelled)
    }

    pub(crate) fn fail(&self) -> bool {
        self.transition(SubscriptionState::Failed)
    }

    /// Block until active. False on timeout or if the subscription ended.
    pub(crate) fn await_active(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.signal.lock();
        loop {
            match self.state() {
                SubscriptionState::Active => return true,
                state if state.is_terminal() => return false,
                _ => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut guard, deadline).timed_out() {
                        return self.state() == SubscriptionState::Active;
                    }
                }
                None => self.changed.wait(&mut guard),
            }
        }
    }

    /// Sleep for `duration`, waking early on a terminal transition.
    /// Returns true if the subscription is terminal.
    pub(crate) fn sleep_unless_terminal(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let mut guard = self.signal.lock();
        while !self.is_terminal() {
            let Some(deadline) = deadline else {
                self.changed.wait(&mut guard);
                continue;
            };
            if self.changed.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_terminal()
    }
}

/// Handle to a registered subscription.
///
/// Clones refer to the same subscription. The handle does not keep the
/// container alive.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
    container: Weak<ContainerInner>,
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SubscriptionShared>, container: Weak<ContainerInner>) -> Self {
        Self { shared, container }
    }

    pub fn id(&self) -> SubscriptionId {
        self.shared.id()
    }

    pub fn collection(&self) -> &str {
        self.shared.collection()
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Block until the subscription is active or `timeout` elapses.
    ///
    /// Returns false on timeout without cancelling, and returns false early if
    /// the subscription is cancelled or fails first.
    pub fn await_active(&self, timeout: Duration) -> bool {
        self.shared.await_active(timeout)
    }

    /// Cancel and wait for the worker to release its cursor. Idempotent.
    pub fn cancel(&self) {
        match self.container.upgrade() {
            Some(container) => container.cancel(self.id()),
            None => {
                self.shared.cancel();
            }
        }
    }

    /// Mark cancelled without waiting for the worker.
    pub(crate) fn signal_cancel(&self) {
        self.shared.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("collection", &self.collection())
            .field("state", &self.state())
            .finish()
    }
}
