//! Listener and error-handler callbacks.

use crate::container::SubscriptionId;
use crate::error::ContainerError;
use crate::types::ChangeEvent;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Error a listener may return. It is logged and delivery continues.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a single dispatch.
pub type ListenerResult = std::result::Result<(), ListenerError>;

/// Receives converted change events, one at a time, in source order.
///
/// Called only from the subscription's worker thread. Returning an error or
/// panicking is logged and does not stop delivery.
pub trait MessageListener<T>: Send {
    fn on_message(&mut self, event: ChangeEvent<T>) -> ListenerResult;
}

/// Adapter turning a closure into a [`MessageListener`].
pub struct FnListener<F>(pub F);

impl<T, F> MessageListener<T> for FnListener<F>
where
    F: FnMut(ChangeEvent<T>) -> ListenerResult + Send,
{
    fn on_message(&mut self, event: ChangeEvent<T>) -> ListenerResult {
        (self.0)(event)
    }
}

/// Notified when a subscription fails terminally.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, subscription: SubscriptionId, error: &ContainerError);
}

impl<F> ErrorHandler for F
where
    F: Fn(SubscriptionId, &ContainerError) + Send + Sync,
{
    fn handle_error(&self, subscription: SubscriptionId, error: &ContainerError) {
        self(subscription, error)
    }
}

/// Listener that stores every event it receives.
///
/// Clones share the same buffer, so one clone can be registered while
/// another is used to wait for and inspect deliveries.
pub struct CollectingListener<T> {
    inner: Arc<Collected<T>>,
}

struct Collected<T> {
    messages: Mutex<Vec<ChangeEvent<T>>>,
    arrived: Condvar,
}

impl<T> CollectingListener<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Collected {
                messages: Mutex::new(Vec::new()),
                arrived: Condvar::new(),
            }),
        }
    }

    pub fn message_count(&self) -> usize {
        self.inner.messages.lock().len()
    }

    /// Wait until `count` messages in total have arrived.
    pub fn await_messages(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut messages = self.inner.messages.lock();
        while messages.len() < count {
            if self
                .inner
                .arrived
                .wait_until(&mut messages, deadline)
                .timed_out()
            {
                return messages.len() >= count;
            }
        }
        true
    }

    /// Wait until `count` more messages arrive than have been seen so far.
    pub fn await_next_messages(&self, count: usize, timeout: Duration) -> bool {
        let target = self.message_count() + count;
        self.await_messages(target, timeout)
    }
}

impl<T: Clone> CollectingListener<T> {
    pub fn messages(&self) -> Vec<ChangeEvent<T>> {
        self.inner.messages.lock().clone()
    }

    /// Converted bodies of all received messages, skipping those without one.
    pub fn bodies(&self) -> Vec<T> {
        self.inner
            .messages
            .lock()
            .iter()
            .filter_map(|m| m.body().cloned())
            .collect()
    }
}

impl<T> Clone for CollectingListener<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CollectingListener<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> MessageListener<T> for CollectingListener<T> {
    fn on_message(&mut self, event: ChangeEvent<T>) -> ListenerResult {
        self.inner.messages.lock().push(event);
        self.inner.arrived.notify_all();
        Ok(())
    }
}
