//! Container configuration, requests and subscription identifiers.

use crate::filter::ChangeFilter;
use crate::listener::{ErrorHandler, FnListener, ListenerResult, MessageListener};
use crate::source::{FullDocument, SubscribeOptions};
use crate::types::{ChangeEvent, ResumeToken};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a listener container.
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Start running on construction. When false, registrations stay pending
    /// until `start` is called.
    /// Default: true
    pub auto_startup: bool,

    /// Longest a worker blocks on a cursor before re-checking cancellation.
    /// Default: 50ms
    pub poll_interval: Duration,

    /// Consecutive failed cursor opens before a subscription fails.
    /// Default: 3
    pub max_connect_attempts: u32,

    /// Delay before the first reconnect; doubles on each further attempt.
    /// Default: 50ms
    pub retry_backoff: Duration,

    /// Upper bound for the reconnect delay.
    /// Default: 1s
    pub max_retry_backoff: Duration,

    /// How long `shutdown` and `stop` wait for workers.
    /// Default: 5s
    pub shutdown_timeout: Duration,

    /// Worker threads are named `<prefix>-<subscription id>`.
    pub thread_name_prefix: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            auto_startup: true,
            poll_interval: Duration::from_millis(50),
            max_connect_attempts: 3,
            retry_backoff: Duration::from_millis(50),
            max_retry_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            thread_name_prefix: "change-listener".to_string(),
        }
    }
}

impl ContainerConfig {
    /// Reconnect delay after `attempt` consecutive failures (1-based).
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a subscription.
///
/// `Pending -> Active -> Cancelled | Failed`, or straight from `Pending` to a
/// terminal state. Terminal states never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    /// Registered, cursor not yet open.
    Pending = 0,
    /// Cursor open, events are delivered.
    Active = 1,
    /// Cancelled by the caller or ended by the source.
    Cancelled = 2,
    /// Gave up reconnecting.
    Failed = 3,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionState::Cancelled | SubscriptionState::Failed)
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Pending,
            1 => SubscriptionState::Active,
            2 => SubscriptionState::Cancelled,
            _ => SubscriptionState::Failed,
        }
    }

    pub(crate) fn can_become(self, next: SubscriptionState) -> bool {
        match next {
            SubscriptionState::Pending => false,
            SubscriptionState::Active => self == SubscriptionState::Pending,
            SubscriptionState::Cancelled | SubscriptionState::Failed => !self.is_terminal(),
        }
    }
}

/// A request to listen to one collection's change stream.
///
/// ```ignore
/// let request = ChangeStreamRequest::builder(listener.clone())
///     .collection("person")
///     .filter(ChangeFilter::operation_types([OperationType::Insert]))
///     .build();
/// let subscription = container.register::<Person>(request)?;
/// ```
pub struct ChangeStreamRequest<T> {
    pub(crate) listener: Box<dyn MessageListener<T>>,
    pub(crate) collection: Option<String>,
    pub(crate) options: SubscribeOptions,
    pub(crate) error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl<T> ChangeStreamRequest<T> {
    pub fn builder(listener: impl MessageListener<T> + 'static) -> ChangeStreamRequestBuilder<T> {
        ChangeStreamRequestBuilder {
            request: ChangeStreamRequest {
                listener: Box::new(listener),
                collection: None,
                options: SubscribeOptions::default(),
                error_handler: None,
            },
        }
    }

    /// Builder for a closure listener.
    pub fn from_fn<F>(listener: F) -> ChangeStreamRequestBuilder<T>
    where
        F: FnMut(ChangeEvent<T>) -> ListenerResult + Send + 'static,
        T: 'static,
    {
        Self::builder(FnListener(listener))
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.options.filter
    }
}

/// Builder for [`ChangeStreamRequest`].
pub struct ChangeStreamRequestBuilder<T> {
    request: ChangeStreamRequest<T>,
}

impl<T> ChangeStreamRequestBuilder<T> {
    /// Collection to listen to. Defaults to the collection the target type is
    /// mapped to.
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.request.collection = Some(collection.into());
        self
    }

    /// Records to deliver. Defaults to every record.
    pub fn filter(mut self, filter: ChangeFilter) -> Self {
        self.request.options.filter = filter;
        self
    }

    pub fn full_document(mut self, full_document: FullDocument) -> Self {
        self.request.options.full_document = full_document;
        self
    }

    /// Start after `token` instead of at the live end of the stream.
    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.request.options.resume_after = Some(token);
        self
    }

    /// Handler notified if the subscription fails. Overrides the container default.
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.request.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> ChangeStreamRequest<T> {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use SubscriptionState::*;

        assert!(Pending.can_become(Active));
        assert!(Pending.can_become(Cancelled));
        assert!(Pending.can_become(Failed));
        assert!(Active.can_become(Cancelled));
        assert!(Active.can_become(Failed));
        assert!(!Active.can_become(Active));
        assert!(!Active.can_become(Pending));

        for terminal in [Cancelled, Failed] {
            for next in [Pending, Active, Cancelled, Failed] {
                assert!(!terminal.can_become(next));
            }
        }
    }

    #[test]
    fn test_state_roundtrip() {
        use SubscriptionState::*;
        for state in [Pending, Active, Cancelled, Failed] {
            assert_eq!(SubscriptionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ContainerConfig {
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(350));
        assert_eq!(config.backoff(40), Duration::from_millis(350));
    }
}
