//! Listener container for change streams.
//!
//! The container runs one dedicated worker thread per subscription. A worker:
//! - opens a cursor on the source and marks the subscription active
//! - pulls records one at a time, filters and converts them
//! - dispatches each event to the listener before pulling the next
//! - reconnects with backoff after a connection error, resuming after the
//!   last record it saw
//!
//! Subscriptions move `Pending -> Active -> Cancelled | Failed`. Cancellation
//! is cooperative: it takes effect between two dispatches, never inside one.
//!
//! # Example
//!
//! ```ignore
//! let source = MemoryChangeSource::new();
//! let mapping = MappingContext::new().with_entity::<Person>("person");
//! let container = ChangeListenerContainer::new(source.clone(), mapping);
//!
//! let listener = CollectingListener::<Person>::new();
//! let request = ChangeStreamRequest::builder(listener.clone())
//!     .filter(ChangeFilter::operation_types([OperationType::Insert]))
//!     .build();
//! let subscription = container.register(request)?;
//! subscription.await_active(Duration::from_millis(200));
//!
//! source.save("person", &gabriel)?;
//! listener.await_next_messages(1, Duration::from_secs(1));
//!
//! container.shutdown()?;
//! ```

mod manager;
mod subscription;
mod types;
mod worker;

pub use manager::ChangeListenerContainer;
pub use subscription::Subscription;
pub use types::{
    ChangeStreamRequest, ChangeStreamRequestBuilder, ContainerConfig, SubscriptionId,
    SubscriptionState,
};
