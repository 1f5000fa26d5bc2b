//! # Change Listener
//!
//! A listener container for database change streams. It turns a blocking,
//! cursor-style change feed into typed listener calls, with one dedicated
//! worker per subscription and explicit start/stop and cancellation.
//!
//! ## Core Concepts
//!
//! - **Source**: opens cursors over a collection's change stream
//! - **Subscription**: a filtered interest in one collection, `Pending` until
//!   its cursor is live
//! - **Listener**: receives converted events one at a time, in source order
//! - **Container**: owns the workers and their lifecycle
//!
//! ## Example
//!
//! ```ignore
//! use change_listener::{
//!     ChangeFilter, ChangeListenerContainer, ChangeStreamRequest, CollectingListener,
//!     MappingContext, MemoryChangeSource, OperationType,
//! };
//!
//! let source = MemoryChangeSource::new();
//! let container = ChangeListenerContainer::new(
//!     source.clone(),
//!     MappingContext::new().with_entity::<Person>("person"),
//! );
//!
//! // Only inserts are of interest
//! let listener = CollectingListener::<Person>::new();
//! let subscription = container.register(
//!     ChangeStreamRequest::builder(listener.clone())
//!         .filter(ChangeFilter::operation_types([OperationType::Insert]))
//!         .build(),
//! )?;
//! subscription.await_active(Duration::from_millis(200));
//!
//! source.save("person", &Person::new("Gabriel", "Lorca", 30))?;
//! listener.await_next_messages(1, Duration::from_secs(1));
//! ```

pub mod container;
pub mod error;
pub mod filter;
pub mod listener;
pub mod mapping;
pub mod source;
pub mod stream;
pub mod types;

// Re-exports
pub use container::{
    ChangeListenerContainer, ChangeStreamRequest, ChangeStreamRequestBuilder, ContainerConfig,
    Subscription, SubscriptionId, SubscriptionState,
};
pub use error::{ContainerError, Result};
pub use filter::{ChangeFilter, Criterion};
pub use listener::{
    CollectingListener, ErrorHandler, FnListener, ListenerError, ListenerResult, MessageListener,
};
pub use mapping::{EntityMapping, MappingContext};
pub use source::{
    ChangeCursor, ChangeSource, CursorPoll, FullDocument, MemoryChangeSource, MemorySourceConfig,
    SubscribeOptions,
};
pub use stream::ChangeStream;
pub use types::{
    ChangeEvent, OperationType, RawChangeRecord, ResumeToken, Timestamp, UpdateDescription,
};
