//! Error handling and edge case tests.

use change_listener::{
    ChangeCursor, ChangeListenerContainer, ChangeSource, ChangeStreamRequest, CollectingListener,
    ContainerConfig, ContainerError, CursorPoll, MappingContext, MemoryChangeSource,
    MemorySourceConfig, ResumeToken, SubscribeOptions, Subscription, SubscriptionId,
    SubscriptionState,
};
use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Person {
    id: String,
    firstname: String,
    age: u32,
}

#[derive(Clone, Debug, Deserialize)]
struct Ship {
    #[allow(dead_code)]
    name: String,
}

/// Counts subscribe calls on the way to an in-memory source.
struct CountingSource {
    inner: MemoryChangeSource,
    calls: Arc<AtomicUsize>,
}

impl ChangeSource for CountingSource {
    fn subscribe(
        &self,
        collection: &str,
        options: &SubscribeOptions,
    ) -> change_listener::Result<Box<dyn ChangeCursor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribe(collection, options)
    }
}

/// Opens always succeed; every cursor breaks on its first poll.
struct BrokenCursorSource {
    opens: Arc<AtomicUsize>,
}

struct BrokenCursor;

impl ChangeCursor for BrokenCursor {
    fn next(&mut self, _timeout: Duration) -> change_listener::Result<CursorPoll> {
        Err(ContainerError::SourceConnection("connection reset".to_string()))
    }
}

impl ChangeSource for BrokenCursorSource {
    fn subscribe(
        &self,
        _collection: &str,
        _options: &SubscribeOptions,
    ) -> change_listener::Result<Box<dyn ChangeCursor>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(BrokenCursor))
    }
}

fn fast_config() -> ContainerConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    ContainerConfig {
        poll_interval: Duration::from_millis(10),
        retry_backoff: Duration::from_millis(5),
        max_retry_backoff: Duration::from_millis(20),
        ..Default::default()
    }
}

fn test_container(source: &MemoryChangeSource) -> ChangeListenerContainer {
    ChangeListenerContainer::with_config(
        Arc::new(source.clone()),
        MappingContext::new().with_entity::<Person>("person"),
        fast_config(),
    )
}

fn counting_container(source: &MemoryChangeSource) -> (ChangeListenerContainer, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counting = CountingSource {
        inner: source.clone(),
        calls: Arc::clone(&calls),
    };
    let container = ChangeListenerContainer::with_config(
        Arc::new(counting),
        MappingContext::new(),
        fast_config(),
    );
    (container, calls)
}

fn wait_for_state(subscription: &Subscription, state: SubscriptionState) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if subscription.state() == state {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn person(id: &str, age: u32) -> Person {
    Person {
        id: id.to_string(),
        firstname: id.to_uppercase(),
        age,
    }
}

// --- Registration Errors ---

#[test]
fn test_unmapped_type_rejected() {
    let source = MemoryChangeSource::new();
    let container = test_container(&source);

    let request = ChangeStreamRequest::builder(CollectingListener::<Ship>::new())
        .collection("ship")
        .build();
    let result = container.register(request);

    assert!(matches!(result, Err(ContainerError::InvalidRequest(_))));
    assert_eq!(container.subscription_count(), 0);
}

#[test]
fn test_collection_mismatch_rejected() {
    let source = MemoryChangeSource::new();
    let container = test_container(&source);

    let request = ChangeStreamRequest::builder(CollectingListener::<Person>::new())
        .collection("ship")
        .build();

    assert!(matches!(
        container.register(request),
        Err(ContainerError::InvalidRequest(_))
    ));
}

#[test]
fn test_missing_collection_rejected() {
    let source = MemoryChangeSource::new();
    let container = test_container(&source);

    // Value is mappable but bound to no collection
    let request = ChangeStreamRequest::builder(CollectingListener::<Value>::new()).build();
    assert!(matches!(
        container.register(request),
        Err(ContainerError::InvalidRequest(_))
    ));

    let request = ChangeStreamRequest::builder(CollectingListener::<Value>::new())
        .collection("")
        .build();
    assert!(matches!(
        container.register(request),
        Err(ContainerError::InvalidRequest(_))
    ));
}

#[test]
fn test_register_after_shutdown() {
    let source = MemoryChangeSource::new();
    let container = test_container(&source);
    container.shutdown().unwrap();

    let request = ChangeStreamRequest::builder(CollectingListener::<Person>::new()).build();
    assert!(matches!(
        container.register(request),
        Err(ContainerError::InvalidRequest(_))
    ));
}

// --- Delivery Faults ---

#[test]
fn test_conversion_failure_skips_record() {
    let source = MemoryChangeSource::new();
    let container = test_container(&source);
    let listener = CollectingListener::<Person>::new();

    let subscription = container
        .register(ChangeStreamRequest::builder(listener.clone()).build())
        .unwrap();
    assert!(subscription.await_active(WAIT));

    source
        .save("person", &json!({"id": "broken", "firstname": 5}))
        .unwrap();
    source.save("person", &person("ash", 35)).unwrap();

    assert!(listener.await_messages(1, WAIT));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(listener.bodies(), vec![person("ash", 35)]);
    assert!(subscription.is_active());
}

#[test]
fn test_listener_error_does_not_stop_delivery() {
    let source = MemoryChangeSource::new();
    let container = test_container(&source);
    let (tx, rx) = unbounded();
    let mut seen = 0;

    let request = ChangeStreamRequest::<Value>::from_fn(move |event| {
        seen += 1;
        let _ = tx.send(event.document_key().clone());
        if seen == 1 {
            return Err("first event rejected".into());
        }
        Ok(())
    })
    .collection("counter")
    .build();
    let subscription = container.register(request).unwrap();
    assert!(subscription.await_active(WAIT));

    for i in 0..3 {
        source.save("counter", &json!({ "id": i })).unwrap();
    }

    let keys: Vec<Value> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(keys, vec![json!("0"), json!("1"), json!("2")]);
    assert!(subscription.is_active());
}

#[test]
fn test_listener_panic_does_not_stop_delivery() {
    let source = MemoryChangeSource::new();
    let container = test_container(&source);
    let (tx, rx) = unbounded();

    let request = ChangeStreamRequest::<Value>::from_fn(move |event| {
        if event.document_key() == &json!("bad") {
            panic!("listener blew up");
        }
        let _ = tx.send(event.document_key().clone());
        Ok(())
    })
    .collection("counter")
    .build();
    let subscription = container.register(request).unwrap();
    assert!(subscription.await_active(WAIT));

    source.save("counter", &json!({"id": "bad"})).unwrap();
    source.save("counter", &json!({"id": "good"})).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), json!("good"));
    assert!(subscription.is_active());
}

// --- Connection Errors ---

#[test]
fn test_reconnect_without_loss_or_duplicates() {
    let source = MemoryChangeSource::new();
    let container = test_container(&source);
    let listener = CollectingListener::<Person>::new();

    let subscription = container
        .register(ChangeStreamRequest::builder(listener.clone()).build())
        .unwrap();
    assert!(subscription.await_active(WAIT));

    source.save("person", &person("gabriel", 30)).unwrap();
    assert!(listener.await_messages(1, WAIT));

    source.interrupt();
    source.save("person", &person("ash", 35)).unwrap();
    source.save("person", &person("michael", 30)).unwrap();

    assert!(listener.await_messages(3, WAIT));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        listener.bodies(),
        vec![person("gabriel", 30), person("ash", 35), person("michael", 30)]
    );
    assert!(subscription.is_active());
}

#[test]
fn test_retry_recovers_within_attempts() {
    let source = MemoryChangeSource::new();
    let (container, calls) = counting_container(&source);
    source.fail_next_subscribes(2);

    let request = ChangeStreamRequest::builder(CollectingListener::<Value>::new())
        .collection("person")
        .build();
    let subscription = container.register(request).unwrap();

    assert!(subscription.await_active(WAIT));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_unavailable_source_fails_subscription() {
    let source = MemoryChangeSource::new();
    let (container, calls) = counting_container(&source);
    source.set_available(false);

    let (tx, rx) = unbounded();
    let request = ChangeStreamRequest::builder(CollectingListener::<Value>::new())
        .collection("person")
        .error_handler(move |id: SubscriptionId, error: &ContainerError| {
            let _ = tx.send((id, error.to_string()));
        })
        .build();
    let subscription = container.register(request).unwrap();

    assert!(!subscription.await_active(WAIT));
    assert_eq!(subscription.state(), SubscriptionState::Failed);

    let (id, message) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(id, subscription.id());
    assert!(message.contains("unavailable"));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(source.open_cursors(), 0);
    assert_eq!(container.subscription_count(), 0);
}

#[test]
fn test_connection_lost_after_activation() {
    let source = MemoryChangeSource::new();
    let container = test_container(&source);
    let (tx, rx) = unbounded();
    container.set_error_handler(move |id: SubscriptionId, _error: &ContainerError| {
        let _ = tx.send(id);
    });

    let subscription = container
        .register(ChangeStreamRequest::builder(CollectingListener::<Person>::new()).build())
        .unwrap();
    assert!(subscription.await_active(WAIT));

    source.set_available(false);
    source.interrupt();

    assert!(wait_for_state(&subscription, SubscriptionState::Failed));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), subscription.id());
}

#[test]
fn test_cursor_breaking_after_every_open_fails() {
    let opens = Arc::new(AtomicUsize::new(0));
    let source = BrokenCursorSource {
        opens: Arc::clone(&opens),
    };
    let container = ChangeListenerContainer::with_config(
        Arc::new(source),
        MappingContext::new(),
        fast_config(),
    );

    let (tx, rx) = unbounded();
    let request = ChangeStreamRequest::builder(CollectingListener::<Value>::new())
        .collection("person")
        .error_handler(move |id: SubscriptionId, error: &ContainerError| {
            let _ = tx.send((id, error.to_string()));
        })
        .build();
    let subscription = container.register(request).unwrap();

    let (id, message) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(id, subscription.id());
    assert!(message.contains("connection reset"));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    assert_eq!(subscription.state(), SubscriptionState::Failed);
    assert_eq!(opens.load(Ordering::SeqCst), 3);
}

#[test]
fn test_resume_token_out_of_history() {
    let source = MemoryChangeSource::with_config(MemorySourceConfig { oplog_capacity: 2 });
    for i in 0..5 {
        source.save("person", &person(&format!("p{}", i), 20 + i)).unwrap();
    }
    let container = test_container(&source);

    let request = ChangeStreamRequest::builder(CollectingListener::<Person>::new())
        .resume_after(ResumeToken(1))
        .build();
    let subscription = container.register(request).unwrap();

    assert!(wait_for_state(&subscription, SubscriptionState::Failed));
}

// --- Shutdown Errors ---

#[test]
fn test_shutdown_timeout_reports_stuck_worker() {
    let source = MemoryChangeSource::new();
    let container = test_container(&source);
    let (entered_tx, entered_rx) = unbounded();
    let (release_tx, release_rx) = unbounded::<()>();

    let request = ChangeStreamRequest::<Value>::from_fn(move |_event| {
        let _ = entered_tx.send(());
        let _ = release_rx.recv_timeout(WAIT);
        Ok(())
    })
    .collection("person")
    .build();
    let subscription = container.register(request).unwrap();
    assert!(subscription.await_active(WAIT));

    source.save("person", &json!({"id": "ash"})).unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    let started = Instant::now();
    let result = container.shutdown_with_timeout(Duration::from_millis(100));
    assert!(started.elapsed() < WAIT);
    match result {
        Err(ContainerError::ShutdownTimeout { subscriptions }) => {
            assert_eq!(subscriptions, vec![subscription.id()]);
        }
        other => panic!("Expected shutdown timeout, got {:?}", other),
    }
    assert_eq!(subscription.state(), SubscriptionState::Cancelled);

    // The detached worker exits once its listener returns
    release_tx.send(()).unwrap();
    let deadline = Instant::now() + WAIT;
    while source.open_cursors() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(source.open_cursors(), 0);
}
