//! Listener container: registry of subscriptions and their workers.

use super::subscription::{Subscription, SubscriptionShared};
use super::types::{ChangeStreamRequest, ContainerConfig, SubscriptionId};
use super::worker::{Runnable, Worker};
use crate::error::{ContainerError, Result};
use crate::listener::ErrorHandler;
use crate::mapping::MappingContext;
use crate::source::ChangeSource;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// A registered subscription and its worker.
struct WorkerSlot {
    shared: Arc<SubscriptionShared>,
    /// Worker not yet started (container not running).
    deferred: Option<Box<dyn Runnable>>,
    thread: Option<JoinHandle<()>>,
    /// Disconnects when the worker exits.
    done: Receiver<()>,
}

impl WorkerSlot {
    fn launch(&mut self, thread_name_prefix: &str) -> Result<()> {
        let Some(worker) = self.deferred.take() else {
            return Ok(());
        };
        let name = format!("{}-{}", thread_name_prefix, self.shared.id());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())
            .map_err(|e| ContainerError::WorkerSpawn(e.to_string()))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// True if the worker runs on the calling thread, i.e. a listener is
    /// acting on its own subscription.
    fn is_current_thread(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|t| t.thread().id() == thread::current().id())
    }

    fn is_finished(&self) -> bool {
        self.shared.is_terminal() && self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the worker to exit. Returns false if it did not exit by `deadline`.
    fn join(self, deadline: Option<Instant>) -> bool {
        let id = self.shared.id();
        let Some(thread) = self.thread else {
            return true;
        };
        if thread.thread().id() == thread::current().id() {
            return true;
        }

        let exited = match deadline {
            Some(deadline) => !matches!(
                self.done.recv_deadline(deadline),
                Err(RecvTimeoutError::Timeout)
            ),
            None => {
                let _ = self.done.recv();
                true
            }
        };
        if !exited {
            // Dropping the handle detaches the thread; it exits once its
            // listener returns and it observes the cancellation.
            return false;
        }

        if thread.join().is_err() {
            error!(subscription_id = id.0, "worker thread panicked");
        }
        true
    }
}

struct Registry {
    running: bool,
    shut_down: bool,
    slots: HashMap<SubscriptionId, WorkerSlot>,
}

impl Registry {
    /// Forget subscriptions whose workers have exited on their own.
    fn prune(&mut self) {
        self.slots.retain(|_, slot| !slot.is_finished());
    }
}

/// Shared container state. Subscription handles hold a weak reference.
pub(crate) struct ContainerInner {
    source: Arc<dyn ChangeSource>,
    mapping: Arc<MappingContext>,
    config: ContainerConfig,
    default_error_handler: RwLock<Option<Arc<dyn ErrorHandler>>>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl ContainerInner {
    pub(crate) fn cancel(&self, id: SubscriptionId) {
        let Some(slot) = self.registry.lock().slots.remove(&id) else {
            return;
        };
        if slot.shared.cancel() {
            debug!(subscription_id = id.0, "subscription cancelled");
        }
        if slot.is_current_thread() {
            return;
        }
        slot.join(None);
    }

    fn cancel_all(&self, slots: Vec<WorkerSlot>, timeout: Duration) -> Result<()> {
        for slot in &slots {
            slot.shared.cancel();
        }

        let deadline = Instant::now().checked_add(timeout);
        let count = slots.len();
        let mut stuck = Vec::new();
        for slot in slots {
            let id = slot.shared.id();
            if !slot.join(deadline) {
                stuck.push(id);
            }
        }

        if stuck.is_empty() {
            info!(subscriptions = count, "all subscriptions stopped");
            Ok(())
        } else {
            stuck.sort();
            error!(
                stuck = ?stuck,
                timeout_ms = timeout.as_millis() as u64,
                "workers did not stop in time"
            );
            Err(ContainerError::ShutdownTimeout { subscriptions: stuck })
        }
    }
}

/// Runs one dedicated worker per subscription, each turning a blocking
/// change cursor into listener calls.
///
/// ```ignore
/// let container = ChangeListenerContainer::new(source.clone(), mapping);
/// let listener = CollectingListener::<Person>::new();
/// let request = ChangeStreamRequest::builder(listener.clone())
///     .collection("person")
///     .filter(ChangeFilter::operation_types([OperationType::Insert]))
///     .build();
///
/// let subscription = container.register(request)?;
/// subscription.await_active(Duration::from_millis(200));
/// ```
pub struct ChangeListenerContainer {
    inner: Arc<ContainerInner>,
}

impl ChangeListenerContainer {
    pub fn new(source: impl ChangeSource + 'static, mapping: MappingContext) -> Self {
        Self::with_config(Arc::new(source), mapping, ContainerConfig::default())
    }

    pub fn with_config(
        source: Arc<dyn ChangeSource>,
        mapping: MappingContext,
        config: ContainerConfig,
    ) -> Self {
        let running = config.auto_startup;
        Self {
            inner: Arc::new(ContainerInner {
                source,
                mapping: Arc::new(mapping),
                config,
                default_error_handler: RwLock::new(None),
                registry: Mutex::new(Registry {
                    running,
                    shut_down: false,
                    slots: HashMap::new(),
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.inner.config
    }

    /// Type mappings; further types may be registered at any time.
    pub fn mapping(&self) -> &MappingContext {
        &self.inner.mapping
    }

    /// Handler for failed subscriptions whose request did not set one.
    pub fn set_error_handler(&self, handler: impl ErrorHandler + 'static) {
        *self.inner.default_error_handler.write() = Some(Arc::new(handler));
    }

    /// Register a listener.
    ///
    /// Returns a pending subscription at once; the worker opens the cursor in
    /// the background (or on `start` if the container is not running).
    pub fn register<T>(&self, request: ChangeStreamRequest<T>) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
    {
        request.options.filter.validate()?;
        let collection = self
            .inner
            .mapping
            .resolve_collection::<T>(request.collection.as_deref())?;

        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let shared = Arc::new(SubscriptionShared::new(id, collection));
        let (done_tx, done_rx) = bounded(0);
        let worker = Worker::new(
            Arc::clone(&shared),
            Arc::clone(&self.inner.source),
            Arc::clone(&self.inner.mapping),
            request,
            self.inner.default_error_handler.read().clone(),
            self.inner.config.clone(),
            done_tx,
        );
        let mut slot = WorkerSlot {
            shared: Arc::clone(&shared),
            deferred: Some(Box::new(worker)),
            thread: None,
            done: done_rx,
        };

        let mut registry = self.inner.registry.lock();
        if registry.shut_down {
            shared.cancel();
            return Err(ContainerError::InvalidRequest(
                "container has been shut down".to_string(),
            ));
        }
        registry.prune();

        // Spawning does not wait on the worker, so it is safe under the lock.
        if registry.running {
            if let Err(e) = slot.launch(&self.inner.config.thread_name_prefix) {
                shared.fail();
                return Err(e);
            }
        }
        let running = registry.running;
        registry.slots.insert(id, slot);
        drop(registry);

        debug!(
            subscription_id = id.0,
            collection = shared.collection(),
            running,
            "subscription registered"
        );
        Ok(Subscription::new(shared, Arc::downgrade(&self.inner)))
    }

    /// Block until `subscription` is active or `timeout` elapses.
    pub fn await_active(&self, subscription: &Subscription, timeout: Duration) -> bool {
        subscription.await_active(timeout)
    }

    /// Cancel a subscription and wait for its worker to release the cursor.
    /// Idempotent.
    pub fn cancel(&self, subscription: &Subscription) {
        self.inner.cancel(subscription.id());
    }

    /// Launch workers for pending registrations and run new ones immediately.
    pub fn start(&self) -> Result<()> {
        let mut registry = self.inner.registry.lock();
        if registry.shut_down {
            return Err(ContainerError::InvalidRequest(
                "container has been shut down".to_string(),
            ));
        }
        registry.running = true;

        let mut first_error = None;
        for slot in registry.slots.values_mut() {
            if slot.shared.is_terminal() {
                slot.deferred = None;
                continue;
            }
            if let Err(e) = slot.launch(&self.inner.config.thread_name_prefix) {
                error!(subscription_id = slot.shared.id().0, error = %e, "failed to start worker");
                slot.shared.fail();
                first_error.get_or_insert(e);
            }
        }
        let pending = registry.slots.len();
        drop(registry);

        info!(subscriptions = pending, "container started");
        first_error.map_or(Ok(()), Err)
    }

    /// Cancel every subscription and stop running. The container can be
    /// started again afterwards.
    pub fn stop(&self) -> Result<()> {
        let slots = {
            let mut registry = self.inner.registry.lock();
            registry.running = false;
            registry.slots.drain().map(|(_, slot)| slot).collect()
        };
        self.inner.cancel_all(slots, self.inner.config.shutdown_timeout)
    }

    pub fn is_running(&self) -> bool {
        self.inner.registry.lock().running
    }

    /// Cancel every subscription and wait for all workers, using the
    /// configured shutdown timeout. The container rejects further use.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(self.inner.config.shutdown_timeout)
    }

    pub fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        let slots = {
            let mut registry = self.inner.registry.lock();
            registry.running = false;
            registry.shut_down = true;
            registry.slots.drain().map(|(_, slot)| slot).collect()
        };
        self.inner.cancel_all(slots, timeout)
    }

    /// Number of subscriptions that are pending or active.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .slots
            .values()
            .filter(|slot| !slot.shared.is_terminal())
            .count()
    }

    /// Handles to all registered subscriptions, ordered by id.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let registry = self.inner.registry.lock();
        let mut subscriptions: Vec<_> = registry
            .slots
            .values()
            .map(|slot| Subscription::new(Arc::clone(&slot.shared), Arc::downgrade(&self.inner)))
            .collect();
        subscriptions.sort_by_key(Subscription::id);
        subscriptions
    }
}

impl Drop for ChangeListenerContainer {
    fn drop(&mut self) {
        if self.inner.registry.lock().shut_down {
            return;
        }
        if let Err(e) = self.shutdown() {
            error!(error = %e, "shutdown on drop failed");
        }
    }
}
