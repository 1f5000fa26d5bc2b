//! Pull-style change streams.
//!
//! [`ChangeStream`] is the iterator counterpart of a listener: the worker
//! pushes each event into a bounded channel with a blocking send, so a
//! consumer that stops pulling holds the worker back instead of letting
//! events pile up. Cancelling the stream also aborts a send blocked on a
//! full buffer.

use crate::container::{ChangeListenerContainer, ChangeStreamRequest, Subscription};
use crate::error::Result;
use crate::listener::ListenerError;
use crate::source::SubscribeOptions;
use crate::types::ChangeEvent;
use crossbeam_channel::{
    bounded, select, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// A subscription consumed by pulling events.
///
/// Dropping the stream cancels the subscription without waiting for the
/// worker. Once the subscription ends and buffered events are drained,
/// receiving returns a disconnected error and iteration stops.
pub struct ChangeStream<T> {
    subscription: Subscription,
    receiver: Receiver<ChangeEvent<T>>,
    /// Dropping it wakes a worker blocked on a full buffer.
    closed: Mutex<Option<Sender<()>>>,
}

impl<T> ChangeStream<T> {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn await_active(&self, timeout: Duration) -> bool {
        self.subscription.await_active(timeout)
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> std::result::Result<ChangeEvent<T>, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<ChangeEvent<T>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<ChangeEvent<T>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Cancel and wait for the worker to stop. Events still buffered can be
    /// received afterwards.
    pub fn cancel(&self) {
        self.subscription.signal_cancel();
        self.close();
        self.subscription.cancel();
    }

    fn close(&self) {
        self.closed.lock().take();
    }
}

impl<T> Iterator for ChangeStream<T> {
    type Item = ChangeEvent<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

impl<T> Drop for ChangeStream<T> {
    fn drop(&mut self) {
        self.subscription.signal_cancel();
        self.close();
    }
}

impl ChangeListenerContainer {
    /// Open a pull-style stream over `collection`.
    ///
    /// At most `buffer` events wait in the stream; beyond that the worker
    /// blocks until the consumer catches up.
    pub fn change_stream<T>(
        &self,
        collection: &str,
        options: SubscribeOptions,
        buffer: usize,
    ) -> Result<ChangeStream<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (sender, receiver) = bounded(buffer);
        let (closed_tx, closed_rx) = bounded::<()>(0);
        let mut builder = ChangeStreamRequest::from_fn(move |event: ChangeEvent<T>| {
            select! {
                send(sender, event) -> sent => {
                    sent.map_err(|_| ListenerError::from("change stream closed"))
                }
                // Cancelled while the buffer is full: the event is dropped
                recv(closed_rx) -> _ => Ok(()),
            }
        })
        .collection(collection)
        .filter(options.filter)
        .full_document(options.full_document);
        if let Some(token) = options.resume_after {
            builder = builder.resume_after(token);
        }

        let subscription = self.register(builder.build())?;
        Ok(ChangeStream {
            subscription,
            receiver,
            closed: Mutex::new(Some(closed_tx)),
        })
    }
}
