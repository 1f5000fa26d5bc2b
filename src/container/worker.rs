//! Per-subscription worker loop.
//!
//! Each worker owns its cursor and its listener. It pulls one record at a
//! time and dispatches it before pulling the next, so a slow listener
//! throttles the pull and nothing is buffered or dropped on the way.

use super::subscription::SubscriptionShared;
use super::types::{ChangeStreamRequest, ContainerConfig};
use crate::error::ContainerError;
use crate::filter::ChangeFilter;
use crate::listener::{ErrorHandler, MessageListener};
use crate::mapping::MappingContext;
use crate::source::{ChangeCursor, ChangeSource, CursorPoll, SubscribeOptions};
use crate::types::{ChangeEvent, RawChangeRecord, ResumeToken};
use crossbeam_channel::Sender;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Type-erased worker, runnable on its own thread.
pub(crate) trait Runnable: Send {
    fn run(self: Box<Self>);
}

/// A listener bound to its subscription and filter.
pub(crate) struct ListenerRegistration<T> {
    subscription: Arc<SubscriptionShared>,
    filter: ChangeFilter,
    listener: Box<dyn MessageListener<T>>,
}

impl<T: DeserializeOwned> ListenerRegistration<T> {
    /// Filter, convert and dispatch one record.
    fn deliver(&mut self, record: RawChangeRecord, mapping: &MappingContext) {
        if !self.filter.matches(&record) {
            return;
        }

        let body = match &record.full_document {
            Some(document) => match mapping.convert::<T>(document) {
                Ok(body) => Some(body),
                Err(e) => {
                    warn!(
                        subscription_id = self.subscription.id().0,
                        resume_token = record.resume_token.0,
                        error = %e,
                        "skipping record that failed conversion"
                    );
                    return;
                }
            },
            None => None,
        };

        let token = record.resume_token;
        let event = ChangeEvent::new(record, body);
        let listener = &mut self.listener;
        match panic::catch_unwind(AssertUnwindSafe(|| listener.on_message(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                subscription_id = self.subscription.id().0,
                resume_token = token.0,
                error = %e,
                "listener returned an error"
            ),
            Err(payload) => warn!(
                subscription_id = self.subscription.id().0,
                resume_token = token.0,
                panic = panic_message(payload.as_ref()),
                "listener panicked"
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// How a cursor stopped being consumed.
enum Consumed {
    /// The subscription reached a terminal state.
    Stopped,
    EndOfStream,
    /// The cursor failed; `progressed` if it yielded anything before failing.
    Disconnected {
        error: ContainerError,
        progressed: bool,
    },
}

pub(crate) struct Worker<T> {
    shared: Arc<SubscriptionShared>,
    source: Arc<dyn ChangeSource>,
    mapping: Arc<MappingContext>,
    registration: ListenerRegistration<T>,
    options: SubscribeOptions,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    config: ContainerConfig,
    /// Dropped when the worker exits; the container waits on the paired receiver.
    _done: Sender<()>,
}

impl<T> Worker<T> {
    pub(crate) fn new(
        shared: Arc<SubscriptionShared>,
        source: Arc<dyn ChangeSource>,
        mapping: Arc<MappingContext>,
        request: ChangeStreamRequest<T>,
        default_error_handler: Option<Arc<dyn ErrorHandler>>,
        config: ContainerConfig,
        done: Sender<()>,
    ) -> Self {
        let registration = ListenerRegistration {
            subscription: Arc::clone(&shared),
            filter: request.options.filter.clone(),
            listener: request.listener,
        };
        Self {
            shared,
            source,
            mapping,
            registration,
            options: request.options,
            error_handler: request.error_handler.or(default_error_handler),
            config,
            _done: done,
        }
    }
}

impl<T: DeserializeOwned + Send> Worker<T> {
    fn run_loop(&mut self) {
        let id = self.shared.id().0;
        let mut resume_after = self.options.resume_after;
        let mut failed_attempts = 0u32;

        while !self.shared.is_terminal() {
            let options = SubscribeOptions {
                resume_after,
                ..self.options.clone()
            };

            // Attempts reset only once a cursor makes progress, so a connection
            // that breaks right after every open still runs out of attempts.
            let cursor = match self.source.subscribe(self.shared.collection(), &options) {
                Ok(cursor) => cursor,
                Err(e) => {
                    failed_attempts += 1;
                    if !self.retry_or_fail(failed_attempts, e) {
                        return;
                    }
                    continue;
                }
            };

            if !self.ensure_active() {
                debug!(subscription_id = id, "cancelled before activation");
                return;
            }
            if let Some(position) = cursor.resume_token() {
                resume_after = Some(position);
            }

            match self.consume(cursor, &mut resume_after) {
                Consumed::Stopped => return,
                Consumed::EndOfStream => {
                    if self.shared.cancel() {
                        info!(subscription_id = id, "change stream ended");
                    }
                    return;
                }
                Consumed::Disconnected { error, progressed } => {
                    if progressed {
                        failed_attempts = 0;
                    }
                    failed_attempts += 1;
                    warn!(subscription_id = id, error = %error, "cursor lost");
                    if !self.retry_or_fail(failed_attempts, error) {
                        return;
                    }
                }
            }
        }
    }

    /// Activate on the first successful open. False if the subscription is
    /// already terminal.
    fn ensure_active(&self) -> bool {
        if self.shared.activate() {
            info!(
                subscription_id = self.shared.id().0,
                collection = self.shared.collection(),
                "subscription active"
            );
        }
        !self.shared.is_terminal()
    }

    /// Pull and dispatch until cancelled, ended or disconnected. The cursor is
    /// dropped on return.
    fn consume(
        &mut self,
        mut cursor: Box<dyn ChangeCursor>,
        resume_after: &mut Option<ResumeToken>,
    ) -> Consumed {
        let mut progressed = false;
        loop {
            if self.shared.is_terminal() {
                return Consumed::Stopped;
            }

            let record = match cursor.next(self.config.poll_interval) {
                Ok(CursorPoll::Record(record)) => record,
                Ok(CursorPoll::Idle) => {
                    progressed = true;
                    continue;
                }
                Ok(CursorPoll::EndOfStream) => return Consumed::EndOfStream,
                Err(error) => return Consumed::Disconnected { error, progressed },
            };
            progressed = true;

            // Cancellation takes effect between pull and dispatch.
            if self.shared.is_terminal() {
                return Consumed::Stopped;
            }

            *resume_after = Some(record.resume_token);
            self.registration.deliver(record, &self.mapping);
        }
    }

    /// Back off before the next open, or fail once attempts are exhausted.
    /// `attempt` counts failed opens and lost cursors since the last progress.
    /// Returns true to retry.
    fn retry_or_fail(&self, attempt: u32, e: ContainerError) -> bool {
        let id = self.shared.id();

        if attempt >= self.config.max_connect_attempts.max(1) {
            error!(
                subscription_id = id.0,
                attempts = attempt,
                error = %e,
                "giving up on change stream"
            );
            if self.shared.fail() {
                if let Some(handler) = &self.error_handler {
                    handler.handle_error(id, &e);
                }
            }
            return false;
        }

        let delay = self.config.backoff(attempt);
        warn!(
            subscription_id = id.0,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "change stream unavailable, retrying"
        );
        !self.shared.sleep_unless_terminal(delay)
    }
}

impl<T: DeserializeOwned + Send> Runnable for Worker<T> {
    fn run(mut self: Box<Self>) {
        debug!(
            subscription_id = self.shared.id().0,
            collection = self.shared.collection(),
            "worker started"
        );
        self.run_loop();
        debug!(
            subscription_id = self.shared.id().0,
            state = ?self.shared.state(),
            "worker stopped"
        );
    }
}
