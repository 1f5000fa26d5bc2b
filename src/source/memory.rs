//! In-memory document store with change streams.
//!
//! Writes go through [`MemoryChangeSource::save`], [`update_by_id`],
//! [`delete_by_id`] and [`drop_collection`]; each appends a record to a
//! bounded oplog and pushes it to every open cursor on the collection.
//!
//! The source can also misbehave on purpose: [`interrupt`] breaks all open
//! cursors, [`fail_next_subscribes`] and [`set_available`] make opening
//! cursors fail.
//!
//! [`update_by_id`]: MemoryChangeSource::update_by_id
//! [`delete_by_id`]: MemoryChangeSource::delete_by_id
//! [`drop_collection`]: MemoryChangeSource::drop_collection
//! [`interrupt`]: MemoryChangeSource::interrupt
//! [`fail_next_subscribes`]: MemoryChangeSource::fail_next_subscribes
//! [`set_available`]: MemoryChangeSource::set_available

use super::{ChangeCursor, ChangeSource, CursorPoll, FullDocument, SubscribeOptions};
use crate::error::{ContainerError, Result};
use crate::filter::ChangeFilter;
use crate::types::{OperationType, RawChangeRecord, ResumeToken, Timestamp, UpdateDescription};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Configuration for the in-memory source.
#[derive(Clone, Debug)]
pub struct MemorySourceConfig {
    /// Number of change records retained for resuming cursors.
    /// Default: 10000
    pub oplog_capacity: usize,
}

impl Default for MemorySourceConfig {
    fn default() -> Self {
        Self {
            oplog_capacity: 10_000,
        }
    }
}

enum CursorMessage {
    Record(RawChangeRecord),
    Interrupted,
}

/// Delivery side of one open cursor.
struct CursorFeed {
    collection: String,
    filter: ChangeFilter,
    full_document: FullDocument,
    sender: Sender<CursorMessage>,
    alive: Weak<()>,
}

impl CursorFeed {
    fn is_open(&self) -> bool {
        self.alive.strong_count() > 0
    }

    /// Push a record if it concerns this cursor. Returns false once the cursor is gone.
    fn offer(&self, record: &RawChangeRecord) -> bool {
        if !self.is_open() {
            return false;
        }
        if record.collection != self.collection {
            return true;
        }
        let record = prepare(record, self.full_document);
        if !self.filter.matches(&record) {
            return true;
        }
        self.sender.send(CursorMessage::Record(record)).is_ok()
    }
}

fn prepare(record: &RawChangeRecord, full_document: FullDocument) -> RawChangeRecord {
    let mut record = record.clone();
    if record.operation_type == OperationType::Update && full_document == FullDocument::Default {
        record.full_document = None;
    }
    record
}

struct SourceState {
    collections: HashMap<String, BTreeMap<String, Value>>,
    oplog: VecDeque<RawChangeRecord>,
    last_token: ResumeToken,
    next_generated_id: u64,
    cursors: Vec<CursorFeed>,
    available: bool,
    failing_subscribes: u32,
}

impl SourceState {
    fn publish(&mut self, capacity: usize, record: RawChangeRecord) {
        self.cursors.retain(|feed| feed.offer(&record));
        if capacity == 0 {
            return;
        }
        if self.oplog.len() == capacity {
            self.oplog.pop_front();
        }
        self.oplog.push_back(record);
    }

    fn next_token(&mut self) -> ResumeToken {
        self.last_token = self.last_token.next();
        self.last_token
    }

    /// True when records after `token` have been evicted.
    fn history_lost(&self, token: ResumeToken) -> bool {
        if token >= self.last_token {
            return false;
        }
        match self.oplog.front() {
            Some(oldest) => oldest.resume_token > token.next(),
            None => true,
        }
    }
}

struct Shared {
    config: MemorySourceConfig,
    state: Mutex<SourceState>,
}

/// In-memory document store and change source.
///
/// Clones share the same data.
#[derive(Clone)]
pub struct MemoryChangeSource {
    shared: Arc<Shared>,
}

impl MemoryChangeSource {
    pub fn new() -> Self {
        Self::with_config(MemorySourceConfig::default())
    }

    pub fn with_config(config: MemorySourceConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(SourceState {
                    collections: HashMap::new(),
                    oplog: VecDeque::new(),
                    last_token: ResumeToken::START,
                    next_generated_id: 1,
                    cursors: Vec::new(),
                    available: true,
                    failing_subscribes: 0,
                }),
            }),
        }
    }

    // --- Persistence ---

    /// Insert or replace a document, returning its id.
    ///
    /// The id is taken from the `id` or `_id` field, or generated and written
    /// to `id` when neither is present.
    pub fn save<D: Serialize>(&self, collection: &str, document: &D) -> Result<String> {
        let mut document = to_object(serde_json::to_value(document)?)?;
        let mut state = self.shared.state.lock();

        let id = match document_id(&document) {
            Some(id) => id,
            None => {
                let id = format!("{:024x}", state.next_generated_id);
                state.next_generated_id += 1;
                document.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let document = Value::Object(document);
        let previous = state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), document.clone());

        let operation_type = if previous.is_some() {
            OperationType::Replace
        } else {
            OperationType::Insert
        };
        let record = RawChangeRecord {
            resume_token: state.next_token(),
            collection: collection.to_string(),
            operation_type,
            document_key: json!(id),
            full_document: Some(document),
            update_description: None,
            cluster_time: Timestamp::now(),
        };
        state.publish(self.shared.config.oplog_capacity, record);

        Ok(id)
    }

    /// Set fields on an existing document. Returns false if it does not exist.
    pub fn update_by_id<V: Serialize>(&self, collection: &str, id: &str, set: &V) -> Result<bool> {
        let set = to_object(serde_json::to_value(set)?)?;
        let mut state = self.shared.state.lock();

        let Some(document) = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
        else {
            return Ok(false);
        };

        if let Value::Object(fields) = &mut *document {
            for (key, value) in &set {
                fields.insert(key.clone(), value.clone());
            }
        }
        let post_image = document.clone();

        let record = RawChangeRecord {
            resume_token: state.next_token(),
            collection: collection.to_string(),
            operation_type: OperationType::Update,
            document_key: json!(id),
            full_document: Some(post_image),
            update_description: Some(UpdateDescription {
                updated_fields: set,
                removed_fields: Vec::new(),
            }),
            cluster_time: Timestamp::now(),
        };
        state.publish(self.shared.config.oplog_capacity, record);

        Ok(true)
    }

    /// Delete a document. Returns false if it does not exist.
    pub fn delete_by_id(&self, collection: &str, id: &str) -> bool {
        let mut state = self.shared.state.lock();
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id));
        if removed.is_none() {
            return false;
        }

        let record = RawChangeRecord {
            resume_token: state.next_token(),
            collection: collection.to_string(),
            operation_type: OperationType::Delete,
            document_key: json!(id),
            full_document: None,
            update_description: None,
            cluster_time: Timestamp::now(),
        };
        state.publish(self.shared.config.oplog_capacity, record);
        true
    }

    /// Drop a collection. Open cursors on it see the drop, then end.
    pub fn drop_collection(&self, collection: &str) -> bool {
        let mut state = self.shared.state.lock();
        if state.collections.remove(collection).is_none() {
            return false;
        }

        let record = RawChangeRecord {
            resume_token: state.next_token(),
            collection: collection.to_string(),
            operation_type: OperationType::Drop,
            document_key: Value::Null,
            full_document: None,
            update_description: None,
            cluster_time: Timestamp::now(),
        };
        state.publish(self.shared.config.oplog_capacity, record);
        state.cursors.retain(|feed| feed.collection != collection);
        true
    }

    pub fn find_by_id<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        let state = self.shared.state.lock();
        match state.collections.get(collection).and_then(|docs| docs.get(id)) {
            Some(document) => Ok(Some(T::deserialize(document)?)),
            None => Ok(None),
        }
    }

    pub fn count(&self, collection: &str) -> usize {
        self.shared
            .state
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Token of the most recent change record.
    pub fn last_token(&self) -> ResumeToken {
        self.shared.state.lock().last_token
    }

    /// Number of cursors that have not been dropped.
    pub fn open_cursors(&self) -> usize {
        self.shared
            .state
            .lock()
            .cursors
            .iter()
            .filter(|feed| feed.is_open())
            .count()
    }

    // --- Fault injection ---

    /// Break every open cursor with a connection error.
    pub fn interrupt(&self) {
        let mut state = self.shared.state.lock();
        for feed in state.cursors.drain(..) {
            let _ = feed.sender.send(CursorMessage::Interrupted);
        }
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.shared.state.lock().failing_subscribes = count;
    }

    /// While unavailable every subscribe call fails.
    pub fn set_available(&self, available: bool) {
        self.shared.state.lock().available = available;
    }

    /// End every open stream normally.
    pub fn close(&self) {
        self.shared.state.lock().cursors.clear();
    }
}

impl Default for MemoryChangeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSource for MemoryChangeSource {
    fn subscribe(
        &self,
        collection: &str,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn ChangeCursor>> {
        let mut state = self.shared.state.lock();

        if !state.available {
            return Err(ContainerError::SourceConnection(
                "source unavailable".to_string(),
            ));
        }
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(ContainerError::SourceConnection(
                "connection refused".to_string(),
            ));
        }

        let (sender, receiver) = unbounded();
        let alive = Arc::new(());
        let feed = CursorFeed {
            collection: collection.to_string(),
            filter: options.filter.clone(),
            full_document: options.full_document,
            sender,
            alive: Arc::downgrade(&alive),
        };

        if let Some(token) = options.resume_after {
            if state.history_lost(token) {
                return Err(ContainerError::SourceConnection(format!(
                    "resume token {} no longer in oplog",
                    token
                )));
            }
            for record in state.oplog.iter().filter(|r| r.resume_token > token) {
                feed.offer(record);
            }
        }

        state.cursors.push(feed);

        let position = options.resume_after.unwrap_or(state.last_token);
        Ok(Box::new(MemoryCursor {
            receiver,
            position,
            broken: false,
            _alive: alive,
        }))
    }
}

/// Cursor over a [`MemoryChangeSource`] collection.
pub struct MemoryCursor {
    receiver: Receiver<CursorMessage>,
    /// Token of the last record yielded, or where the cursor was opened.
    position: ResumeToken,
    broken: bool,
    _alive: Arc<()>,
}

impl ChangeCursor for MemoryCursor {
    fn next(&mut self, timeout: Duration) -> Result<CursorPoll> {
        if self.broken {
            return Err(ContainerError::SourceConnection(
                "cursor interrupted".to_string(),
            ));
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(CursorMessage::Record(record)) => {
                self.position = record.resume_token;
                Ok(CursorPoll::Record(record))
            }
            Ok(CursorMessage::Interrupted) => {
                self.broken = true;
                Err(ContainerError::SourceConnection(
                    "cursor interrupted".to_string(),
                ))
            }
            Err(RecvTimeoutError::Timeout) => Ok(CursorPoll::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(CursorPoll::EndOfStream),
        }
    }

    fn resume_token(&self) -> Option<ResumeToken> {
        Some(self.position)
    }
}

fn to_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ContainerError::InvalidOperation(format!(
            "documents must be JSON objects, got {}",
            other
        ))),
    }
}

fn document_id(document: &Map<String, Value>) -> Option<String> {
    match document.get("id").or_else(|| document.get("_id"))? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
