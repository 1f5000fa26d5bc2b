//! Core types for change records and converted events.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position of a change record in the source's log.
///
/// A cursor opened with `resume_after = Some(token)` yields records strictly
/// after `token`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ResumeToken(pub u64);

impl ResumeToken {
    /// Token preceding every record; resuming after it replays the retained log.
    pub const START: ResumeToken = ResumeToken(0);

    pub fn next(self) -> Self {
        ResumeToken(self.0 + 1)
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of mutation a change record describes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    /// The collection was dropped.
    Drop,
    /// The stream can no longer continue.
    Invalidate,
    Other(String),
}

impl OperationType {
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::Invalidate => "invalidate",
            OperationType::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "insert" => OperationType::Insert,
            "update" => OperationType::Update,
            "replace" => OperationType::Replace,
            "delete" => OperationType::Delete,
            "drop" => OperationType::Drop,
            "invalidate" => OperationType::Invalidate,
            other => OperationType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for OperationType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OperationType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(OperationType::parse(&name))
    }
}

/// Field-level description of an update.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    pub updated_fields: Map<String, Value>,
    pub removed_fields: Vec<String>,
}

/// A change record as produced by the source, before conversion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawChangeRecord {
    pub resume_token: ResumeToken,
    pub collection: String,
    pub operation_type: OperationType,
    /// Identifier of the affected document (`Value::Null` for collection-level events).
    pub document_key: Value,
    /// Full document for inserts and replaces; post-image for updates when looked up.
    pub full_document: Option<Value>,
    pub update_description: Option<UpdateDescription>,
    pub cluster_time: Timestamp,
}

impl RawChangeRecord {
    /// JSON view of the record that filters are evaluated against.
    ///
    /// Layout: `operationType`, `ns.coll`, `documentKey._id`, `fullDocument`,
    /// `updateDescription.updatedFields`, `updateDescription.removedFields`,
    /// `clusterTime`.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("operationType".into(), json!(self.operation_type.as_str()));
        doc.insert("ns".into(), json!({ "coll": self.collection }));
        doc.insert("documentKey".into(), json!({ "_id": self.document_key }));
        if let Some(full) = &self.full_document {
            doc.insert("fullDocument".into(), full.clone());
        }
        if let Some(update) = &self.update_description {
            doc.insert(
                "updateDescription".into(),
                json!({
                    "updatedFields": update.updated_fields,
                    "removedFields": update.removed_fields,
                }),
            );
        }
        doc.insert("clusterTime".into(), json!(self.cluster_time.0));
        Value::Object(doc)
    }
}

/// A change record converted for a listener.
///
/// `body` is present when the record carries a document that converted to
/// `T`; collection-level events and deletes have none.
#[derive(Clone, Debug)]
pub struct ChangeEvent<T> {
    raw: RawChangeRecord,
    body: Option<T>,
}

impl<T> ChangeEvent<T> {
    pub fn new(raw: RawChangeRecord, body: Option<T>) -> Self {
        Self { raw, body }
    }

    pub fn operation_type(&self) -> &OperationType {
        &self.raw.operation_type
    }

    pub fn collection(&self) -> &str {
        &self.raw.collection
    }

    pub fn resume_token(&self) -> ResumeToken {
        self.raw.resume_token
    }

    pub fn document_key(&self) -> &Value {
        &self.raw.document_key
    }

    pub fn raw(&self) -> &RawChangeRecord {
        &self.raw
    }

    pub fn body(&self) -> Option<&T> {
        self.body.as_ref()
    }

    pub fn into_body(self) -> Option<T> {
        self.body
    }

    pub fn into_parts(self) -> (RawChangeRecord, Option<T>) {
        (self.raw, self.body)
    }
}
