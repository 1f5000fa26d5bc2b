//! Change filters.
//!
//! A [`ChangeFilter`] is a conjunction of [`Criterion`]s evaluated against the
//! document view of a change record (see [`RawChangeRecord::to_document`]).
//! Paths are dotted: `operationType`, `fullDocument.age`, `ns.coll`.
//!
//! ```ignore
//! // only inserts of people older than 30
//! let filter = ChangeFilter::operation_types([OperationType::Insert])
//!     .and(Criterion::gt("fullDocument.age", 30));
//! ```

use crate::error::{ContainerError, Result};
use crate::types::{OperationType, RawChangeRecord};
use serde_json::Value;
use std::cmp::Ordering;

/// A single predicate on one field of the record view.
#[derive(Clone, Debug, PartialEq)]
pub enum Criterion {
    /// Field equals value. A missing field equals `null`.
    Is(String, Value),
    /// Negation of `Is`.
    Ne(String, Value),
    /// Field equals any of the values.
    In(String, Vec<Value>),
    /// Field is present (`true`) or absent (`false`).
    Exists(String, bool),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
}

impl Criterion {
    pub fn is(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Criterion::Is(path.into(), value.into())
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Criterion::Ne(path.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(
        path: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Criterion::In(path.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn exists(path: impl Into<String>, present: bool) -> Self {
        Criterion::Exists(path.into(), present)
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Criterion::Gt(path.into(), value.into())
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Criterion::Gte(path.into(), value.into())
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Criterion::Lt(path.into(), value.into())
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Criterion::Lte(path.into(), value.into())
    }

    fn path(&self) -> &str {
        match self {
            Criterion::Is(p, _)
            | Criterion::Ne(p, _)
            | Criterion::In(p, _)
            | Criterion::Exists(p, _)
            | Criterion::Gt(p, _)
            | Criterion::Gte(p, _)
            | Criterion::Lt(p, _)
            | Criterion::Lte(p, _) => p,
        }
    }

    fn validate(&self) -> Result<()> {
        let path = self.path();
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ContainerError::InvalidRequest(format!(
                "invalid field path '{}'",
                path
            )));
        }
        if let Criterion::In(_, values) = self {
            if values.is_empty() {
                return Err(ContainerError::InvalidRequest(format!(
                    "'in' criterion on '{}' has no values and can never match",
                    path
                )));
            }
        }
        Ok(())
    }

    /// Evaluate against a record document view.
    pub fn matches(&self, doc: &Value) -> bool {
        let field = resolve(doc, self.path());
        match self {
            Criterion::Is(_, expected) => equals(field, expected),
            Criterion::Ne(_, expected) => !equals(field, expected),
            Criterion::In(_, values) => values.iter().any(|v| equals(field, v)),
            Criterion::Exists(_, present) => field.is_some() == *present,
            Criterion::Gt(_, bound) => compare(field, bound) == Some(Ordering::Greater),
            Criterion::Gte(_, bound) => matches!(
                compare(field, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Criterion::Lt(_, bound) => compare(field, bound) == Some(Ordering::Less),
            Criterion::Lte(_, bound) => {
                matches!(compare(field, bound), Some(Ordering::Less | Ordering::Equal))
            }
        }
    }
}

/// Conjunction of criteria. The empty filter is the wildcard.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeFilter {
    criteria: Vec<Criterion>,
}

impl ChangeFilter {
    /// Match every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match records whose operation type is one of `types`.
    pub fn operation_types(types: impl IntoIterator<Item = OperationType>) -> Self {
        let names: Vec<Value> = types
            .into_iter()
            .map(|op| Value::String(op.as_str().to_string()))
            .collect();
        Self {
            criteria: vec![Criterion::In("operationType".to_string(), names)],
        }
    }

    /// Match records satisfying a single criterion.
    pub fn matching(criterion: Criterion) -> Self {
        Self {
            criteria: vec![criterion],
        }
    }

    /// Add a criterion to the conjunction.
    pub fn and(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn is_wildcard(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Reject filters that are malformed or can never match.
    pub fn validate(&self) -> Result<()> {
        self.criteria.iter().try_for_each(Criterion::validate)
    }

    pub fn matches(&self, record: &RawChangeRecord) -> bool {
        if self.criteria.is_empty() {
            return true;
        }
        let doc = record.to_document();
        self.matches_document(&doc)
    }

    pub fn matches_document(&self, doc: &Value) -> bool {
        self.criteria.iter().all(|c| c.matches(doc))
    }
}

fn resolve<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match (field, expected) {
        (None, Value::Null) => true,
        (None, _) => false,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(actual), _) => actual == expected,
    }
}

fn compare(field: Option<&Value>, bound: &Value) -> Option<Ordering> {
    match (field?, bound) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
