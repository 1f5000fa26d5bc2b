//! Mapping between source documents and target types.
//!
//! A type can only be the target of a subscription once it is registered
//! here. Registration optionally binds the type to a collection; requests for
//! that type then default to, and must agree with, the bound collection.
//! `serde_json::Value` is always mapped and receives documents untouched.

use crate::error::{ContainerError, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{type_name, TypeId};
use std::collections::HashMap;

/// Mapping metadata for one registered type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityMapping {
    pub type_name: &'static str,
    /// Collection the type is stored in (None = any collection).
    pub collection: Option<String>,
}

/// Registry of mappable types.
pub struct MappingContext {
    entities: RwLock<HashMap<TypeId, EntityMapping>>,
}

impl MappingContext {
    pub fn new() -> Self {
        let context = Self {
            entities: RwLock::new(HashMap::new()),
        };
        context.register::<Value>();
        context
    }

    /// Register `T` as mappable from documents of any collection.
    pub fn register<T: DeserializeOwned + 'static>(&self) {
        self.insert::<T>(None);
    }

    /// Register `T` as the entity stored in `collection`.
    pub fn register_for<T: DeserializeOwned + 'static>(&self, collection: impl Into<String>) {
        self.insert::<T>(Some(collection.into()));
    }

    /// Builder-style `register_for`.
    pub fn with_entity<T: DeserializeOwned + 'static>(self, collection: impl Into<String>) -> Self {
        self.register_for::<T>(collection);
        self
    }

    fn insert<T: 'static>(&self, collection: Option<String>) {
        self.entities.write().insert(
            TypeId::of::<T>(),
            EntityMapping {
                type_name: type_name::<T>(),
                collection,
            },
        );
    }

    pub fn mapping_for<T: 'static>(&self) -> Option<EntityMapping> {
        self.entities.read().get(&TypeId::of::<T>()).cloned()
    }

    /// Resolve the collection a subscription for `T` reads from.
    pub fn resolve_collection<T: 'static>(&self, requested: Option<&str>) -> Result<String> {
        let mapping = self.mapping_for::<T>().ok_or_else(|| {
            ContainerError::InvalidRequest(format!(
                "no mapping registered for type {}",
                type_name::<T>()
            ))
        })?;

        match (requested, mapping.collection) {
            (Some(requested), Some(bound)) if requested != bound => {
                Err(ContainerError::InvalidRequest(format!(
                    "type {} is mapped to collection '{}', not '{}'",
                    mapping.type_name, bound, requested
                )))
            }
            (Some(requested), _) if requested.is_empty() => Err(ContainerError::InvalidRequest(
                "collection name must not be empty".to_string(),
            )),
            (Some(requested), _) => Ok(requested.to_string()),
            (None, Some(bound)) => Ok(bound),
            (None, None) => Err(ContainerError::InvalidRequest(format!(
                "no collection given and type {} is not bound to one",
                mapping.type_name
            ))),
        }
    }

    /// Convert a source document into `T`.
    pub fn convert<T: DeserializeOwned>(&self, document: &Value) -> Result<T> {
        T::deserialize(document).map_err(|e| ContainerError::Conversion {
            type_name: type_name::<T>(),
            message: e.to_string(),
        })
    }
}

impl Default for MappingContext {
    fn default() -> Self {
        Self::new()
    }
}
