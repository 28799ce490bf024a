//! Ancestor lookups for `{exports.<key>}` placeholders.
//!
//! [`ExportMap`] is built once per schema from `@export` directives. An
//! [`ExportTracker`] lives for exactly one request and records, for every object
//! produced by a field resolver, which object (and type) it was resolved under.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// `type name -> export key -> field name`, fixed for a schema's lifetime.
#[derive(Debug, Default, Clone)]
pub struct ExportMap {
    by_type: HashMap<String, HashMap<String, String>>,
}

impl ExportMap {
    pub fn mark(&mut self, type_name: &str, field_name: &str, key: &str) {
        self.by_type
            .entry(type_name.to_string())
            .or_default()
            .insert(key.to_string(), field_name.to_string());
    }

    pub fn field_for(&self, type_name: &str, key: &str) -> Option<&str> {
        self.by_type
            .get(type_name)
            .and_then(|keys| keys.get(key))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// A resolved object as seen by child resolvers.
#[derive(Debug, Clone)]
pub struct ObjectNode {
    id: u64,
    value: Arc<Value>,
}

impl ObjectNode {
    pub fn value(&self) -> &Value {
        &self.value
    }
}

#[derive(Debug)]
struct ParentLink {
    parent: Option<ObjectNode>,
    parent_type: String,
}

/// Per-request parent record. Never shared between requests.
#[derive(Debug)]
pub struct ExportTracker {
    exports: Arc<ExportMap>,
    next_id: AtomicU64,
    parents: Mutex<HashMap<u64, ParentLink>>,
}

impl ExportTracker {
    pub fn new(exports: Arc<ExportMap>) -> Self {
        ExportTracker {
            exports,
            next_id: AtomicU64::new(0),
            parents: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `value` as resolved under `parent` (`None` for root fields) while
    /// resolving a field of `parent_type`.
    pub fn record(&self, value: Value, parent: Option<&ObjectNode>, parent_type: &str) -> ObjectNode {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let node = ObjectNode {
            id,
            value: Arc::new(value),
        };

        self.parents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ParentLink {
                    parent: parent.cloned(),
                    parent_type: parent_type.to_string(),
                },
            );
        node
    }

    /// Walks from `object` (of `type_name`) towards the root until a type exporting
    /// `key` is found.
    pub fn resolve(&self, type_name: &str, object: Option<&ObjectNode>, key: &str) -> Option<Value> {
        let parents = self.parents.lock().unwrap_or_else(PoisonError::into_inner);
        let mut type_name = type_name.to_string();
        let mut current = object.cloned();

        while let Some(node) = current {
            if let Some(field) = self.exports.field_for(&type_name, key) {
                return node.value.get(field).cloned();
            }
            let link = parents.get(&node.id)?;
            type_name.clone_from(&link.parent_type);
            current = link.parent.clone();
        }
        None
    }

    pub fn exports(&self) -> &ExportMap {
        &self.exports
    }
}
