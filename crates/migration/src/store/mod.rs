//! Document store abstraction.
//!
//! The migration engine talks to storage only through [`DocumentStore`]. Two
//! implementations exist:
//!
//! - [`InMemoryStore`] - ordered in-process collections, always available
//! - `MongoStore` - MongoDB driver 3.x (feature `mongodb`)
//!
//! Writes are expressed as [`BulkOperation`]s and executed in batches, unordered
//! by default, so one bad document does not block the rest of a batch.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreResult;
use crate::types::{CollectionName, DocumentId, StoredDocument};

pub mod filter;
mod memory;
#[cfg(feature = "mongodb")]
mod mongo;

pub use filter::{Comparable, Filter};
pub use memory::InMemoryStore;
#[cfg(feature = "mongodb")]
pub use mongo::{MongoStore, MongoStoreConfig};

/// A `$set`/`$unset` update in dot notation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDocument {
    pub set: Map<String, Value>,
    pub unset: BTreeSet<String>,
}

impl UpdateDocument {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Applies the update to a JSON document in place.
    pub fn apply_to(&self, target: &mut Value) {
        for (path, value) in &self.set {
            set_path(target, path, value.clone());
        }
        for path in &self.unset {
            unset_path(target, path);
        }
    }
}

fn set_path(target: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    set_segments(target, &segments, value);
}

fn set_segments(target: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *target = value;
        return;
    };
    match target {
        Value::Array(items) => {
            let Ok(index) = first.parse::<usize>() else {
                return;
            };
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            set_segments(&mut items[index], rest, value);
        }
        Value::Object(map) => {
            let child = map.entry((*first).to_string()).or_insert(Value::Null);
            set_segments(child, rest, value);
        }
        other => {
            *other = Value::Object(Map::new());
            set_segments(other, segments, value);
        }
    }
}

fn unset_path(target: &mut Value, path: &str) {
    let (parent_path, key) = match path.rsplit_once('.') {
        Some((parent, key)) => (Some(parent), key),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(parent_path) => {
            let pointer = format!("/{}", parent_path.replace('.', "/"));
            target.pointer_mut(&pointer)
        }
        None => Some(target),
    };
    match parent {
        Some(Value::Object(map)) => {
            map.remove(key);
        }
        // Matches MongoDB: unsetting an array element leaves a null.
        Some(Value::Array(items)) => {
            if let Some(item) = key.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *item = Value::Null;
            }
        }
        _ => {}
    }
}

/// A single write in a bulk batch, keyed by internal document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BulkOperation {
    UpdateOne {
        collection: CollectionName,
        id: DocumentId,
        update: UpdateDocument,
    },
    ReplaceOne {
        collection: CollectionName,
        id: DocumentId,
        replacement: Value,
    },
    /// Appends a new document, used for history entries.
    InsertOne {
        collection: CollectionName,
        document: Value,
    },
}

impl BulkOperation {
    pub fn collection(&self) -> &CollectionName {
        match self {
            BulkOperation::UpdateOne { collection, .. }
            | BulkOperation::ReplaceOne { collection, .. }
            | BulkOperation::InsertOne { collection, .. } => collection,
        }
    }

    /// The id of the document this operation targets, if it targets an existing one.
    pub fn target_id(&self) -> Option<&DocumentId> {
        match self {
            BulkOperation::UpdateOne { id, .. } | BulkOperation::ReplaceOne { id, .. } => Some(id),
            BulkOperation::InsertOne { .. } => None,
        }
    }
}

/// Options for [`DocumentStore::bulk_write`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteOptions {
    /// Stop at the first failed operation instead of executing every operation.
    pub ordered: bool,
    /// Execute the batch inside a transaction.
    pub transaction: bool,
}

/// Counts reported by a bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteSummary {
    pub matched: u64,
    pub modified: u64,
    pub inserted: u64,
    pub upserted: u64,
}

impl BulkWriteSummary {
    pub fn merge(&mut self, other: BulkWriteSummary) {
        self.matched += other.matched;
        self.modified += other.modified;
        self.inserted += other.inserted;
        self.upserted += other.upserted;
    }
}

/// A single-field ascending index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub field: String,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
        }
    }
}

/// Storage backend used by the migration engine.
///
/// Every method addresses a physical collection by [`CollectionName`]. Reads
/// return [`StoredDocument`]s with the `_id` split out of the body.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns a human-readable name for this backend.
    fn backend_name(&self) -> &'static str;

    /// Lists every collection in the database.
    async fn list_collections(&self) -> StoreResult<Vec<CollectionName>>;

    /// Counts documents matching `filter`.
    async fn count(&self, collection: &CollectionName, filter: &Filter) -> StoreResult<u64>;

    /// Returns one page of documents in ascending `_id` order.
    ///
    /// # Arguments
    ///
    /// * `filter` - Query filter
    /// * `after_id` - Only documents with `_id` strictly greater than this
    /// * `limit` - Maximum number of documents in the page
    /// * `projection` - Fields to return; `None` returns whole documents
    async fn find_page(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        after_id: Option<&DocumentId>,
        limit: usize,
        projection: Option<&[String]>,
    ) -> StoreResult<Vec<StoredDocument>>;

    /// Returns the first matching document, if any.
    async fn find_one(
        &self,
        collection: &CollectionName,
        filter: &Filter,
    ) -> StoreResult<Option<StoredDocument>>;

    /// Executes a batch of writes.
    ///
    /// Unordered batches execute every operation and report failures afterwards.
    ///
    /// # Errors
    ///
    /// * `StoreError::BulkWrite` - If any operation failed
    async fn bulk_write(
        &self,
        operations: Vec<BulkOperation>,
        options: BulkWriteOptions,
    ) -> StoreResult<BulkWriteSummary>;

    /// Creates an index. Creating an index that already exists succeeds.
    async fn create_index(&self, collection: &CollectionName, index: &IndexSpec) -> StoreResult<()>;

    /// Drops an index by name.
    async fn drop_index(&self, collection: &CollectionName, name: &str) -> StoreResult<()>;

    /// Returns true if an index with this name exists.
    async fn index_exists(&self, collection: &CollectionName, name: &str) -> StoreResult<bool>;
}
