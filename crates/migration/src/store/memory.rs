//! In-process document store.
//!
//! Collections are ordered maps keyed by [`DocumentId`], so page scans return
//! documents in the same ascending `_id` order MongoDB would. Generated ids are
//! 24-character hex strings that sort in insertion order, like ObjectIds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::{BulkOperation, BulkWriteOptions, BulkWriteSummary, DocumentStore, Filter, IndexSpec};
use crate::error::{StoreError, StoreResult};
use crate::types::{CollectionName, DocumentId, StoredDocument};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    collections: BTreeMap<CollectionName, BTreeMap<DocumentId, Value>>,
    indexes: BTreeMap<CollectionName, BTreeSet<String>>,
    next_id: u64,
    bulk_writes: u64,
    fail_bulk_writes_after: Option<u64>,
    fail_index_creation: bool,
}

impl MemoryState {
    fn generate_id(&mut self) -> DocumentId {
        self.next_id += 1;
        DocumentId::new(format!("{:024x}", self.next_id))
    }

    fn apply(&mut self, operation: BulkOperation, summary: &mut BulkWriteSummary) -> Result<(), String> {
        match operation {
            BulkOperation::UpdateOne {
                collection,
                id,
                update,
            } => {
                if let Some(doc) = self.collections.get_mut(&collection).and_then(|c| c.get_mut(&id)) {
                    summary.matched += 1;
                    let before = doc.clone();
                    update.apply_to(doc);
                    if *doc != before {
                        summary.modified += 1;
                    }
                }
                Ok(())
            }
            BulkOperation::ReplaceOne {
                collection,
                id,
                replacement,
            } => {
                if let Some(doc) = self.collections.get_mut(&collection).and_then(|c| c.get_mut(&id)) {
                    summary.matched += 1;
                    let replacement = strip_id(replacement);
                    if *doc != replacement {
                        *doc = replacement;
                        summary.modified += 1;
                    }
                }
                Ok(())
            }
            BulkOperation::InsertOne {
                collection,
                document,
            } => {
                let id = match document.get("_id").and_then(Value::as_str) {
                    Some(id) => DocumentId::new(id),
                    None => self.generate_id(),
                };
                let docs = self.collections.entry(collection.clone()).or_default();
                if docs.contains_key(&id) {
                    return Err(format!("duplicate key {id} in {collection}"));
                }
                docs.insert(id, strip_id(document));
                summary.inserted += 1;
                Ok(())
            }
        }
    }
}

fn strip_id(mut document: Value) -> Value {
    if let Value::Object(map) = &mut document {
        map.remove("_id");
    }
    document
}

fn project(body: &Value, fields: &[String]) -> Value {
    let mut out = Value::Object(Map::new());
    for field in fields {
        let pointer = format!("/{}", field.replace('.', "/"));
        if let Some(value) = body.pointer(&pointer) {
            let mut update = super::UpdateDocument::default();
            update.set.insert(field.clone(), value.clone());
            update.apply_to(&mut out);
        }
    }
    out
}

/// A [`DocumentStore`] held entirely in memory.
///
/// Cloning shares the underlying collections.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a document and returns its generated id.
    pub fn insert(&self, collection: impl Into<CollectionName>, document: Value) -> DocumentId {
        let mut state = self.state.write();
        let id = state.generate_id();
        state
            .collections
            .entry(collection.into())
            .or_default()
            .insert(id.clone(), strip_id(document));
        id
    }

    /// Creates an empty collection.
    pub fn create_collection(&self, collection: impl Into<CollectionName>) {
        self.state.write().collections.entry(collection.into()).or_default();
    }

    /// Returns a document by id.
    pub fn get(&self, collection: &CollectionName, id: &DocumentId) -> Option<Value> {
        self.state
            .read()
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    /// Returns every document in a collection, in `_id` order.
    pub fn documents(&self, collection: &CollectionName) -> Vec<StoredDocument> {
        self.state
            .read()
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, body)| StoredDocument::new(id.clone(), body.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of bulk writes executed so far.
    pub fn bulk_write_count(&self) -> u64 {
        self.state.read().bulk_writes
    }

    /// Makes every bulk write after the first `n` fail.
    pub fn fail_bulk_writes_after(&self, n: Option<u64>) {
        self.state.write().fail_bulk_writes_after = n;
    }

    /// Makes index creation fail.
    pub fn fail_index_creation(&self, fail: bool) {
        self.state.write().fail_index_creation = fail;
    }

    /// Names of the indexes currently defined on a collection.
    pub fn index_names(&self, collection: &CollectionName) -> Vec<String> {
        self.state
            .read()
            .indexes
            .get(collection)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn list_collections(&self) -> StoreResult<Vec<CollectionName>> {
        Ok(self.state.read().collections.keys().cloned().collect())
    }

    async fn count(&self, collection: &CollectionName, filter: &Filter) -> StoreResult<u64> {
        let state = self.state.read();
        Ok(state
            .collections
            .get(collection)
            .map(|docs| docs.iter().filter(|(id, body)| filter.matches(id, body)).count() as u64)
            .unwrap_or(0))
    }

    async fn find_page(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        after_id: Option<&DocumentId>,
        limit: usize,
        projection: Option<&[String]>,
    ) -> StoreResult<Vec<StoredDocument>> {
        let state = self.state.read();
        let Some(docs) = state.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let page = docs
            .iter()
            .filter(|(id, _)| after_id.is_none_or(|after| *id > after))
            .filter(|(id, body)| filter.matches(id, body))
            .take(limit)
            .map(|(id, body)| {
                let body = match projection {
                    Some(fields) => project(body, fields),
                    None => body.clone(),
                };
                StoredDocument::new(id.clone(), body)
            })
            .collect();
        Ok(page)
    }

    async fn find_one(
        &self,
        collection: &CollectionName,
        filter: &Filter,
    ) -> StoreResult<Option<StoredDocument>> {
        Ok(self
            .find_page(collection, filter, None, 1, None)
            .await?
            .into_iter()
            .next())
    }

    async fn bulk_write(
        &self,
        operations: Vec<BulkOperation>,
        options: BulkWriteOptions,
    ) -> StoreResult<BulkWriteSummary> {
        let mut state = self.state.write();
        let collection = operations
            .first()
            .map(|op| op.collection().to_string())
            .unwrap_or_default();

        state.bulk_writes += 1;
        if let Some(limit) = state.fail_bulk_writes_after
            && state.bulk_writes > limit
        {
            return Err(StoreError::BulkWrite {
                collection,
                message: "injected bulk write failure".to_string(),
            });
        }

        let snapshot = options.transaction.then(|| state.clone());
        let mut summary = BulkWriteSummary::default();
        let mut failures = Vec::new();
        for operation in operations {
            if let Err(message) = state.apply(operation, &mut summary) {
                failures.push(message);
                if options.ordered || options.transaction {
                    break;
                }
            }
        }

        if failures.is_empty() {
            return Ok(summary);
        }
        if let Some(snapshot) = snapshot {
            let bulk_writes = state.bulk_writes;
            *state = snapshot;
            state.bulk_writes = bulk_writes;
        }
        Err(StoreError::BulkWrite {
            collection,
            message: failures.join("; "),
        })
    }

    async fn create_index(&self, collection: &CollectionName, index: &IndexSpec) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.fail_index_creation {
            return Err(StoreError::Internal {
                backend_name: "memory".to_string(),
                message: format!("injected failure creating index {}", index.name),
                source: None,
            });
        }
        state
            .indexes
            .entry(collection.clone())
            .or_default()
            .insert(index.name.clone());
        Ok(())
    }

    async fn drop_index(&self, collection: &CollectionName, name: &str) -> StoreResult<()> {
        let mut state = self.state.write();
        let removed = state
            .indexes
            .get_mut(collection)
            .is_some_and(|names| names.remove(name));
        if removed {
            Ok(())
        } else {
            Err(StoreError::Query {
                collection: collection.to_string(),
                message: format!("index not found with name [{name}]"),
            })
        }
    }

    async fn index_exists(&self, collection: &CollectionName, name: &str) -> StoreResult<bool> {
        Ok(self
            .state
            .read()
            .indexes
            .get(collection)
            .is_some_and(|names| names.contains(name)))
    }
}
