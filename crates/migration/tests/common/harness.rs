//! Runs migrations against an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use helios_migration::{
    CollectionName, DocumentId, InMemoryStore, Migration, MigrationOrchestrator, MigrationResult,
    RunOptions, RunSummary,
};

use super::fixtures::ResourceFixture;

/// Small batches so every scan spans several pages; no status logger.
pub fn test_options() -> RunOptions {
    RunOptions {
        batch_size: 2,
        reference_batch_size: 2,
        collection_concurrency: 2,
        progress_interval: Duration::ZERO,
        preload_page_size: 3,
        ..RunOptions::default()
    }
}

/// A store plus the options migrations are run with.
pub struct TestContext {
    pub store: Arc<InMemoryStore>,
    pub options: RunOptions,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            options: test_options(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Stores the fixture in its main collection.
    pub fn insert(&self, fixture: &ResourceFixture) -> DocumentId {
        self.store
            .insert(CollectionName::main(&fixture.resource_type), fixture.build())
    }

    /// Stores the fixture's history entry.
    pub fn insert_history(&self, fixture: &ResourceFixture) -> DocumentId {
        self.store
            .insert(CollectionName::history(&fixture.resource_type), fixture.history_entry())
    }

    pub async fn try_run(&self, migration: &dyn Migration) -> MigrationResult<RunSummary> {
        MigrationOrchestrator::new(self.store.clone(), self.options.clone())
            .run(migration)
            .await
    }

    /// Runs a migration that is expected to finish without fatal errors.
    pub async fn run(&self, migration: &dyn Migration) -> RunSummary {
        self.try_run(migration)
            .await
            .unwrap_or_else(|e| panic!("migration {} failed: {e}", migration.name()))
    }

    /// Bodies of the main collection for a type, in `_id` order.
    pub fn resources(&self, resource_type: &str) -> Vec<Value> {
        self.store
            .documents(&CollectionName::main(resource_type))
            .into_iter()
            .map(|doc| doc.body)
            .collect()
    }

    /// History entries for a type, in `_id` order.
    pub fn history(&self, resource_type: &str) -> Vec<Value> {
        self.store
            .documents(&CollectionName::history(resource_type))
            .into_iter()
            .map(|doc| doc.body)
            .collect()
    }

    /// The resource stored under `source_id`, if any.
    pub fn find(&self, resource_type: &str, source_id: &str) -> Option<Value> {
        self.resources(resource_type)
            .into_iter()
            .find(|r| r.get("_sourceId").and_then(Value::as_str) == Some(source_id))
    }

    /// Every collection with its documents, stripped of run-dependent fields.
    pub fn snapshot(&self) -> Vec<(String, Vec<Value>)> {
        let mut names: Vec<CollectionName> = ["Observation", "Patient", "Person"]
            .into_iter()
            .flat_map(|t| [CollectionName::main(t), CollectionName::history(t)])
            .collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let docs = self
                    .store
                    .documents(&name)
                    .into_iter()
                    .map(|doc| strip_run_fields(doc.body))
                    .collect();
                (name.as_str().to_string(), docs)
            })
            .collect()
    }
}

fn strip_run_fields(mut body: Value) -> Value {
    if body.get("resource").is_some() {
        if let Some(entry) = body.as_object_mut() {
            entry.remove("id");
        }
        if let Some(meta) = body.pointer_mut("/resource/meta").and_then(Value::as_object_mut) {
            meta.remove("lastUpdated");
        }
    } else if let Some(meta) = body.pointer_mut("/meta").and_then(Value::as_object_mut) {
        meta.remove("lastUpdated");
    }
    body
}

pub fn version_id(resource: &Value) -> Option<&str> {
    resource.pointer("/meta/versionId").and_then(Value::as_str)
}
