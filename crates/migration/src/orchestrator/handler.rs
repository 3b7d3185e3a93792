//! Adapters between per-resource transforms and the batch engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::canonical::IdCanonicalizer;
use crate::engine::{DocumentHandler, Outcome};
use crate::error::MigrationResult;
use crate::history::ResourceWriter;
use crate::resource::Resource;
use crate::rewrite::{ReferenceRewriter, UnresolvedLog};
use crate::types::{CollectionName, StoredDocument};

/// Changes one resource in place.
#[async_trait]
pub trait ResourceTransform: Send + Sync {
    /// Applies the change. Returns the references that could not be resolved.
    async fn transform(&self, resource: &mut Resource) -> MigrationResult<Vec<String>>;

    /// Adjusts a history entry around its already transformed resource.
    ///
    /// `original` is the resource as it was stored.
    fn transform_entry(&self, _original: &Value, _entry: &mut Value) {}
}

/// Rewrites references through the run's cache.
pub struct RewriteTransform {
    rewriter: ReferenceRewriter,
}

impl RewriteTransform {
    pub fn new(rewriter: ReferenceRewriter) -> Self {
        Self { rewriter }
    }
}

#[async_trait]
impl ResourceTransform for RewriteTransform {
    async fn transform(&self, resource: &mut Resource) -> MigrationResult<Vec<String>> {
        Ok(self.rewriter.rewrite(resource).await?.unresolved)
    }
}

/// Renames the resource's own identity.
pub struct RenameTransform {
    canonicalizer: IdCanonicalizer,
}

impl RenameTransform {
    pub fn new(canonicalizer: IdCanonicalizer) -> Self {
        Self { canonicalizer }
    }
}

#[async_trait]
impl ResourceTransform for RenameTransform {
    async fn transform(&self, resource: &mut Resource) -> MigrationResult<Vec<String>> {
        let resource_type = resource.resource_type().to_string();
        if let Some(identity) = self.canonicalizer.canonicalize(&resource_type, resource.as_value()) {
            self.canonicalizer.apply(resource.as_value_mut(), &identity);
        }
        Ok(Vec::new())
    }

    fn transform_entry(&self, original: &Value, entry: &mut Value) {
        let resource_type = original.get("resourceType").and_then(Value::as_str).unwrap_or_default();
        if let Some(identity) = self.canonicalizer.canonicalize(resource_type, original) {
            self.canonicalizer.apply_to_history_entry(entry, &identity);
        }
    }
}

/// Live counters read by the status logger.
#[derive(Debug, Default)]
pub struct Progress {
    scanned: AtomicU64,
    changed: AtomicU64,
}

impl Progress {
    pub fn scanned(&self) -> u64 {
        self.scanned.load(Ordering::Relaxed)
    }

    pub fn changed(&self) -> u64 {
        self.changed.load(Ordering::Relaxed)
    }
}

/// Runs a [`ResourceTransform`] over stored documents and builds the writes.
pub struct TransformHandler {
    collection: CollectionName,
    transform: Arc<dyn ResourceTransform>,
    writer: ResourceWriter,
    unresolved: Arc<UnresolvedLog>,
    progress: Arc<Progress>,
    replace: bool,
}

impl TransformHandler {
    pub fn new(
        collection: CollectionName,
        transform: Arc<dyn ResourceTransform>,
        writer: ResourceWriter,
        unresolved: Arc<UnresolvedLog>,
        progress: Arc<Progress>,
    ) -> Self {
        Self {
            collection,
            transform,
            writer,
            unresolved,
            progress,
            replace: false,
        }
    }

    /// Writes whole documents instead of `$set` diffs.
    pub fn replacing(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    async fn try_handle(&self, document: &StoredDocument) -> MigrationResult<Outcome> {
        self.progress.scanned.fetch_add(1, Ordering::Relaxed);
        let mut resource = Resource::new(document.resource().clone());
        let unresolved = self.transform.transform(&mut resource).await?;

        // history entries repeat the main document's references
        if !unresolved.is_empty() && !self.collection.is_history() {
            self.unresolved
                .record(
                    self.collection.resource_type(),
                    document.uuid().unwrap_or_default(),
                    &unresolved,
                )
                .await?;
        }
        if resource.as_value() == document.resource() {
            return Ok(Outcome::Ok(Vec::new()));
        }

        let updated = if document.is_history_entry() {
            let mut entry = document.body.clone();
            entry["resource"] = resource.into_value();
            self.transform.transform_entry(document.resource(), &mut entry);
            entry
        } else {
            resource.into_value()
        };
        let operations = self.writer.operations(&self.collection, document, updated, self.replace);
        if !operations.is_empty() {
            self.progress.changed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Outcome::Ok(operations))
    }
}

#[async_trait]
impl DocumentHandler for TransformHandler {
    async fn handle(&self, document: &StoredDocument) -> Outcome {
        match self.try_handle(document).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Err(e),
        }
    }
}
