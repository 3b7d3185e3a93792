//! What a phase scans.
//!
//! A [`Pass`] names the main collections of a phase, the scans to run over
//! each, and the transform applied to every matched document. History
//! collections are derived by the orchestrator.

use std::sync::Arc;

use serde_json::Value;

use crate::canonical::IdCanonicalizer;
use crate::resource::paths::{EXTENSION_PATHS, ReferencePath, reference_paths};
use crate::rewrite::ReferenceRewriter;
use crate::store::{Filter, IndexSpec};
use crate::types::CollectionName;

use super::MigrationRun;
use super::handler::{RenameTransform, ResourceTransform, RewriteTransform};

/// One scan over a main collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    pub filter: Filter,
    /// Indexes kept for the duration of the scan.
    pub indexes: Vec<IndexSpec>,
}

impl ScanPlan {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }
}

/// The collections and documents one phase visits.
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Main collections to scan.
    fn collections(&self, run: &MigrationRun) -> Vec<CollectionName>;

    /// Scans over one main collection.
    fn plans(&self, run: &MigrationRun, collection: &CollectionName) -> Vec<ScanPlan>;

    /// History scan, before restricting it to the uuids touched in the main scan.
    fn history_plan(&self, _run: &MigrationRun, _collection: &CollectionName) -> ScanPlan {
        ScanPlan::new(Filter::All)
    }

    fn transform(&self) -> Arc<dyn ResourceTransform>;

    /// Write whole documents instead of `$set` diffs.
    fn replace(&self) -> bool {
        false
    }
}

/// Rewrites references to the identities in the run's cache.
///
/// Only documents referencing a cached source id are fetched, one query per
/// reference path and chunk of cached ids. Typed paths come from the registry
/// and are skipped when they cannot target a cached type; extension paths are
/// queried on every collection. Documents with contained resources are always
/// fetched, since their references have no fixed path.
pub struct ReferencePass {
    transform: Arc<dyn ResourceTransform>,
    scope: ReferenceScope,
}

/// Which documents a [`ReferencePass`] fetches.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceScope {
    /// Documents referencing a cached key.
    CachedKeys,
    /// Every document matching the filter, in every selected collection.
    Matching(Filter),
}

impl ReferencePass {
    pub fn new(rewriter: ReferenceRewriter) -> Self {
        Self {
            transform: Arc::new(RewriteTransform::new(rewriter)),
            scope: ReferenceScope::CachedKeys,
        }
    }

    /// Uses a custom transform (which should still resolve through the run's cache).
    pub fn with_transform(mut self, transform: Arc<dyn ResourceTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_scope(mut self, scope: ReferenceScope) -> Self {
        self.scope = scope;
        self
    }

    fn path_plans(path: &ReferencePath, keys: &[Value], chunk_size: usize, filter: &Filter) -> Vec<ScanPlan> {
        let index = IndexSpec::new(format!("fixReference_{}_1", path.path), format!("{}._sourceId", path.path));
        keys.chunks(chunk_size)
            .map(|chunk| {
                let references = Filter::Or(vec![
                    Filter::is_in(format!("{}._sourceId", path.path), chunk.iter().cloned()),
                    Filter::is_in(format!("{}.reference", path.path), chunk.iter().cloned()),
                ]);
                ScanPlan::new(references.and(filter.clone())).with_index(index.clone())
            })
            .collect()
    }

    fn keys_for(run: &MigrationRun, targets: impl Fn(&str) -> bool) -> Vec<Value> {
        run.cache
            .resource_types()
            .into_iter()
            .filter(|t| targets(t))
            .flat_map(|t| {
                run.cache
                    .source_ids_for(&t)
                    .into_iter()
                    .map(move |id| Value::String(format!("{t}/{id}")))
            })
            .collect()
    }
}

impl Pass for ReferencePass {
    fn name(&self) -> &'static str {
        "rewrite-references"
    }

    fn collections(&self, run: &MigrationRun) -> Vec<CollectionName> {
        if let ReferenceScope::Matching(_) = self.scope {
            return run.main_collections();
        }
        // extensions and contained resources may reference any type
        if run.cache.is_empty() {
            return Vec::new();
        }
        run.main_collections()
    }

    fn plans(&self, run: &MigrationRun, collection: &CollectionName) -> Vec<ScanPlan> {
        let document_filter = run.options.document_filter();
        let filter = match &self.scope {
            ReferenceScope::Matching(filter) => {
                return vec![ScanPlan::new(filter.clone().and(document_filter))];
            }
            ReferenceScope::CachedKeys => document_filter,
        };
        let Some(typed) = reference_paths(collection.resource_type()) else {
            return vec![ScanPlan::new(filter)];
        };

        let chunk_size = run.options.reference_batch_size.max(1);
        let mut plans = Vec::new();
        for path in typed.iter().chain(EXTENSION_PATHS) {
            let keys = Self::keys_for(run, |t| path.may_target(t));
            if keys.is_empty() {
                continue;
            }
            plans.extend(Self::path_plans(path, &keys, chunk_size, &filter));
        }
        if !plans.is_empty() {
            plans.push(ScanPlan::new(Filter::exists("contained").and(filter)));
        }
        plans
    }

    fn transform(&self) -> Arc<dyn ResourceTransform> {
        Arc::clone(&self.transform)
    }
}

/// Renames identities recognised by a naming rule.
pub struct RenamePass {
    canonicalizer: IdCanonicalizer,
    resource_types: Vec<String>,
}

impl RenamePass {
    /// Visits the collections of `resource_types` that exist in the run.
    pub fn new(canonicalizer: IdCanonicalizer, resource_types: Vec<String>) -> Self {
        Self {
            canonicalizer,
            resource_types,
        }
    }
}

impl Pass for RenamePass {
    fn name(&self) -> &'static str {
        "rename-identities"
    }

    fn collections(&self, run: &MigrationRun) -> Vec<CollectionName> {
        run.main_collections()
            .into_iter()
            .filter(|c| self.resource_types.iter().any(|t| t == c.resource_type()))
            .collect()
    }

    fn plans(&self, run: &MigrationRun, _collection: &CollectionName) -> Vec<ScanPlan> {
        vec![ScanPlan::new(
            self.canonicalizer.rule().eligibility().and(run.options.document_filter()),
        )]
    }

    fn history_plan(&self, _run: &MigrationRun, collection: &CollectionName) -> ScanPlan {
        ScanPlan::new(self.canonicalizer.rule().eligibility().prefixed(collection.field_prefix()))
            .with_index(IndexSpec::new("fixReference_sourceId_1", "resource._sourceId"))
    }

    fn transform(&self) -> Arc<dyn ResourceTransform> {
        Arc::new(RenameTransform::new(self.canonicalizer.clone()))
    }
}

/// Applies a transform to every document matching a filter.
pub struct FilteredPass {
    name: &'static str,
    resource_types: Vec<String>,
    filter: Filter,
    transform: Arc<dyn ResourceTransform>,
    replace: bool,
}

impl FilteredPass {
    pub fn new(
        name: &'static str,
        resource_types: Vec<String>,
        filter: Filter,
        transform: Arc<dyn ResourceTransform>,
    ) -> Self {
        Self {
            name,
            resource_types,
            filter,
            transform,
            replace: false,
        }
    }

    pub fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }
}

impl Pass for FilteredPass {
    fn name(&self) -> &'static str {
        self.name
    }

    fn collections(&self, run: &MigrationRun) -> Vec<CollectionName> {
        run.main_collections()
            .into_iter()
            .filter(|c| self.resource_types.iter().any(|t| t == c.resource_type()))
            .collect()
    }

    fn plans(&self, run: &MigrationRun, _collection: &CollectionName) -> Vec<ScanPlan> {
        vec![ScanPlan::new(self.filter.clone().and(run.options.document_filter()))]
    }

    fn history_plan(&self, _run: &MigrationRun, collection: &CollectionName) -> ScanPlan {
        ScanPlan::new(self.filter.clone().prefixed(collection.field_prefix()))
    }

    fn transform(&self) -> Arc<dyn ResourceTransform> {
        Arc::clone(&self.transform)
    }

    fn replace(&self) -> bool {
        self.replace
    }
}
