//! Seams to the rest of the server.
//!
//! The migration engine does not own resource normalisation or storage layout.
//! It reaches them through these traits, each with a default that matches the
//! server's conventions.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{CacheKey, CacheSeed, IdentitySeed, ReferenceTarget};
use crate::error::{DocumentError, MigrationError, MigrationResult};
use crate::resource::{ReferenceWalkable, Resource};
use crate::store::{DocumentStore, Filter};
use crate::types::{CollectionName, ParsedReference, derive_uuid, security};

/// Normalises a resource before it is written.
pub trait PreSave: Send + Sync {
    fn pre_save(&self, resource: Value) -> Value;
}

/// Denormalises the identity fields the way the save path does.
///
/// - `_sourceAssigningAuthority` follows the authority security tag
/// - `_sourceId` defaults to `id`
/// - `_uuid` is derived when missing
/// - references with an explicit `|authority` carry it in their shadow fields
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPreSave;

impl PreSave for DefaultPreSave {
    fn pre_save(&self, resource: Value) -> Value {
        let mut resource = Resource::new(resource);
        resource.for_each_reference_mut(&mut |_, reference| {
            let Some(parsed) = reference
                .get("reference")
                .and_then(Value::as_str)
                .and_then(ParsedReference::parse)
            else {
                return;
            };
            let Some(authority) = parsed.source_assigning_authority.as_deref() else {
                return;
            };
            if reference.contains_key("_sourceAssigningAuthority") {
                reference.insert("_sourceAssigningAuthority".to_string(), Value::String(authority.to_string()));
            }
            if reference.contains_key("_uuid") {
                let uuid = derive_uuid(&parsed.id, authority);
                reference.insert(
                    "_uuid".to_string(),
                    Value::String(format!("{}/{uuid}", parsed.resource_type)),
                );
            }
        });

        let mut value = resource.into_value();
        let tag_authority =
            security::security_code(&value, security::SOURCE_ASSIGNING_AUTHORITY_SYSTEM).map(str::to_string);
        let Some(map) = value.as_object_mut() else {
            return value;
        };
        if let Some(authority) = tag_authority {
            map.insert("_sourceAssigningAuthority".to_string(), Value::String(authority));
        }
        if !map.contains_key("_sourceId") {
            if let Some(id) = map.get("id").cloned() {
                map.insert("_sourceId".to_string(), id);
            }
        }
        if !map.contains_key("_uuid") {
            let source_id = map.get("_sourceId").and_then(Value::as_str).map(str::to_string);
            let authority = map
                .get("_sourceAssigningAuthority")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(source_id) = source_id {
                map.insert("_uuid".to_string(), Value::String(derive_uuid(&source_id, &authority)));
            }
        }
        value
    }
}

/// Finds the physical collection a resource type is stored in.
pub trait ResourceLocator: Send + Sync {
    fn collection_for(&self, resource_type: &str) -> CollectionName;
}

/// One collection per type, `<Type>_4_0_0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResourceLocator;

impl ResourceLocator for DefaultResourceLocator {
    fn collection_for(&self, resource_type: &str) -> CollectionName {
        CollectionName::main(resource_type)
    }
}

/// Result of a live point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(ReferenceTarget),
    /// Several documents claim the same source id.
    Ambiguous(Vec<ReferenceTarget>),
    NotFound,
}

/// Point lookup for references the cache does not know.
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    async fn resolve(&self, key: &CacheKey) -> MigrationResult<Resolution>;
}

/// Resolves `Type/<sourceId>` against the live store by `_sourceId`.
pub struct StoreResolver {
    store: Arc<dyn DocumentStore>,
    locator: Arc<dyn ResourceLocator>,
    seed: IdentitySeed,
}

impl StoreResolver {
    pub fn new(store: Arc<dyn DocumentStore>, locator: Arc<dyn ResourceLocator>) -> Self {
        Self {
            store,
            locator,
            seed: IdentitySeed::default(),
        }
    }
}

#[async_trait]
impl ReferenceResolver for StoreResolver {
    async fn resolve(&self, key: &CacheKey) -> MigrationResult<Resolution> {
        let collection = self.locator.collection_for(&key.resource_type);
        let projection = self.seed.projection();
        let documents = self
            .store
            .find_page(
                &collection,
                &Filter::eq("_sourceId", key.source_id.as_str()),
                None,
                // two are enough to tell ambiguity apart
                2,
                Some(&projection),
            )
            .await
            .map_err(|e| DocumentError::Lookup {
                reference: key.to_string(),
                source: Box::new(MigrationError::Store(e)),
            })?;

        let targets: BTreeSet<ReferenceTarget> = documents
            .iter()
            .flat_map(|doc| self.seed.entries(&key.resource_type, doc.resource()))
            .map(|(_, target)| target)
            .collect();
        let mut targets: Vec<ReferenceTarget> = targets.into_iter().collect();
        Ok(match targets.len() {
            0 => Resolution::NotFound,
            1 => Resolution::Found(targets.remove(0)),
            _ => Resolution::Ambiguous(targets),
        })
    }
}
