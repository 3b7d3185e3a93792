//! Cache-driven reference rewriting.
//!
//! [`ReferenceRewriter::rewrite`] runs in two passes over a resource: the
//! references are first collected and resolved (which may await live lookups),
//! then rewritten in place from the resolved set. References that already carry
//! an explicit `|authority` are never touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::cache::{CacheKey, Lookup, ReferenceCache, ReferenceTarget};
use crate::collaborators::{ReferenceResolver, Resolution};
use crate::error::{DocumentError, MigrationResult};
use crate::resource::{ReferenceWalkable, Resource};
use crate::types::{ParsedReference, security};

mod unresolved;

pub use unresolved::{UnresolvedLog, unresolved_file_name};

/// The form a resolved reference is written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RewriteStyle {
    /// `Type/<sourceId>`
    #[default]
    SourceId,
    /// `Type/<sourceId>|<authority>`
    SourceIdWithAuthority,
    /// `Type/<uuid>`
    Uuid,
}

/// Counts for one rewritten resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteResult {
    /// At least one reference element was modified.
    pub changed: bool,
    pub hits: u64,
    pub misses: u64,
    /// Old references left alone because they resolve to more than one target.
    pub unresolved: Vec<String>,
}

/// Rewrites references from a [`ReferenceCache`].
#[derive(Clone)]
pub struct ReferenceRewriter {
    cache: Arc<ReferenceCache>,
    style: RewriteStyle,
    resolver: Option<Arc<dyn ReferenceResolver>>,
}

impl ReferenceRewriter {
    pub fn new(cache: Arc<ReferenceCache>, style: RewriteStyle) -> Self {
        Self {
            cache,
            style,
            resolver: None,
        }
    }

    /// Resolves cache misses through `resolver` and caches what it finds.
    pub fn with_live_lookup(mut self, resolver: Arc<dyn ReferenceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn cache(&self) -> &ReferenceCache {
        &self.cache
    }

    /// Rewrites every resolvable reference of `resource` in place.
    ///
    /// # Errors
    ///
    /// Only live lookups can fail; the error names the resource and reference.
    pub async fn rewrite(&self, resource: &mut Resource) -> MigrationResult<RewriteResult> {
        let mut keys = Vec::new();
        resource.for_each_reference(&mut |_, reference| {
            if let Some(key) = rewrite_key(reference) {
                keys.push(key);
            }
        });
        if keys.is_empty() {
            return Ok(RewriteResult::default());
        }

        let mut result = RewriteResult::default();
        let mut resolved: BTreeMap<CacheKey, Lookup> = BTreeMap::new();
        for key in keys {
            let mut lookup = self.cache.lookup(&key);
            if matches!(lookup, Lookup::Miss) && !resolved.contains_key(&key) {
                lookup = self.resolve_live(resource, &key).await?;
            }
            match &lookup {
                Lookup::Hit(_) => result.hits += 1,
                Lookup::Miss => result.misses += 1,
                Lookup::Ambiguous(_) => {}
            }
            resolved.insert(key, lookup);
        }

        let style = self.style;
        resource.for_each_reference_mut(&mut |_, reference| {
            let Some(key) = rewrite_key(reference) else {
                return;
            };
            match resolved.get(&key) {
                Some(Lookup::Hit(target)) => {
                    let before = reference.clone();
                    apply_target(reference, &key.resource_type, target, style);
                    result.changed |= *reference != before;
                }
                Some(Lookup::Ambiguous(_)) => {
                    let old = key.to_string();
                    if !result.unresolved.contains(&old) {
                        result.unresolved.push(old);
                    }
                }
                Some(Lookup::Miss) | None => {}
            }
        });
        Ok(result)
    }

    async fn resolve_live(&self, resource: &Resource, key: &CacheKey) -> MigrationResult<Lookup> {
        let Some(resolver) = &self.resolver else {
            return Ok(Lookup::Miss);
        };
        let resolution = resolver.resolve(key).await.map_err(|e| DocumentError::Reference {
            resource: format!("{}/{}", resource.resource_type(), resource.id().unwrap_or_default()),
            reference: key.to_string(),
            message: e.to_string(),
        })?;
        match resolution {
            Resolution::Found(target) => {
                self.cache.insert(key.clone(), target);
            }
            Resolution::Ambiguous(targets) => {
                for target in targets {
                    self.cache.insert(key.clone(), target);
                }
            }
            Resolution::NotFound => {
                debug!(reference = %key, "Referenced resource not found");
                self.cache.record_not_found(&key.resource_type);
                return Ok(Lookup::Miss);
            }
        }
        Ok(self.cache.peek(key))
    }
}

/// The id a reference currently points at: its `_sourceId`, else the sourceId
/// extension, else `reference` itself.
pub(crate) fn current_reference(reference: &Map<String, Value>) -> Option<&str> {
    if let Some(source_id) = reference.get("_sourceId").and_then(Value::as_str) {
        return Some(source_id);
    }
    let from_extension = reference
        .get("extension")
        .and_then(Value::as_array)
        .and_then(|extensions| {
            extensions
                .iter()
                .find(|ext| extension_kind(ext) == Some(ExtensionKind::SourceId))
                .and_then(|ext| ext.get("valueString"))
                .and_then(Value::as_str)
        });
    from_extension.or_else(|| reference.get("reference").and_then(Value::as_str))
}

/// Cache key for a reference element, or `None` if it must be left alone.
fn rewrite_key(reference: &Map<String, Value>) -> Option<CacheKey> {
    let explicit = reference
        .get("reference")
        .and_then(Value::as_str)
        .and_then(ParsedReference::parse)?;
    if explicit.has_authority() {
        return None;
    }
    let current = ParsedReference::parse(current_reference(reference)?)?;
    Some(CacheKey::from_reference(&current))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExtensionKind {
    SourceId,
    Uuid,
    SourceAssigningAuthority,
}

pub(crate) fn extension_kind(extension: &Value) -> Option<ExtensionKind> {
    let id = extension.get("id").and_then(Value::as_str);
    let url = extension.get("url").and_then(Value::as_str);
    if id == Some("sourceId") || url == Some(security::SOURCE_ID_SYSTEM) {
        Some(ExtensionKind::SourceId)
    } else if id == Some("uuid") || url == Some(security::UUID_SYSTEM) {
        Some(ExtensionKind::Uuid)
    } else if id == Some("sourceAssigningAuthority")
        || url == Some(security::SOURCE_ASSIGNING_AUTHORITY_SYSTEM)
    {
        Some(ExtensionKind::SourceAssigningAuthority)
    } else {
        None
    }
}

/// Points a reference element at `target`, keeping its shadow fields consistent.
pub(crate) fn apply_target(
    reference: &mut Map<String, Value>,
    resource_type: &str,
    target: &ReferenceTarget,
    style: RewriteStyle,
) {
    let authority = target.source_assigning_authority.clone();
    let uuid_reference = target.uuid_reference(resource_type);
    let source_reference = match style {
        RewriteStyle::Uuid => uuid_reference.clone(),
        _ => target.source_reference(resource_type),
    };
    let new_reference = match style {
        RewriteStyle::SourceIdWithAuthority if !authority.is_empty() => {
            format!("{source_reference}|{authority}")
        }
        _ => source_reference.clone(),
    };

    let text = |s: &str| Value::String(s.to_string());
    reference.insert("reference".to_string(), text(&new_reference));
    reference.insert("_sourceId".to_string(), text(&source_reference));
    reference.insert("_uuid".to_string(), text(&uuid_reference));
    if !authority.is_empty() {
        reference.insert("_sourceAssigningAuthority".to_string(), text(&authority));
    }

    if let Some(extensions) = reference.get_mut("extension").and_then(Value::as_array_mut) {
        for extension in extensions.iter_mut() {
            let value = match extension_kind(extension) {
                Some(ExtensionKind::SourceId) => &source_reference,
                Some(ExtensionKind::Uuid) => &uuid_reference,
                Some(ExtensionKind::SourceAssigningAuthority) if !authority.is_empty() => &authority,
                _ => continue,
            };
            if let Some(map) = extension.as_object_mut() {
                map.insert("valueString".to_string(), text(value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdentityTuple;
    use async_trait::async_trait;
    use serde_json::json;

    fn cache_with(entries: &[(&str, &str, &str)]) -> Arc<ReferenceCache> {
        let cache = Arc::new(ReferenceCache::new());
        for (resource_type, old, new) in entries {
            cache.insert(CacheKey::new(*resource_type, *old), IdentityTuple::derive(*new, "client").into());
        }
        cache
    }

    fn observation(reference: Value) -> Resource {
        Resource::new(json!({"resourceType": "Observation", "id": "o1", "subject": reference}))
    }

    #[tokio::test]
    async fn test_hit_rewrites_reference_and_shadow_fields() {
        let rewriter = ReferenceRewriter::new(cache_with(&[("Patient", "client-abc", "abc")]), RewriteStyle::SourceId);
        let mut resource = observation(json!({
            "reference": "Patient/client-abc",
            "_sourceId": "Patient/client-abc",
            "extension": [
                {"id": "sourceId", "url": security::SOURCE_ID_SYSTEM, "valueString": "Patient/client-abc"},
                {"id": "uuid", "url": security::UUID_SYSTEM, "valueString": "Patient/old"}
            ]
        }));
        let result = rewriter.rewrite(&mut resource).await.unwrap();

        let uuid = IdentityTuple::derive("abc", "client").uuid;
        let subject = &resource.as_value()["subject"];
        assert!(result.changed);
        assert_eq!(result.hits, 1);
        assert_eq!(subject["reference"], "Patient/abc");
        assert_eq!(subject["_sourceId"], "Patient/abc");
        assert_eq!(subject["_uuid"], format!("Patient/{uuid}"));
        assert_eq!(subject["_sourceAssigningAuthority"], "client");
        assert_eq!(subject["extension"][0]["valueString"], "Patient/abc");
        assert_eq!(subject["extension"][1]["valueString"], format!("Patient/{uuid}"));
    }

    #[tokio::test]
    async fn test_explicit_authority_is_left_alone() {
        let rewriter = ReferenceRewriter::new(cache_with(&[("Patient", "client-abc", "abc")]), RewriteStyle::SourceId);
        let mut resource = observation(json!({"reference": "Patient/client-abc|other"}));
        let before = resource.clone();
        let result = rewriter.rewrite(&mut resource).await.unwrap();
        assert!(!result.changed);
        assert_eq!(resource, before);
    }

    #[tokio::test]
    async fn test_ambiguous_reference_is_recorded_not_rewritten() {
        let cache = cache_with(&[("Patient", "dup", "a"), ("Patient", "dup", "b")]);
        let rewriter = ReferenceRewriter::new(cache, RewriteStyle::SourceId);
        let mut resource = observation(json!({"reference": "Patient/dup"}));
        let before = resource.clone();
        let result = rewriter.rewrite(&mut resource).await.unwrap();
        assert_eq!(resource, before);
        assert_eq!(result.unresolved, vec!["Patient/dup".to_string()]);
        assert!(!result.changed);
    }

    #[tokio::test]
    async fn test_miss_is_left_alone_and_counted() {
        let rewriter = ReferenceRewriter::new(cache_with(&[]), RewriteStyle::SourceId);
        let mut resource = observation(json!({"reference": "Patient/unknown"}));
        let result = rewriter.rewrite(&mut resource).await.unwrap();
        assert_eq!(result.misses, 1);
        assert!(!result.changed);
        assert_eq!(rewriter.cache().stats()["Patient_4_0_0"].misses, 1);
    }

    #[tokio::test]
    async fn test_rewrite_is_idempotent() {
        let rewriter = ReferenceRewriter::new(cache_with(&[("Patient", "client-abc", "abc")]), RewriteStyle::SourceId);
        let mut resource = observation(json!({"reference": "Patient/client-abc"}));
        rewriter.rewrite(&mut resource).await.unwrap();
        let once = resource.clone();
        let result = rewriter.rewrite(&mut resource).await.unwrap();
        assert!(!result.changed);
        assert_eq!(resource, once);
    }

    #[tokio::test]
    async fn test_authority_style_appends_suffix() {
        let rewriter = ReferenceRewriter::new(
            cache_with(&[("Patient", "abc", "abc")]),
            RewriteStyle::SourceIdWithAuthority,
        );
        let mut resource = observation(json!({"reference": "Patient/abc"}));
        rewriter.rewrite(&mut resource).await.unwrap();
        assert_eq!(resource.as_value()["subject"]["reference"], "Patient/abc|client");
    }

    struct FixedResolver(Resolution);

    #[async_trait]
    impl ReferenceResolver for FixedResolver {
        async fn resolve(&self, _key: &CacheKey) -> MigrationResult<Resolution> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_live_lookup_fills_cache() {
        let target: ReferenceTarget = IdentityTuple::derive("abc", "client").into();
        let rewriter = ReferenceRewriter::new(cache_with(&[]), RewriteStyle::SourceIdWithAuthority)
            .with_live_lookup(Arc::new(FixedResolver(Resolution::Found(target.clone()))));
        let mut resource = observation(json!({"reference": "Patient/abc"}));
        let result = rewriter.rewrite(&mut resource).await.unwrap();
        assert!(result.changed);
        assert_eq!(rewriter.cache().peek(&CacheKey::new("Patient", "abc")), Lookup::Hit(target));
    }

    #[tokio::test]
    async fn test_live_lookup_not_found_counts() {
        let rewriter = ReferenceRewriter::new(cache_with(&[]), RewriteStyle::SourceIdWithAuthority)
            .with_live_lookup(Arc::new(FixedResolver(Resolution::NotFound)));
        let mut resource = observation(json!({"reference": "Patient/abc"}));
        let result = rewriter.rewrite(&mut resource).await.unwrap();
        assert!(!result.changed);
        assert_eq!(rewriter.cache().stats()["Patient_4_0_0"].not_found, 1);
    }
}
