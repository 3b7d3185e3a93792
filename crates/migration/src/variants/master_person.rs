use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::IdentitySeed;
use crate::error::MigrationResult;
use crate::orchestrator::{FilteredPass, Migration, MigrationPlan, MigrationRun, ResourceTransform};
use crate::resource::Resource;
use crate::rewrite::{ExtensionKind, ReferenceRewriter, RewriteStyle, extension_kind};
use crate::store::Filter;
use crate::types::{CollectionName, ParsedReference, security};

/// Points `Person.link.target` at uuid references.
///
/// Person and Patient identities are preloaded by source id. A link whose
/// source id matches more than one resource is left alone and reported as
/// unresolved. Links to the same target are collapsed.
pub struct MasterPersonReferenceFix {
    owner: String,
}

impl MasterPersonReferenceFix {
    pub fn new(owner: impl Into<String>) -> Self {
        Self { owner: owner.into() }
    }
}

impl Default for MasterPersonReferenceFix {
    fn default() -> Self {
        Self::new("bwell")
    }
}

#[async_trait]
impl Migration for MasterPersonReferenceFix {
    fn name(&self) -> &'static str {
        "master-person-reference-fix"
    }

    async fn prepare(&self, run: &MigrationRun) -> MigrationResult<MigrationPlan> {
        let sources: Vec<CollectionName> = ["Person", "Patient"]
            .into_iter()
            .map(CollectionName::main)
            .filter(|c| run.has_collection(c))
            .collect();
        run.preload(sources, Arc::new(IdentitySeed::default())).await?;

        let transform = LinkTransform {
            rewriter: ReferenceRewriter::new(Arc::clone(&run.cache), RewriteStyle::Uuid),
        };
        let pass = FilteredPass::new(
            "master-person-links",
            vec!["Person".to_string()],
            Filter::security_tag(security::OWNER_SYSTEM, self.owner.as_str()),
            Arc::new(transform),
        )
        .replacing();
        Ok(MigrationPlan {
            rewrite: Some(Arc::new(pass)),
            rename: None,
        })
    }
}

struct LinkTransform {
    rewriter: ReferenceRewriter,
}

#[async_trait]
impl ResourceTransform for LinkTransform {
    async fn transform(&self, resource: &mut Resource) -> MigrationResult<Vec<String>> {
        let Some(links) = resource.as_value_mut().get_mut("link").and_then(Value::as_array_mut) else {
            return Ok(Vec::new());
        };
        for target in links
            .iter_mut()
            .filter_map(|link| link.get_mut("target"))
            .filter_map(Value::as_object_mut)
        {
            qualified_to_uuid(target);
        }

        let result = self.rewriter.rewrite(resource).await?;
        dedupe_links(resource.as_value_mut());
        Ok(result.unresolved)
    }
}

/// A reference that names its authority already carries the right uuid.
fn qualified_to_uuid(target: &mut serde_json::Map<String, Value>) {
    let explicit = target
        .get("reference")
        .and_then(Value::as_str)
        .and_then(ParsedReference::parse)
        .is_some_and(|r| r.has_authority());
    if !explicit {
        return;
    }
    let uuid = target.get("_uuid").and_then(Value::as_str).map(str::to_string).or_else(|| {
        target
            .get("extension")
            .and_then(Value::as_array)?
            .iter()
            .find(|ext| extension_kind(ext) == Some(ExtensionKind::Uuid))?
            .get("valueString")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    if let Some(uuid) = uuid {
        target.insert("reference".to_string(), Value::String(uuid.clone()));
        target.insert("_sourceId".to_string(), Value::String(uuid));
    }
}

fn dedupe_links(person: &mut Value) {
    let Some(links) = person.get_mut("link").and_then(Value::as_array_mut) else {
        return;
    };
    let mut seen = HashSet::new();
    links.retain(|link| match link.pointer("/target/_uuid").and_then(Value::as_str) {
        Some(uuid) => seen.insert(uuid.to_string()),
        None => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, ReferenceCache};
    use crate::types::IdentityTuple;
    use serde_json::json;

    fn transform(cache: ReferenceCache) -> LinkTransform {
        LinkTransform {
            rewriter: ReferenceRewriter::new(Arc::new(cache), RewriteStyle::Uuid),
        }
    }

    #[tokio::test]
    async fn test_links_point_at_uuids_and_collapse() {
        let cache = ReferenceCache::new();
        let patient = IdentityTuple::derive("p1", "client");
        cache.insert(CacheKey::new("Patient", "p1"), patient.clone().into());
        let mut person = Resource::new(json!({
            "resourceType": "Person",
            "id": "m1",
            "link": [
                {"target": {"reference": "Patient/p1"}},
                {"target": {"reference": format!("Patient/p1|client"), "_uuid": format!("Patient/{}", patient.uuid)}}
            ]
        }));
        let unresolved = transform(cache).transform(&mut person).await.unwrap();

        assert!(unresolved.is_empty());
        let links = person.as_value()["link"].as_array().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0]["target"]["reference"], format!("Patient/{}", patient.uuid));
        assert_eq!(links[0]["target"]["_sourceId"], format!("Patient/{}", patient.uuid));
    }

    #[tokio::test]
    async fn test_ambiguous_link_is_reported() {
        let cache = ReferenceCache::new();
        cache.insert(CacheKey::new("Patient", "dup"), IdentityTuple::derive("dup", "a").into());
        cache.insert(CacheKey::new("Patient", "dup"), IdentityTuple::derive("dup", "b").into());
        let mut person = Resource::new(json!({
            "resourceType": "Person",
            "link": [{"target": {"reference": "Patient/dup"}}]
        }));
        let before = person.clone();
        let unresolved = transform(cache).transform(&mut person).await.unwrap();
        assert_eq!(unresolved, vec!["Patient/dup".to_string()]);
        assert_eq!(person, before);
    }
}
