//! Strategies that turn stored documents into cache entries.

use serde_json::Value;
use tracing::debug;

use crate::store::Filter;
use crate::types::security;

use super::{CacheKey, ReferenceTarget};

/// Derives cache mappings from the documents of one collection.
pub trait CacheSeed: Send + Sync {
    /// Documents to read, before any history prefixing.
    fn filter(&self) -> Filter {
        Filter::All
    }

    /// Fields needed by [`CacheSeed::entries`], before any history prefixing.
    fn projection(&self) -> Vec<String>;

    /// Mappings contributed by one resource.
    fn entries(&self, resource_type: &str, resource: &Value) -> Vec<(CacheKey, ReferenceTarget)>;
}

/// Maps `Type/<_sourceId>` to the resource's current uuid and authority.
///
/// Resources without a `_sourceId`, a `_uuid` or an authority contribute
/// nothing, so an unqualified reference is only ever resolved to a fully
/// identified target.
#[derive(Debug, Clone, Default)]
pub struct IdentitySeed {
    filter: Option<Filter>,
}

impl IdentitySeed {
    pub fn with_filter(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
        }
    }
}

impl CacheSeed for IdentitySeed {
    fn filter(&self) -> Filter {
        self.filter.clone().unwrap_or(Filter::All)
    }

    fn projection(&self) -> Vec<String> {
        ["_uuid", "_sourceId", "_sourceAssigningAuthority", "meta.security"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn entries(&self, resource_type: &str, resource: &Value) -> Vec<(CacheKey, ReferenceTarget)> {
        let source_id = resource.get("_sourceId").and_then(Value::as_str);
        let uuid = resource.get("_uuid").and_then(Value::as_str);
        let (Some(source_id), Some(uuid)) = (source_id, uuid) else {
            debug!(resource_type, ?source_id, ?uuid, "Skipping resource without identity");
            return Vec::new();
        };
        let authority = security::source_assigning_authority(resource);
        if authority.is_empty() {
            debug!(resource_type, uuid, "Found resource without sourceAssigningAuthority");
            return Vec::new();
        }
        vec![(
            CacheKey::new(resource_type, source_id),
            ReferenceTarget {
                source_id: source_id.to_string(),
                uuid: uuid.to_string(),
                source_assigning_authority: authority,
            },
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_seed_uses_security_tag_authority() {
        let resource = json!({
            "_sourceId": "p1",
            "_uuid": "u1",
            "meta": {"security": [{"system": security::SOURCE_ASSIGNING_AUTHORITY_SYSTEM, "code": "bwell"}]}
        });
        let entries = IdentitySeed::default().entries("Person", &resource);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, CacheKey::new("Person", "p1"));
        assert_eq!(entries[0].1.source_assigning_authority, "bwell");
    }

    #[test]
    fn test_identity_seed_skips_incomplete_resources() {
        let seed = IdentitySeed::default();
        assert!(seed.entries("Person", &json!({"_uuid": "u1", "_sourceAssigningAuthority": "a"})).is_empty());
        assert!(seed.entries("Person", &json!({"_sourceId": "p1", "_uuid": "u1"})).is_empty());
    }
}
