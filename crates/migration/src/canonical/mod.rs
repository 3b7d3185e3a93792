//! Identifier canonicalization.
//!
//! A [`NamingRule`] recognises ids that were synthesised from an original id
//! by one historical convention and recovers the original. Each data source
//! shortened or prefixed its ids differently, so every convention has its own
//! rule.
//!
//! [`IdCanonicalizer`] wraps one rule and turns a recovered id into a complete
//! [`NewIdentity`], then applies it to a resource.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{CacheKey, CacheSeed, ReferenceTarget};
use crate::store::Filter;
use crate::types::{IdentityTuple, security};

mod composite;
mod length;
mod prefix;

pub use composite::CompositeKeyRule;
pub use length::LengthRule;
pub use prefix::PrefixRule;

/// A convention for recognising synthetic ids.
pub trait NamingRule: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Documents this rule may apply to, before any history prefixing.
    fn eligibility(&self) -> Filter;

    /// Fields the rule reads, before any history prefixing.
    fn projection(&self) -> Vec<String> {
        [
            "resourceType",
            "_uuid",
            "_sourceId",
            "_sourceAssigningAuthority",
            "meta.security",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    /// Recovers the original id if the current `_sourceId` is synthetic.
    ///
    /// Returns `None` when the id is already canonical or the rule cannot tell.
    fn original_id(&self, resource_type: &str, resource: &Value) -> Option<String>;

    /// Authority the new identity is derived under.
    fn authority(&self, resource: &Value) -> String {
        security::source_assigning_authority(resource)
    }
}

/// Old and new identity of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIdentity {
    pub resource_type: String,
    pub old: IdentityTuple,
    pub new: IdentityTuple,
}

impl NewIdentity {
    pub fn is_unchanged(&self) -> bool {
        self.old == self.new
    }
}

/// Applies one naming rule to resources.
#[derive(Debug, Clone)]
pub struct IdCanonicalizer {
    rule: Arc<dyn NamingRule>,
}

impl IdCanonicalizer {
    pub fn new(rule: impl NamingRule + 'static) -> Self {
        Self {
            rule: Arc::new(rule),
        }
    }

    pub fn rule(&self) -> &dyn NamingRule {
        self.rule.as_ref()
    }

    /// True if the resource's id is synthetic under this rule.
    pub fn should_migrate(&self, resource_type: &str, resource: &Value) -> bool {
        self.canonicalize(resource_type, resource).is_some()
    }

    /// Derives the new identity, or `None` if the resource is already canonical.
    ///
    /// The new uuid follows [`IdentityTuple::derive`], so an original id that is
    /// itself a uuid is kept as-is.
    pub fn canonicalize(&self, resource_type: &str, resource: &Value) -> Option<NewIdentity> {
        let current = resource.get("_sourceId").and_then(Value::as_str)?;
        let original = self.rule.original_id(resource_type, resource)?;
        if original == current {
            return None;
        }
        let authority = self.rule.authority(resource);
        let old = IdentityTuple {
            source_id: current.to_string(),
            source_assigning_authority: authority.clone(),
            uuid: resource
                .get("_uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        let new = IdentityTuple::derive(original, authority);
        let identity = NewIdentity {
            resource_type: resource_type.to_string(),
            old,
            new,
        };
        (!identity.is_unchanged()).then_some(identity)
    }

    /// Rewrites `id`, `_sourceId`, `_uuid` and the duplicated identifiers.
    pub fn apply(&self, resource: &mut Value, identity: &NewIdentity) {
        let Some(map) = resource.as_object_mut() else {
            return;
        };
        let new = &identity.new;
        map.insert("id".to_string(), Value::String(new.source_id.clone()));
        map.insert("_sourceId".to_string(), Value::String(new.source_id.clone()));
        map.insert("_uuid".to_string(), Value::String(new.uuid.clone()));

        let Some(identifiers) = map.get_mut("identifier").and_then(Value::as_array_mut) else {
            return;
        };
        for identifier in identifiers.iter_mut().filter_map(Value::as_object_mut) {
            let id = identifier.get("id").and_then(Value::as_str);
            let system = identifier.get("system").and_then(Value::as_str);
            let value = if id == Some("sourceId") || system == Some(security::SOURCE_ID_SYSTEM) {
                &new.source_id
            } else if id == Some("uuid") || system == Some(security::UUID_SYSTEM) {
                &new.uuid
            } else {
                continue;
            };
            identifier.insert("value".to_string(), Value::String(value.clone()));
        }
    }

    /// Applies the identity to a history entry, including its `request.url`.
    pub fn apply_to_history_entry(&self, entry: &mut Value, identity: &NewIdentity) {
        if let Some(resource) = entry.get_mut("resource") {
            self.apply(resource, identity);
        }
        if let Some(url) = entry.pointer_mut("/request/url") {
            if let Some(current) = url.as_str() {
                let replaced = current.replace(&identity.old.source_id, &identity.new.source_id);
                *url = Value::String(replaced);
            }
        }
    }
}

impl CacheSeed for IdCanonicalizer {
    fn filter(&self) -> Filter {
        self.rule.eligibility()
    }

    fn projection(&self) -> Vec<String> {
        self.rule.projection()
    }

    fn entries(&self, resource_type: &str, resource: &Value) -> Vec<(CacheKey, ReferenceTarget)> {
        match self.canonicalize(resource_type, resource) {
            Some(identity) => vec![(
                CacheKey::new(resource_type, identity.old.source_id),
                identity.new.into(),
            )],
            None => Vec::new(),
        }
    }
}
