use std::sync::Arc;

use serde_json::Value;

use crate::preload::IdMap;
use crate::store::Filter;

use super::NamingRule;

/// Over-long ids that were cut down from an original recorded elsewhere.
///
/// The originals cannot be recovered from the document itself; they come from
/// an [`IdMap`] loaded from the source data before the run.
#[derive(Debug, Clone)]
pub struct LengthRule {
    authority: String,
    min_length: usize,
    ids: Arc<IdMap>,
}

impl LengthRule {
    pub fn new(authority: impl Into<String>, ids: Arc<IdMap>) -> Self {
        Self {
            authority: authority.into(),
            min_length: 63,
            ids,
        }
    }

    pub fn ids(&self) -> &IdMap {
        &self.ids
    }
}

impl NamingRule for LengthRule {
    fn name(&self) -> &'static str {
        "length"
    }

    fn eligibility(&self) -> Filter {
        Filter::StringLongerThan {
            field: "_sourceId".to_string(),
            length: self.min_length - 1,
        }
        .and(Filter::EqIgnoreCase {
            field: "_sourceAssigningAuthority".to_string(),
            value: self.authority.clone(),
        })
    }

    fn original_id(&self, resource_type: &str, resource: &Value) -> Option<String> {
        let current = resource.get("_sourceId").and_then(Value::as_str)?;
        if current.chars().count() < self.min_length {
            return None;
        }
        let authority = resource
            .get("_sourceAssigningAuthority")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !authority.eq_ignore_ascii_case(&self.authority) {
            return None;
        }
        self.ids
            .original(resource_type, current)
            .filter(|original| *original != current)
            .map(str::to_string)
    }

    fn authority(&self, _resource: &Value) -> String {
        self.authority.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::IdCanonicalizer;
    use crate::types::IdentityTuple;
    use serde_json::json;

    fn synthetic() -> String {
        format!("thedacare-{}", "f".repeat(62))
    }

    fn rule() -> LengthRule {
        let mut ids = IdMap::default();
        ids.insert("Patient", synthetic(), "A.B-1");
        LengthRule::new("thedacare", Arc::new(ids))
    }

    #[test]
    fn test_mapped_long_id_is_recovered() {
        let resource = json!({"_sourceId": synthetic(), "_sourceAssigningAuthority": "TheDaCare"});
        assert_eq!(rule().original_id("Patient", &resource).as_deref(), Some("A.B-1"));
    }

    #[test]
    fn test_short_or_foreign_ids_are_ignored() {
        let rule = rule();
        assert_eq!(rule.original_id("Patient", &json!({"_sourceId": "A.B-1", "_sourceAssigningAuthority": "thedacare"})), None);
        assert_eq!(rule.original_id("Patient", &json!({"_sourceId": synthetic(), "_sourceAssigningAuthority": "other"})), None);
        assert_eq!(rule.original_id("Observation", &json!({"_sourceId": synthetic(), "_sourceAssigningAuthority": "thedacare"})), None);
    }

    #[test]
    fn test_shared_synthetic_id_is_not_renamed() {
        let prefix = "A".repeat(64);
        let mut ids = IdMap::default();
        ids.record_original("Patient", &format!("{prefix}-first"), 64);
        ids.record_original("Patient", &format!("{prefix}-second"), 64);
        let rule = LengthRule::new("thedacare", Arc::new(ids));
        let resource = json!({"_sourceId": prefix, "_sourceAssigningAuthority": "thedacare", "_uuid": "u"});

        assert_eq!(rule.original_id("Patient", &resource), None);
        assert!(IdCanonicalizer::new(rule).canonicalize("Patient", &resource).is_none());
    }

    #[test]
    fn test_new_uuid_uses_fixed_authority() {
        let canonicalizer = IdCanonicalizer::new(rule());
        let resource = json!({"_sourceId": synthetic(), "_sourceAssigningAuthority": "TheDaCare", "_uuid": "u"});
        let identity = canonicalizer.canonicalize("Patient", &resource).unwrap();
        assert_eq!(identity.new, IdentityTuple::derive("A.B-1", "thedacare"));
    }
}
