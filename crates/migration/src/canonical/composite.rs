use serde_json::Value;

use crate::store::Filter;
use crate::types::{sanitize_id, security, truncate_id};

use super::NamingRule;

/// Ids built as `<authority>-<original>` and cut to 63 characters.
///
/// The original id is the last path segment of `meta.source`. Both the
/// sanitized and the raw authority prefix are accepted since either form was
/// written at different times.
#[derive(Debug, Clone)]
pub struct CompositeKeyRule {
    connection_type: String,
    max_length: usize,
}

impl Default for CompositeKeyRule {
    fn default() -> Self {
        Self {
            connection_type: "proa".to_string(),
            max_length: 63,
        }
    }
}

impl CompositeKeyRule {
    /// Rule for resources tagged with `connection_type`.
    pub fn new(connection_type: impl Into<String>) -> Self {
        Self {
            connection_type: connection_type.into(),
            ..Self::default()
        }
    }

    /// Synthetic ids the original could have been stored under.
    pub fn candidates(&self, original: &str, authority: &str) -> [String; 2] {
        let sanitized = sanitize_id(original);
        let join = |prefix: &str| {
            if authority.is_empty() {
                truncate_id(&sanitized, self.max_length)
            } else {
                truncate_id(&format!("{prefix}-{sanitized}"), self.max_length)
            }
        };
        [join(&sanitize_id(authority)), join(authority)]
    }
}

impl NamingRule for CompositeKeyRule {
    fn name(&self) -> &'static str {
        "composite-key"
    }

    fn eligibility(&self) -> Filter {
        Filter::security_tag(security::CONNECTION_TYPE_SYSTEM, &self.connection_type)
    }

    fn projection(&self) -> Vec<String> {
        [
            "resourceType",
            "_uuid",
            "_sourceId",
            "_sourceAssigningAuthority",
            "meta.security",
            "meta.source",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn original_id(&self, _resource_type: &str, resource: &Value) -> Option<String> {
        let current = resource.get("_sourceId").and_then(Value::as_str)?;
        let original = resource
            .pointer("/meta/source")
            .and_then(Value::as_str)?
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())?;
        let authority = self.authority(resource);
        self.candidates(original, &authority)
            .iter()
            .any(|candidate| candidate == current)
            .then(|| original.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidates_cover_both_authority_forms() {
        let rule = CompositeKeyRule::default();
        let [sanitized, raw] = rule.candidates("a_b", "org:x");
        assert_eq!(sanitized, "org-x-a-b");
        assert_eq!(raw, "org:x-a-b");
    }

    #[test]
    fn test_candidates_without_authority_have_no_dash() {
        let rule = CompositeKeyRule::default();
        assert_eq!(rule.candidates("abc", "")[0], "abc");
    }

    #[test]
    fn test_candidates_are_truncated_to_63() {
        let rule = CompositeKeyRule::default();
        let original = "x".repeat(80);
        assert!(rule.candidates(&original, "client").iter().all(|c| c.len() == 63));
    }

    #[test]
    fn test_original_id_requires_matching_candidate() {
        let rule = CompositeKeyRule::default();
        let resource = |source_id: &str| {
            json!({
                "_sourceId": source_id,
                "_sourceAssigningAuthority": "client",
                "meta": {"source": "http://ehr/Patient/a.b"}
            })
        };
        assert_eq!(rule.original_id("Patient", &resource("client-a.b")).as_deref(), Some("a.b"));
        assert_eq!(rule.original_id("Patient", &resource("other-a.b")), None);
    }

    #[test]
    fn test_original_id_keeps_unsanitized_form() {
        let rule = CompositeKeyRule::default();
        let resource = json!({
            "_sourceId": "client-a-b",
            "_sourceAssigningAuthority": "client",
            "meta": {"source": "http://ehr/Patient/a_b"}
        });
        assert_eq!(rule.original_id("Patient", &resource).as_deref(), Some("a_b"));
    }
}
