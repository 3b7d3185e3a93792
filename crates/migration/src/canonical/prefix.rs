use serde_json::Value;

use crate::store::Filter;
use crate::types::{sanitize_id, truncate_id};

use super::NamingRule;

/// Ids built as `<prefix><original>` and cut to 64 characters.
///
/// Observations whose id hit the length limit lost their code suffix. For
/// those the original is rebuilt from the second dash-separated segment of the
/// id and the first coding code (or the code text).
#[derive(Debug, Clone)]
pub struct PrefixRule {
    authority: String,
    prefix: String,
    max_length: usize,
}

impl Default for PrefixRule {
    fn default() -> Self {
        Self {
            authority: "humanapi".to_string(),
            prefix: "HumanApi-".to_string(),
            max_length: 64,
        }
    }
}

impl PrefixRule {
    pub fn candidate(&self, original: &str) -> String {
        truncate_id(&format!("{}{original}", self.prefix), self.max_length)
    }

    fn observation_original(&self, current: &str, resource: &Value) -> Option<String> {
        let code = resource.get("code")?;
        let segments: Vec<&str> = current.split('-').collect();
        if segments.len() <= 2 {
            return None;
        }
        let suffix = code
            .pointer("/coding/0/code")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .or_else(|| code.get("text").and_then(Value::as_str).filter(|t| !t.is_empty()))?;
        Some(format!("{}-{}", segments[1], sanitize_id(suffix)))
    }
}

impl NamingRule for PrefixRule {
    fn name(&self) -> &'static str {
        "prefix"
    }

    fn eligibility(&self) -> Filter {
        Filter::eq("_sourceAssigningAuthority", self.authority.as_str())
    }

    fn projection(&self) -> Vec<String> {
        [
            "resourceType",
            "_uuid",
            "_sourceId",
            "_sourceAssigningAuthority",
            "meta.security",
            "meta.source",
            "code.coding.code",
            "code.text",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn original_id(&self, resource_type: &str, resource: &Value) -> Option<String> {
        let current = resource.get("_sourceId").and_then(Value::as_str)?;
        if resource_type == "Observation" && current.chars().count() == self.max_length {
            if let Some(original) = self.observation_original(current, resource) {
                return Some(original);
            }
        }
        let original = current.replacen(&self.prefix, "", 1);
        (self.candidate(&original) == current).then_some(original)
    }
}
