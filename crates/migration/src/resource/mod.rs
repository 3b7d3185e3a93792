//! Resources and their reference elements.
//!
//! [`ReferenceWalkable`] is the capability the rewriter relies on: enumerate
//! every `Reference` element of a resource, read-only or mutably. [`Resource`]
//! walks the whole document, so references inside `extension`,
//! `modifierExtension`, `contained` and `meta` are visited along with the
//! typed elements listed in [`paths`]. The registry decides which documents a
//! reference pass fetches, not which elements are rewritten.

use serde_json::{Map, Value};

use crate::types::security;

pub mod paths;

pub use paths::{EXTENSION_PATHS, ReferencePath, reference_paths};

/// Enumerates the forward references of a resource.
///
/// The callback receives the element path (dot notation, array indices
/// omitted) and the `Reference` object itself. Only objects carrying a string
/// `reference` are visited.
pub trait ReferenceWalkable {
    fn for_each_reference(&self, f: &mut dyn FnMut(&str, &Map<String, Value>));

    fn for_each_reference_mut(&mut self, f: &mut dyn FnMut(&str, &mut Map<String, Value>));
}

/// A FHIR resource held as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource(Value);

impl Resource {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn resource_type(&self) -> &str {
        self.0
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn source_id(&self) -> Option<&str> {
        self.0.get("_sourceId").and_then(Value::as_str)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.0.get("_uuid").and_then(Value::as_str)
    }

    /// Explicit authority, else the security-tag authority, else empty.
    pub fn source_assigning_authority(&self) -> String {
        security::source_assigning_authority(&self.0)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn as_value_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl ReferenceWalkable for Resource {
    fn for_each_reference(&self, f: &mut dyn FnMut(&str, &Map<String, Value>)) {
        visit_structural(&self.0, "", f);
    }

    fn for_each_reference_mut(&mut self, f: &mut dyn FnMut(&str, &mut Map<String, Value>)) {
        visit_structural_mut(&mut self.0, "", f);
    }
}

fn is_reference(map: &Map<String, Value>) -> bool {
    map.get("reference").is_some_and(Value::is_string)
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn visit_structural(value: &Value, path: &str, f: &mut dyn FnMut(&str, &Map<String, Value>)) {
    match value {
        Value::Array(items) => {
            for item in items {
                visit_structural(item, path, f);
            }
        }
        Value::Object(map) if is_reference(map) => f(path, map),
        Value::Object(map) => {
            for (key, child) in map {
                visit_structural(child, &child_path(path, key), f);
            }
        }
        _ => {}
    }
}

fn visit_structural_mut(
    value: &mut Value,
    path: &str,
    f: &mut dyn FnMut(&str, &mut Map<String, Value>),
) {
    match value {
        Value::Array(items) => {
            for item in items {
                visit_structural_mut(item, path, f);
            }
        }
        Value::Object(map) if is_reference(map) => f(path, map),
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                visit_structural_mut(child, &child_path(path, key), f);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registered_paths_are_walked() {
        let person = Resource::new(json!({
            "resourceType": "Person",
            "id": "p1",
            "link": [
                {"target": {"reference": "Patient/1"}},
                {"target": {"reference": "Patient/2"}}
            ],
            "managingOrganization": {"reference": "Organization/o"},
            "text": {"div": "<div/>"}
        }));
        let mut seen = Vec::new();
        person.for_each_reference(&mut |path, reference| {
            seen.push((path.to_string(), reference["reference"].as_str().unwrap().to_string()));
        });
        assert_eq!(
            seen,
            vec![
                ("link.target".to_string(), "Patient/1".to_string()),
                ("link.target".to_string(), "Patient/2".to_string()),
                ("managingOrganization".to_string(), "Organization/o".to_string()),
            ]
        );
    }

    #[test]
    fn test_extension_and_contained_references_are_walked() {
        let mut observation = Resource::new(json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/1"},
            "extension": [{"url": "http://x", "valueReference": {"reference": "Patient/1"}}],
            "modifierExtension": [{"url": "http://y", "valueReference": {"reference": "Patient/1"}}],
            "contained": [{"resourceType": "Provenance", "target": [{"reference": "Patient/1"}]}],
            "meta": {"extension": [{"url": "http://z", "valueReference": {"reference": "Patient/1"}}]}
        }));
        let mut paths = Vec::new();
        observation.for_each_reference_mut(&mut |path, reference| {
            paths.push(path.to_string());
            reference.insert("reference".to_string(), json!("Patient/2"));
        });
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "contained.target",
                "extension.valueReference",
                "meta.extension.valueReference",
                "modifierExtension.valueReference",
                "subject",
            ]
        );
        let value = observation.as_value();
        assert_eq!(value["extension"][0]["valueReference"]["reference"], "Patient/2");
        assert_eq!(value["contained"][0]["target"][0]["reference"], "Patient/2");
    }

    #[test]
    fn test_structural_walk_for_unregistered_types() {
        let mut basic = Resource::new(json!({
            "resourceType": "Basic",
            "subject": {"reference": "Patient/1"},
            "extension": [{"valueReference": {"reference": "Practitioner/2"}}]
        }));
        let mut paths = Vec::new();
        basic.for_each_reference_mut(&mut |path, reference| {
            paths.push(path.to_string());
            reference.insert("display".to_string(), json!("x"));
        });
        paths.sort();
        assert_eq!(paths, vec!["extension.valueReference", "subject"]);
        assert_eq!(basic.as_value()["subject"]["display"], "x");
    }

    #[test]
    fn test_mutable_walk_edits_in_place() {
        let mut observation = Resource::new(json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/1"},
            "performer": [{"reference": "Practitioner/1"}, {"display": "no reference"}]
        }));
        let mut count = 0;
        observation.for_each_reference_mut(&mut |_, reference| {
            count += 1;
            reference.insert("reference".to_string(), json!("Patient/2"));
        });
        assert_eq!(count, 2);
        assert_eq!(observation.as_value()["subject"]["reference"], "Patient/2");
        assert_eq!(observation.as_value()["performer"][1], json!({"display": "no reference"}));
    }

    #[test]
    fn test_identity_accessors() {
        let resource = Resource::new(json!({
            "resourceType": "Patient",
            "id": "1",
            "_sourceId": "1",
            "_uuid": "u",
            "meta": {"security": [{"system": security::SOURCE_ASSIGNING_AUTHORITY_SYSTEM, "code": "client"}]}
        }));
        assert_eq!(resource.resource_type(), "Patient");
        assert_eq!(resource.source_id(), Some("1"));
        assert_eq!(resource.uuid(), Some("u"));
        assert_eq!(resource.source_assigning_authority(), "client");
    }
}
