//! Stored-document fixtures.
//!
//! Resources are built the way the save path leaves them: `_sourceId`,
//! `_uuid` and `_sourceAssigningAuthority` are denormalised next to `id`, and
//! the owner and authority are security tags.

use serde_json::{Value, json};

use helios_migration::types::{derive_uuid, security};

/// A stored resource fixture.
#[derive(Debug, Clone)]
pub struct ResourceFixture {
    pub resource_type: String,
    pub source_id: String,
    pub authority: String,
    pub owner: String,
    pub version_id: Option<String>,
    pub meta_source: Option<String>,
    pub extra_security: Vec<(String, String)>,
    pub fields: Vec<(String, Value)>,
}

impl ResourceFixture {
    /// A resource owned by its own authority.
    pub fn new(resource_type: impl Into<String>, source_id: impl Into<String>, authority: impl Into<String>) -> Self {
        let authority = authority.into();
        Self {
            resource_type: resource_type.into(),
            source_id: source_id.into(),
            owner: authority.clone(),
            authority,
            version_id: Some("1".to_string()),
            meta_source: None,
            extra_security: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_security(mut self, system: impl Into<String>, code: impl Into<String>) -> Self {
        self.extra_security.push((system.into(), code.into()));
        self
    }

    /// Sets `meta.source`, the URL the resource was fetched from.
    pub fn with_meta_source(mut self, source: impl Into<String>) -> Self {
        self.meta_source = Some(source.into());
        self
    }

    pub fn without_version(mut self) -> Self {
        self.version_id = None;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn uuid(&self) -> String {
        derive_uuid(&self.source_id, &self.authority)
    }

    /// The document as stored in the main collection.
    pub fn build(&self) -> Value {
        let mut security = vec![
            json!({"system": security::OWNER_SYSTEM, "code": self.owner}),
            json!({"system": security::SOURCE_ASSIGNING_AUTHORITY_SYSTEM, "code": self.authority}),
        ];
        security.extend(
            self.extra_security
                .iter()
                .map(|(system, code)| json!({"system": system, "code": code})),
        );

        let mut meta = json!({
            "lastUpdated": "2024-01-01T00:00:00.000Z",
            "security": security,
        });
        if let Some(version_id) = &self.version_id {
            meta["versionId"] = json!(version_id);
        }
        if let Some(source) = &self.meta_source {
            meta["source"] = json!(source);
        }

        let mut resource = json!({
            "resourceType": self.resource_type,
            "id": self.source_id,
            "_sourceId": self.source_id,
            "_uuid": self.uuid(),
            "_sourceAssigningAuthority": self.authority,
            "meta": meta,
        });
        for (name, value) in &self.fields {
            resource[name.as_str()] = value.clone();
        }
        resource
    }

    /// The document as stored in the history collection.
    pub fn history_entry(&self) -> Value {
        json!({
            "id": format!("history-{}", self.source_id),
            "resource": self.build(),
            "request": {
                "method": "PUT",
                "url": format!("/4_0_0/{}/{}", self.resource_type, self.source_id),
            },
        })
    }
}

/// A plain reference object.
pub fn reference(target: impl Into<String>) -> Value {
    json!({"reference": target.into()})
}

/// An observation about `subject`.
pub fn observation(source_id: &str, authority: &str, subject: &str) -> ResourceFixture {
    ResourceFixture::new("Observation", source_id, authority)
        .with_field("status", json!("final"))
        .with_field("subject", reference(subject))
}

/// A person linking to each of `targets`.
pub fn linked_person(source_id: &str, authority: &str, targets: &[&str]) -> ResourceFixture {
    let links: Vec<Value> = targets
        .iter()
        .map(|target| json!({"target": reference(*target)}))
        .collect();
    ResourceFixture::new("Person", source_id, authority).with_field("link", Value::Array(links))
}

/// Thedacare id cut down from a longer original.
pub fn synthetic_thedacare_id() -> String {
    format!("thedacare-{}", "f".repeat(62))
}
