//! Raw stored documents.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The internal `_id` of a stored document.
///
/// MongoDB ObjectIds are carried as their 24-character hex form, which sorts in
/// the same order as the ObjectIds themselves. Documents with string `_id`s keep
/// the string as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates a document id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this id is a 24-character hex ObjectId.
    pub fn is_object_id(&self) -> bool {
        self.0.len() == 24 && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A document as read from a collection.
///
/// `body` holds every field except `_id`. For history collections the resource
/// sits under `body.resource`, next to `request` and the history `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Internal document id.
    pub id: DocumentId,
    /// Document fields without `_id`.
    pub body: Value,
}

impl StoredDocument {
    /// Creates a stored document.
    pub fn new(id: impl Into<DocumentId>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Returns true if this is a history entry wrapping a resource.
    pub fn is_history_entry(&self) -> bool {
        self.body.get("resource").is_some_and(Value::is_object)
    }

    /// The resource carried by this document.
    pub fn resource(&self) -> &Value {
        if self.is_history_entry() {
            &self.body["resource"]
        } else {
            &self.body
        }
    }

    /// The `_uuid` of the carried resource.
    pub fn uuid(&self) -> Option<&str> {
        self.resource().get("_uuid").and_then(Value::as_str)
    }

    /// The `_sourceId` of the carried resource.
    pub fn source_id(&self) -> Option<&str> {
        self.resource().get("_sourceId").and_then(Value::as_str)
    }

    /// The `resourceType` of the carried resource.
    pub fn resource_type(&self) -> Option<&str> {
        self.resource().get("resourceType").and_then(Value::as_str)
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
