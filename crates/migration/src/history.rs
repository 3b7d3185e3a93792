//! Turning a changed resource into writes.
//!
//! Every resource the migration modifies gets the server's save treatment:
//! [`PreSave`] normalisation, a new `meta.versionId`, a fresh `meta.lastUpdated`
//! and a history entry, so downstream consumers see a regular update.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::collaborators::{DefaultPreSave, PreSave};
use crate::diff;
use crate::store::BulkOperation;
use crate::types::{CollectionName, StoredDocument};

/// Whether modified main documents get a history entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryMode {
    /// Bump the version and append a history entry.
    #[default]
    Append,
    /// Write the document only.
    Skip,
}

/// Builds the bulk operations for one modified document.
#[derive(Clone)]
pub struct ResourceWriter {
    pre_save: Arc<dyn PreSave>,
    history: HistoryMode,
}

impl Default for ResourceWriter {
    fn default() -> Self {
        Self::new(Arc::new(DefaultPreSave), HistoryMode::Append)
    }
}

impl ResourceWriter {
    pub fn new(pre_save: Arc<dyn PreSave>, history: HistoryMode) -> Self {
        Self { pre_save, history }
    }

    pub fn history_mode(&self) -> HistoryMode {
        self.history
    }

    /// Operations turning `document` into `updated`.
    ///
    /// For history collections `updated` is the whole entry, otherwise it is the
    /// resource. Returns nothing when the handler left the document unchanged.
    /// `replace` writes the whole document instead of a `$set` diff.
    pub fn operations(
        &self,
        collection: &CollectionName,
        document: &StoredDocument,
        updated: Value,
        replace: bool,
    ) -> Vec<BulkOperation> {
        if updated == document.body {
            return Vec::new();
        }

        if collection.is_history() {
            let mut entry = updated;
            if let Some(resource) = entry.get_mut("resource") {
                *resource = self.pre_save.pre_save(resource.take());
            }
            return self.write_op(collection, document, entry, replace).into_iter().collect();
        }

        let mut resource = self.pre_save.pre_save(updated);
        if resource == document.body {
            return Vec::new();
        }
        if self.history == HistoryMode::Skip {
            return self.write_op(collection, document, resource, replace).into_iter().collect();
        }

        stamp_version(&mut resource);
        let entry = history_entry(&resource);
        let mut operations: Vec<BulkOperation> =
            self.write_op(collection, document, resource, replace).into_iter().collect();
        operations.push(BulkOperation::InsertOne {
            collection: collection.to_history(),
            document: entry,
        });
        operations
    }

    fn write_op(
        &self,
        collection: &CollectionName,
        document: &StoredDocument,
        updated: Value,
        replace: bool,
    ) -> Option<BulkOperation> {
        if replace {
            return Some(BulkOperation::ReplaceOne {
                collection: collection.clone(),
                id: document.id.clone(),
                replacement: updated,
            });
        }
        diff::update_for(&document.body, &updated).map(|update| BulkOperation::UpdateOne {
            collection: collection.clone(),
            id: document.id.clone(),
            update,
        })
    }
}

/// Increments `meta.versionId` (missing counts as 0) and stamps `meta.lastUpdated`.
pub(crate) fn stamp_version(resource: &mut Value) {
    let Some(map) = resource.as_object_mut() else {
        return;
    };
    let meta = map.entry("meta").or_insert_with(|| json!({}));
    let Some(meta) = meta.as_object_mut() else {
        return;
    };
    let version = meta
        .get("versionId")
        .and_then(Value::as_str)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    meta.insert("versionId".to_string(), Value::String((version + 1).to_string()));
    meta.insert(
        "lastUpdated".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
}

fn history_entry(resource: &Value) -> Value {
    let resource_type = resource.get("resourceType").and_then(Value::as_str).unwrap_or_default();
    let id = resource.get("id").and_then(Value::as_str).unwrap_or_default();
    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "resource": resource,
        "request": {
            "method": "PUT",
            "url": format!("/4_0_0/{resource_type}/{id}"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity;

    impl PreSave for Identity {
        fn pre_save(&self, resource: Value) -> Value {
            resource
        }
    }

    fn document() -> StoredDocument {
        StoredDocument::new(
            "1",
            json!({"resourceType": "Patient", "id": "p1", "meta": {"versionId": "3"}}),
        )
    }

    #[test]
    fn test_unchanged_document_writes_nothing() {
        let writer = ResourceWriter::new(Arc::new(Identity), HistoryMode::Append);
        let doc = document();
        assert!(writer.operations(&CollectionName::main("Patient"), &doc, doc.body.clone(), false).is_empty());
    }

    #[test]
    fn test_changed_document_gets_version_and_history() {
        let writer = ResourceWriter::new(Arc::new(Identity), HistoryMode::Append);
        let doc = document();
        let mut updated = doc.body.clone();
        updated["id"] = json!("p2");

        let ops = writer.operations(&CollectionName::main("Patient"), &doc, updated, false);
        assert_eq!(ops.len(), 2);
        match &ops[0] {
            BulkOperation::UpdateOne { update, .. } => {
                assert_eq!(update.set["id"], "p2");
                assert_eq!(update.set["meta.versionId"], "4");
                assert!(update.set.contains_key("meta.lastUpdated"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &ops[1] {
            BulkOperation::InsertOne { collection, document } => {
                assert_eq!(collection.as_str(), "Patient_4_0_0_History");
                assert_eq!(document["request"]["url"], "/4_0_0/Patient/p2");
                assert_eq!(document["resource"]["meta"]["versionId"], "4");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_history_entries_are_not_versioned() {
        let writer = ResourceWriter::default();
        let doc = StoredDocument::new(
            "h1",
            json!({"resource": {"resourceType": "Patient", "id": "p1", "_sourceId": "p1", "_uuid": "u"}}),
        );
        let mut updated = doc.body.clone();
        updated["resource"]["id"] = json!("p2");
        updated["resource"]["_sourceId"] = json!("p2");

        let ops = writer.operations(&CollectionName::history("Patient"), &doc, updated, false);
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            BulkOperation::UpdateOne { update, .. } => {
                assert_eq!(update.set["resource.id"], "p2");
                assert!(!update.set.keys().any(|k| k.contains("versionId")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_version_starts_at_one() {
        let mut resource = json!({"resourceType": "Patient"});
        stamp_version(&mut resource);
        assert_eq!(resource["meta"]["versionId"], "1");
    }

    #[test]
    fn test_skip_mode_replaces_without_history() {
        let writer = ResourceWriter::new(Arc::new(Identity), HistoryMode::Skip);
        let doc = document();
        let mut updated = doc.body.clone();
        updated["id"] = json!("p2");
        let ops = writer.operations(&CollectionName::main("Patient"), &doc, updated.clone(), true);
        assert_eq!(
            ops,
            vec![BulkOperation::ReplaceOne {
                collection: CollectionName::main("Patient"),
                id: "1".into(),
                replacement: updated,
            }]
        );
    }
}
