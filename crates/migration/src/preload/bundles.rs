//! Builds an [`IdMap`] from gzip-compressed patient bundles in object storage.
//!
//! Objects are expected at `<folder>/<patient-id>/.../*.json.gz`, each holding a
//! JSON array of bundles with one resource type per bundle.

use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{MigrationError, MigrationResult};

use super::IdMap;
use super::s3::{ListObjectItem, S3Api};

/// Where the bundles live and how many to fetch at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlePreloadConfig {
    pub bucket: String,
    pub folder: String,
    /// Objects downloaded concurrently.
    pub query_batch_size: usize,
    /// Ids longer than this were shortened and are recorded.
    pub max_id_length: usize,
}

impl BundlePreloadConfig {
    pub fn new(bucket: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            folder: folder.into(),
            query_batch_size: 3000,
            max_id_length: 64,
        }
    }
}

/// Downloads bundles and records the over-long ids they contain.
pub struct BundlePreload {
    client: Arc<dyn S3Api>,
    config: BundlePreloadConfig,
}

impl BundlePreload {
    pub fn new(client: Arc<dyn S3Api>, config: BundlePreloadConfig) -> Self {
        Self { client, config }
    }

    fn source_name(&self) -> String {
        format!("s3://{}/{}", self.config.bucket, self.config.folder)
    }

    fn preload_error(&self, message: impl ToString) -> MigrationError {
        MigrationError::Preload {
            source_name: self.source_name(),
            message: message.to_string(),
        }
    }

    /// Lists every `.json.gz` object under the folder, most recently modified first.
    async fn list_bundles(&self) -> MigrationResult<Vec<ListObjectItem>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects(&self.config.bucket, &self.config.folder, continuation.as_deref(), None)
                .await
                .map_err(|e| self.preload_error(e))?;
            objects.extend(page.items.into_iter().filter(|item| item.key.ends_with(".json.gz")));
            match page.next_continuation_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        objects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(objects)
    }

    /// Builds the id map for the given resource types.
    pub async fn load(&self, resource_types: &[String]) -> MigrationResult<IdMap> {
        info!(source = %self.source_name(), "Loading id cache from object storage");
        let mut objects = self.list_bundles().await?;
        let mut explored: HashSet<String> = HashSet::new();
        let mut ids = IdMap::default();
        let batch_size = self.config.query_batch_size.max(1);

        while !objects.is_empty() {
            let chunk: Vec<ListObjectItem> = objects.drain(..batch_size.min(objects.len())).collect();
            let mut tasks = JoinSet::new();
            for object in chunk {
                let Some(patient_id) = patient_id(&object.key) else {
                    continue;
                };
                if !explored.insert(patient_id.to_string()) {
                    continue;
                }
                let client = Arc::clone(&self.client);
                let bucket = self.config.bucket.clone();
                let resource_types = resource_types.to_vec();
                let max_id_length = self.config.max_id_length;
                tasks.spawn(async move {
                    debug!(key = %object.key, "Fetching bundle file");
                    let Some(data) = client
                        .get_object(&bucket, &object.key)
                        .await
                        .map_err(|e| format!("{}: {e}", object.key))?
                    else {
                        return Ok(IdMap::default());
                    };
                    let bundles = decode_bundles(&data.bytes).map_err(|e| format!("{}: {e}", object.key))?;
                    Ok::<_, String>(ids_from_bundles(&bundles, &resource_types, max_id_length))
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let found = joined
                    .map_err(|e| self.preload_error(e))?
                    .map_err(|e| self.preload_error(e))?;
                ids.merge(found);
            }
            info!(remaining = objects.len(), ids = ids.len(), "Processed bundle batch");
        }

        Ok(ids)
    }
}

/// The patient id segment of `fhir/<source>/patient/<patient-id>/...`.
fn patient_id(key: &str) -> Option<&str> {
    key.split('/').nth(3).filter(|segment| !segment.is_empty())
}

fn decode_bundles(bytes: &[u8]) -> Result<Vec<Value>, String> {
    let mut json = String::new();
    GzDecoder::new(bytes)
        .read_to_string(&mut json)
        .map_err(|e| format!("gunzip failed: {e}"))?;
    match serde_json::from_str(&json).map_err(|e| e.to_string())? {
        Value::Array(bundles) => Ok(bundles),
        _ => Err("expected an array of bundles".to_string()),
    }
}

fn ids_from_bundles(bundles: &[Value], resource_types: &[String], max_id_length: usize) -> IdMap {
    let mut ids = IdMap::default();
    for resource_type in resource_types {
        let bundle = bundles.iter().find(|bundle| {
            bundle.pointer("/entry/0/resource/resourceType").and_then(Value::as_str)
                == Some(resource_type.as_str())
        });
        let Some(entries) = bundle.and_then(|b| b.get("entry")).and_then(Value::as_array) else {
            continue;
        };
        for id in entries
            .iter()
            .filter_map(|entry| entry.pointer("/resource/id").and_then(Value::as_str))
            .filter(|id| id.chars().count() >= max_id_length)
        {
            ids.record_original(resource_type, id, max_id_length);
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preload::s3::{ListObjectsResult, ObjectData, S3ClientError};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockState {
        objects: HashMap<String, Vec<u8>>,
        gets: Vec<String>,
    }

    #[derive(Default)]
    struct MockS3Client {
        state: Mutex<MockState>,
    }

    impl MockS3Client {
        fn put(&self, key: &str, bundles: Value) {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(bundles.to_string().as_bytes()).unwrap();
            let bytes = encoder.finish().unwrap();
            self.state.lock().unwrap().objects.insert(key.to_string(), bytes);
        }
    }

    #[async_trait]
    impl S3Api for MockS3Client {
        async fn head_bucket(&self, bucket: &str) -> Result<(), S3ClientError> {
            if bucket == "bucket" {
                Ok(())
            } else {
                Err(S3ClientError::NotFound)
            }
        }

        async fn get_object(&self, _bucket: &str, key: &str) -> Result<Option<ObjectData>, S3ClientError> {
            let mut state = self.state.lock().unwrap();
            state.gets.push(key.to_string());
            Ok(state.objects.get(key).map(|bytes| ObjectData {
                bytes: bytes.clone(),
                last_modified: None,
            }))
        }

        async fn list_objects(
            &self,
            _bucket: &str,
            prefix: &str,
            continuation: Option<&str>,
            _max_keys: Option<i32>,
        ) -> Result<ListObjectsResult, S3ClientError> {
            let state = self.state.lock().unwrap();
            let mut keys: Vec<&String> = state.objects.keys().filter(|k| k.starts_with(prefix)).collect();
            keys.sort();
            // two pages to exercise continuation
            let (page, next) = match continuation {
                None => (keys.iter().take(1).collect::<Vec<_>>(), Some("1".to_string())),
                Some(_) => (keys.iter().skip(1).collect::<Vec<_>>(), None),
            };
            Ok(ListObjectsResult {
                items: page
                    .into_iter()
                    .map(|key| ListObjectItem {
                        key: (*key).clone(),
                        last_modified: Some(Utc.timestamp_opt(0, 0).unwrap()),
                        size: 0,
                    })
                    .collect(),
                next_continuation_token: next,
            })
        }
    }

    fn patient_bundle(ids: &[&str]) -> Value {
        json!({
            "resourceType": "Bundle",
            "entry": ids.iter().map(|id| json!({"resource": {"resourceType": "Patient", "id": id}})).collect::<Vec<_>>()
        })
    }

    #[test]
    fn test_patient_id_segment() {
        assert_eq!(patient_id("fhir/epic/patient/p1/fetcher/a.json.gz"), Some("p1"));
        assert_eq!(patient_id("fhir/epic/a.json.gz"), None);
    }

    #[test]
    fn test_ids_at_the_length_limit_are_recorded() {
        let bundles = [patient_bundle(&["ab:c", "ab:", "abcd"])];
        let ids = ids_from_bundles(&bundles, &["Patient".to_string()], 4);
        // only the sanitized form differs from the original
        assert_eq!(ids.original("Patient", "ab-c"), Some("ab:c"));
        assert_eq!(ids.len(), 1);

        let ids = ids_from_bundles(&bundles, &["Patient".to_string()], 0);
        assert!(ids.original("Patient", "").is_none());
    }

    #[tokio::test]
    async fn test_load_records_long_ids_once_per_patient() {
        let long = format!("A.B-{}", "9".repeat(70));
        let mock = Arc::new(MockS3Client::default());
        mock.put("fhir/epic/patient/p1/fetcher/1.json.gz", json!([patient_bundle(&[long.as_str(), "short"])]));
        mock.put("fhir/epic/patient/p1/fetcher/2.json.gz", json!([patient_bundle(&["other"])]));
        mock.put("fhir/epic/patient/p1/notes.txt", json!([]));

        let preload = BundlePreload::new(mock.clone(), BundlePreloadConfig::new("bucket", "fhir/epic"));
        let ids = preload.load(&["Patient".to_string()]).await.unwrap();

        assert_eq!(ids.original("Patient", &long[..64]), Some(long.as_str()));
        assert_eq!(ids.len(), 1);
        assert_eq!(mock.state.lock().unwrap().gets.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_object_is_a_preload_error() {
        let mock = Arc::new(MockS3Client::default());
        mock.state
            .lock()
            .unwrap()
            .objects
            .insert("fhir/epic/patient/p1/x/1.json.gz".to_string(), b"not gzip".to_vec());
        let preload = BundlePreload::new(mock, BundlePreloadConfig::new("bucket", "fhir/epic"));
        let err = preload.load(&["Patient".to_string()]).await.unwrap_err();
        assert!(matches!(err, MigrationError::Preload { .. }));
    }
}
