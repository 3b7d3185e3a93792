//! Preload sources that do not come from the database.
//!
//! Some synthetic ids cannot be reverted from the stored document alone. For
//! those, an [`IdMap`] from synthetic to original id is built from the source
//! data in object storage ([`BundlePreload`]) and cached on disk so a re-run
//! does not download it again.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MigrationError, MigrationResult};
use crate::types::{sanitize_id, truncate_id};

mod bundles;
pub mod s3;

pub use bundles::{BundlePreload, BundlePreloadConfig};
#[cfg(feature = "s3")]
pub use s3::AwsS3Client;
pub use s3::{ListObjectItem, ListObjectsResult, ObjectData, S3Api, S3ClientError};

/// Default file the id map is cached in.
pub const DEFAULT_ID_CACHE_FILE: &str = "cachedResourceIds.json";

/// Synthetic id to original id, per resource type.
///
/// Two originals can be shortened to the same synthetic id. Every original is
/// kept, and such a synthetic id has no single original: [`IdMap::original`]
/// returns `None` for it and [`IdMap::collisions`] lists it.
///
/// On disk a synthetic id maps to its original, or to an array of originals
/// when there is more than one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredIdMap", into = "StoredIdMap")]
pub struct IdMap(BTreeMap<String, BTreeMap<String, BTreeSet<String>>>);

type StoredIdMap = BTreeMap<String, BTreeMap<String, StoredOriginals>>;

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredOriginals {
    One(String),
    Many(BTreeSet<String>),
}

impl From<StoredIdMap> for IdMap {
    fn from(stored: StoredIdMap) -> Self {
        let ids = stored
            .into_iter()
            .map(|(resource_type, ids)| {
                let ids = ids
                    .into_iter()
                    .map(|(synthetic, originals)| {
                        let originals = match originals {
                            StoredOriginals::One(original) => BTreeSet::from([original]),
                            StoredOriginals::Many(originals) => originals,
                        };
                        (synthetic, originals)
                    })
                    .collect();
                (resource_type, ids)
            })
            .collect();
        IdMap(ids)
    }
}

impl From<IdMap> for StoredIdMap {
    fn from(map: IdMap) -> Self {
        map.0
            .into_iter()
            .map(|(resource_type, ids)| {
                let ids = ids
                    .into_iter()
                    .map(|(synthetic, mut originals)| {
                        let stored = match originals.len() {
                            1 => match originals.pop_first() {
                                Some(original) => StoredOriginals::One(original),
                                None => StoredOriginals::Many(originals),
                            },
                            _ => StoredOriginals::Many(originals),
                        };
                        (synthetic, stored)
                    })
                    .collect();
                (resource_type, ids)
            })
            .collect()
    }
}

impl IdMap {
    pub fn insert(
        &mut self,
        resource_type: impl Into<String>,
        synthetic: impl Into<String>,
        original: impl Into<String>,
    ) {
        self.0
            .entry(resource_type.into())
            .or_default()
            .entry(synthetic.into())
            .or_default()
            .insert(original.into());
    }

    /// Records an original id under every form it may have been shortened to.
    ///
    /// The raw truncation is tried first, then the truncation of the sanitized
    /// id. Forms equal to the original are skipped.
    pub fn record_original(&mut self, resource_type: &str, original: &str, max_length: usize) {
        let candidates = [
            truncate_id(original, max_length),
            truncate_id(&sanitize_id(original), max_length),
        ];
        for candidate in candidates {
            if candidate != original {
                self.insert(resource_type, candidate, original);
            }
        }
    }

    /// The original of `synthetic`, if exactly one original was shortened to it.
    pub fn original(&self, resource_type: &str, synthetic: &str) -> Option<&str> {
        let originals = self.originals(resource_type, synthetic)?;
        match originals.len() {
            1 => originals.first().map(String::as_str),
            _ => None,
        }
    }

    /// Every original recorded for `synthetic`.
    pub fn originals(&self, resource_type: &str, synthetic: &str) -> Option<&BTreeSet<String>> {
        self.0.get(resource_type).and_then(|ids| ids.get(synthetic))
    }

    /// Iterates `(resource type, synthetic id, original id)`, once per original.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.0.iter().flat_map(|(resource_type, ids)| {
            ids.iter().flat_map(move |(synthetic, originals)| {
                originals
                    .iter()
                    .map(move |original| (resource_type.as_str(), synthetic.as_str(), original.as_str()))
            })
        })
    }

    /// Synthetic ids shared by more than one original.
    pub fn collisions(&self) -> impl Iterator<Item = (&str, &str, &BTreeSet<String>)> {
        self.0.iter().flat_map(|(resource_type, ids)| {
            ids.iter()
                .filter(|(_, originals)| originals.len() > 1)
                .map(move |(synthetic, originals)| (resource_type.as_str(), synthetic.as_str(), originals))
        })
    }

    /// Number of synthetic ids.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds every original of `other`. The result does not depend on merge order.
    pub fn merge(&mut self, other: IdMap) {
        for (resource_type, ids) in other.0 {
            let existing = self.0.entry(resource_type).or_default();
            for (synthetic, originals) in ids {
                existing.entry(synthetic).or_default().extend(originals);
            }
        }
    }

    /// Loads a cached map, or `None` if the file does not exist.
    pub async fn load(path: &Path) -> MigrationResult<Option<IdMap>> {
        let io_error = |source| MigrationError::Io {
            path: path.display().to_string(),
            source,
        };
        if !tokio::fs::try_exists(path).await.map_err(io_error)? {
            return Ok(None);
        }
        info!(path = %path.display(), "Loading id cache from file");
        let contents = tokio::fs::read_to_string(path).await.map_err(io_error)?;
        let map = serde_json::from_str(&contents).map_err(|e| MigrationError::Preload {
            source_name: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(map))
    }

    pub async fn save(&self, path: &Path) -> MigrationResult<()> {
        let contents = serde_json::to_string(self)?;
        tokio::fs::write(path, contents)
            .await
            .map_err(|source| MigrationError::Io {
                path: path.display().to_string(),
                source,
            })?;
        info!(path = %path.display(), ids = self.len(), "Saved id cache");
        Ok(())
    }
}
