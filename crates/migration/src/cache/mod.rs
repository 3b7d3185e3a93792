//! Run-scoped reference cache.
//!
//! Maps an old `(resource type, source id)` key to the identity the referenced
//! resource has (or will have) after migration. Entries are additive: a second
//! distinct target under the same key degrades the entry to
//! [`CacheEntry::Ambiguous`], which the rewriter never resolves.
//!
//! The cache also records, per resource type, the uuids of main-collection
//! documents written during the current phase so history scans can be limited
//! to them.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{MigrationError, MigrationResult};
use crate::store::DocumentStore;
use crate::types::{CollectionName, DocumentId, IdentityTuple, ParsedReference};

mod seed;

pub use seed::{CacheSeed, IdentitySeed};

/// Typed cache key: the referenced type and the id a reference currently uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub resource_type: String,
    pub source_id: String,
}

impl CacheKey {
    pub fn new(resource_type: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            source_id: source_id.into(),
        }
    }

    /// Key for a parsed reference, ignoring any authority suffix.
    pub fn from_reference(reference: &ParsedReference) -> Self {
        Self::new(&reference.resource_type, &reference.id)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.source_id)
    }
}

/// The identity a cached reference resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceTarget {
    pub source_id: String,
    pub uuid: String,
    pub source_assigning_authority: String,
}

impl ReferenceTarget {
    pub fn source_reference(&self, resource_type: &str) -> String {
        format!("{resource_type}/{}", self.source_id)
    }

    pub fn uuid_reference(&self, resource_type: &str) -> String {
        format!("{resource_type}/{}", self.uuid)
    }
}

impl From<IdentityTuple> for ReferenceTarget {
    fn from(identity: IdentityTuple) -> Self {
        Self {
            source_id: identity.source_id,
            uuid: identity.uuid,
            source_assigning_authority: identity.source_assigning_authority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    Resolved(ReferenceTarget),
    /// More than one distinct target; never rewritten automatically.
    Ambiguous(BTreeSet<ReferenceTarget>),
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(ReferenceTarget),
    Ambiguous(Vec<ReferenceTarget>),
    Miss,
}

/// Lookup counters of one target collection. Diagnostic only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub ambiguous: u64,
    /// Live lookups that found no document.
    pub not_found: u64,
}

/// The reference cache for one migration run.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    stats: RwLock<BTreeMap<String, CacheStats>>,
    touched: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping. Returns false if the key became (or already was) ambiguous.
    pub fn insert(&self, key: CacheKey, target: ReferenceTarget) -> bool {
        match self.entries.write().entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry::Resolved(target));
                true
            }
            Entry::Occupied(mut slot) => {
                let degraded = match slot.get_mut() {
                    CacheEntry::Resolved(existing) if *existing == target => return true,
                    CacheEntry::Resolved(existing) => {
                        CacheEntry::Ambiguous(BTreeSet::from([existing.clone(), target]))
                    }
                    CacheEntry::Ambiguous(targets) => {
                        targets.insert(target);
                        return false;
                    }
                };
                debug!(key = %slot.key(), "Cache key maps to more than one target");
                slot.insert(degraded);
                false
            }
        }
    }

    /// Looks a key up and counts the outcome against the referenced collection.
    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        let lookup = self.peek(key);
        let mut stats = self.stats.write();
        let counters = stats.entry(stats_key(&key.resource_type)).or_default();
        match &lookup {
            Lookup::Hit(_) => counters.hits += 1,
            Lookup::Ambiguous(_) => counters.ambiguous += 1,
            Lookup::Miss => counters.misses += 1,
        }
        lookup
    }

    /// Tries candidate source ids in order and returns the first non-miss.
    pub fn lookup_first(&self, resource_type: &str, candidates: &[String]) -> Lookup {
        for candidate in candidates {
            let key = CacheKey::new(resource_type, candidate.as_str());
            if !matches!(self.peek(&key), Lookup::Miss) {
                return self.lookup(&key);
            }
        }
        match candidates.first() {
            Some(first) => self.lookup(&CacheKey::new(resource_type, first.as_str())),
            None => Lookup::Miss,
        }
    }

    /// Looks a key up without touching the counters.
    pub fn peek(&self, key: &CacheKey) -> Lookup {
        match self.entries.read().get(key) {
            Some(CacheEntry::Resolved(target)) => Lookup::Hit(target.clone()),
            Some(CacheEntry::Ambiguous(targets)) => Lookup::Ambiguous(targets.iter().cloned().collect()),
            None => Lookup::Miss,
        }
    }

    pub fn record_not_found(&self, resource_type: &str) {
        self.stats
            .write()
            .entry(stats_key(resource_type))
            .or_default()
            .not_found += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of entries cached for one resource type.
    pub fn len_for(&self, resource_type: &str) -> usize {
        self.entries
            .read()
            .keys()
            .filter(|k| k.resource_type == resource_type)
            .count()
    }

    /// Resource types with at least one entry.
    pub fn resource_types(&self) -> BTreeSet<String> {
        self.entries
            .read()
            .keys()
            .map(|k| k.resource_type.clone())
            .collect()
    }

    /// Old source ids cached for one resource type, sorted.
    pub fn source_ids_for(&self, resource_type: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter(|k| k.resource_type == resource_type)
            .map(|k| k.source_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Keys that resolve to more than one target.
    pub fn ambiguous_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| matches!(entry, CacheEntry::Ambiguous(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Counters keyed by the main collection of the referenced type, e.g.
    /// `Patient_4_0_0` for references to patients.
    pub fn stats(&self) -> BTreeMap<String, CacheStats> {
        self.stats.read().clone()
    }

    pub fn record_touched(&self, resource_type: &str, uuids: impl IntoIterator<Item = String>) {
        self.touched
            .write()
            .entry(resource_type.to_string())
            .or_default()
            .extend(uuids);
    }

    /// Uuids written in the main collection of `resource_type` during this phase.
    pub fn touched(&self, resource_type: &str) -> Option<Vec<String>> {
        self.touched
            .read()
            .get(resource_type)
            .map(|uuids| uuids.iter().cloned().collect())
    }

    pub fn clear_touched(&self) {
        self.touched.write().clear();
    }

    /// Seeds the cache from one collection.
    ///
    /// Pages through the documents selected by the seed's filter (prefixed for
    /// history collections) and inserts every mapping the seed derives. Returns
    /// the number of mappings inserted.
    pub async fn preload(
        &self,
        store: &dyn DocumentStore,
        collection: &CollectionName,
        seed: &dyn CacheSeed,
        page_size: usize,
    ) -> MigrationResult<usize> {
        let prefix = collection.field_prefix();
        let filter = seed.filter().prefixed(prefix);
        let projection: Vec<String> = seed
            .projection()
            .into_iter()
            .map(|field| format!("{prefix}{field}"))
            .collect();
        let resource_type = collection.resource_type();
        let mut after: Option<DocumentId> = None;
        let mut inserted = 0;

        loop {
            let page = store
                .find_page(collection, &filter, after.as_ref(), page_size.max(1), Some(&projection))
                .await
                .map_err(|e| MigrationError::Preload {
                    source_name: collection.to_string(),
                    message: e.to_string(),
                })?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            for document in &page {
                let resource: &Value = document.resource();
                for (key, target) in seed.entries(resource_type, resource) {
                    self.insert(key, target);
                    inserted += 1;
                }
            }
            if page.len() < page_size.max(1) {
                break;
            }
        }

        info!(
            collection = %collection,
            mappings = inserted,
            cached = self.len_for(resource_type),
            "Done caching collection references"
        );
        Ok(inserted)
    }
}

fn stats_key(resource_type: &str) -> String {
    CollectionName::main(resource_type).as_str().to_string()
}
