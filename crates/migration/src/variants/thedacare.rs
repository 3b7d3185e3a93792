use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cache::{CacheKey, ReferenceTarget};
use crate::canonical::{IdCanonicalizer, LengthRule};
use crate::error::{MigrationError, MigrationResult};
use crate::orchestrator::{Migration, MigrationPlan, MigrationRun};
use crate::preload::{BundlePreload, IdMap};
use crate::types::IdentityTuple;

use super::identity_fix_plan;

const AUTHORITY: &str = "thedacare";

/// Restores over-long Thedacare ids from the source bundles.
///
/// The id map is read from `id_cache_file` if it exists. Otherwise it is built
/// from the bundles in object storage and written there for the next run.
/// Synthetic ids shared by several originals are neither renamed nor used to
/// rewrite references; they enter the cache as ambiguous keys.
pub struct ThedacareIdFix {
    id_cache_file: PathBuf,
    bundles: Option<BundlePreload>,
}

impl ThedacareIdFix {
    pub fn new(id_cache_file: impl Into<PathBuf>, bundles: Option<BundlePreload>) -> Self {
        Self {
            id_cache_file: id_cache_file.into(),
            bundles,
        }
    }

    async fn id_map(&self, resource_types: &[String]) -> MigrationResult<IdMap> {
        if let Some(ids) = IdMap::load(&self.id_cache_file).await? {
            return Ok(ids);
        }
        let Some(bundles) = &self.bundles else {
            return Err(MigrationError::Setup {
                message: format!(
                    "no id cache at {} and no S3 bucket configured",
                    self.id_cache_file.display()
                ),
            });
        };
        let ids = bundles.load(resource_types).await?;
        ids.save(&self.id_cache_file).await?;
        Ok(ids)
    }
}

#[async_trait]
impl Migration for ThedacareIdFix {
    fn name(&self) -> &'static str {
        "thedacare-id-fix"
    }

    async fn prepare(&self, run: &MigrationRun) -> MigrationResult<MigrationPlan> {
        let collections = run.main_collections();
        let resource_types: Vec<String> = collections.iter().map(|c| c.resource_type().to_string()).collect();
        let ids = self.id_map(&resource_types).await?;
        info!(ids = ids.len(), "Loaded Thedacare id map");
        seed_collisions(run, &ids);

        let mapped: Vec<_> = collections
            .into_iter()
            .filter(|c| ids.iter().any(|(resource_type, _, _)| resource_type == c.resource_type()))
            .collect();
        let canonicalizer = IdCanonicalizer::new(LengthRule::new(AUTHORITY, Arc::new(ids)));
        identity_fix_plan(run, &canonicalizer, mapped).await
    }
}

/// Enters every original of a shared synthetic id, which leaves the key ambiguous.
fn seed_collisions(run: &MigrationRun, ids: &IdMap) {
    for (resource_type, synthetic, originals) in ids.collisions() {
        warn!(
            resource_type,
            synthetic,
            originals = ?originals,
            "Synthetic id was shortened from more than one original"
        );
        for original in originals {
            run.cache.insert(
                CacheKey::new(resource_type, synthetic),
                ReferenceTarget::from(IdentityTuple::derive(original.as_str(), AUTHORITY)),
            );
        }
    }
}
