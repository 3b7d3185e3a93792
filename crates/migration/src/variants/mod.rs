//! The migrations this crate ships.
//!
//! | Migration | Rewrites | Renames |
//! |-----------|----------|---------|
//! | [`IdentityFix::connection`] | references to renamed resources | `<authority>-<id>` ids |
//! | [`IdentityFix::human_api`] | references to renamed resources | `HumanApi-<id>` ids |
//! | [`ThedacareIdFix`] | references to renamed resources | over-long ids |
//! | [`MasterPersonReferenceFix`] | Person links to uuid references | |
//! | [`AuthorityRename`] | | security tags and reference authorities |
//! | [`ReferenceAuthorityFix`] | unqualified references | |

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::canonical::{CompositeKeyRule, IdCanonicalizer, PrefixRule};
use crate::error::MigrationResult;
use crate::orchestrator::{Migration, MigrationPlan, MigrationRun, ReferencePass, RenamePass};
use crate::rewrite::{ReferenceRewriter, RewriteStyle};
use crate::types::CollectionName;

mod authority;
mod master_person;
mod thedacare;

pub use authority::{AuthorityRename, ReferenceAuthorityFix};
pub use master_person::MasterPersonReferenceFix;
pub use thedacare::ThedacareIdFix;

/// Restores original ids recognised by one naming rule.
///
/// The cache maps every synthetic id to its original identity. Phase 1 points
/// references at the originals, phase 2 renames the resources themselves.
pub struct IdentityFix {
    name: &'static str,
    canonicalizer: IdCanonicalizer,
}

impl IdentityFix {
    /// Resources tagged with a connection type, ids built from `meta.source`.
    pub fn connection(connection_type: impl Into<String>) -> Self {
        Self {
            name: "connection-id-fix",
            canonicalizer: IdCanonicalizer::new(CompositeKeyRule::new(connection_type)),
        }
    }

    /// HumanAPI resources, ids prefixed with `HumanApi-`.
    pub fn human_api() -> Self {
        Self {
            name: "human-api-id-fix",
            canonicalizer: IdCanonicalizer::new(PrefixRule::default()),
        }
    }
}

#[async_trait]
impl Migration for IdentityFix {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn prepare(&self, run: &MigrationRun) -> MigrationResult<MigrationPlan> {
        identity_fix_plan(run, &self.canonicalizer, run.main_collections()).await
    }
}

/// Preloads `collections` with the canonicalizer and plans both phases.
///
/// Only types where the preload found synthetic ids are renamed.
pub(crate) async fn identity_fix_plan(
    run: &MigrationRun,
    canonicalizer: &IdCanonicalizer,
    collections: Vec<CollectionName>,
) -> MigrationResult<MigrationPlan> {
    run.preload(collections, Arc::new(canonicalizer.clone())).await?;
    let owners: Vec<String> = run.cache.resource_types().into_iter().collect();
    info!(rule = canonicalizer.rule().name(), owners = ?owners, "Planned identity fix");

    let rewriter = ReferenceRewriter::new(Arc::clone(&run.cache), RewriteStyle::SourceId);
    Ok(MigrationPlan {
        rewrite: Some(Arc::new(ReferencePass::new(rewriter))),
        rename: Some(Arc::new(RenamePass::new(canonicalizer.clone(), owners))),
    })
}
