use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::IdentitySeed;
use crate::collaborators::{DefaultResourceLocator, StoreResolver};
use crate::error::MigrationResult;
use crate::orchestrator::{
    FilteredPass, Migration, MigrationPlan, MigrationRun, ReferencePass, ReferenceScope, ResourceTransform,
};
use crate::resource::{ReferenceWalkable, Resource};
use crate::rewrite::{ReferenceRewriter, RewriteStyle};
use crate::store::Filter;
use crate::types::{CollectionName, ParsedReference, security};

/// Moves resources from one source assigning authority to another.
///
/// Security codes equal to the old authority are replaced, and so are
/// reference authorities, whether explicit (`Type/id|old`) or in the
/// `_sourceAssigningAuthority` shadow field. The save path then realigns the
/// resource's own identity fields with its security tags.
pub struct AuthorityRename {
    old: String,
    new: String,
    owner: String,
    resource_types: Vec<String>,
}

impl AuthorityRename {
    /// Renames `Person` resources owned by `old`.
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        let old = old.into();
        Self {
            owner: old.clone(),
            old,
            new: new.into(),
            resource_types: vec!["Person".to_string()],
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_resource_types(mut self, resource_types: Vec<String>) -> Self {
        self.resource_types = resource_types;
        self
    }
}

#[async_trait]
impl Migration for AuthorityRename {
    fn name(&self) -> &'static str {
        "authority-rename"
    }

    async fn prepare(&self, _run: &MigrationRun) -> MigrationResult<MigrationPlan> {
        let transform = AuthorityTransform {
            old: self.old.clone(),
            new: self.new.clone(),
        };
        let pass = FilteredPass::new(
            "authority-rename",
            self.resource_types.clone(),
            Filter::security_tag(security::OWNER_SYSTEM, self.owner.as_str()),
            Arc::new(transform),
        );
        Ok(MigrationPlan {
            rewrite: None,
            rename: Some(Arc::new(pass)),
        })
    }
}

struct AuthorityTransform {
    old: String,
    new: String,
}

#[async_trait]
impl ResourceTransform for AuthorityTransform {
    async fn transform(&self, resource: &mut Resource) -> MigrationResult<Vec<String>> {
        if let Some(tags) = resource
            .as_value_mut()
            .pointer_mut("/meta/security")
            .and_then(Value::as_array_mut)
        {
            for code in tags.iter_mut().filter_map(|tag| tag.get_mut("code")) {
                if code.as_str() == Some(self.old.as_str()) {
                    *code = Value::String(self.new.clone());
                }
            }
        }

        resource.for_each_reference_mut(&mut |_, reference| {
            let parsed = reference
                .get("reference")
                .and_then(Value::as_str)
                .and_then(ParsedReference::parse);
            if let Some(parsed) = parsed.filter(|p| p.source_assigning_authority.as_deref() == Some(self.old.as_str())) {
                let renamed = parsed.with_authority(self.new.as_str());
                reference.insert("reference".to_string(), Value::String(renamed.to_string()));
            }
            if reference.get("_sourceAssigningAuthority").and_then(Value::as_str) == Some(self.old.as_str()) {
                reference.insert("_sourceAssigningAuthority".to_string(), Value::String(self.new.clone()));
            }
        });
        Ok(Vec::new())
    }
}

/// Qualifies unqualified references with their target's authority.
///
/// Targets of the preloaded types are resolved from the cache, anything else
/// by a point lookup on the live store, cached for the rest of the run.
pub struct ReferenceAuthorityFix {
    preload: Vec<String>,
    owner: Option<String>,
}

impl ReferenceAuthorityFix {
    pub fn new(preload: Vec<String>) -> Self {
        Self { preload, owner: None }
    }

    /// Only rewrites documents with this owner tag.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

#[async_trait]
impl Migration for ReferenceAuthorityFix {
    fn name(&self) -> &'static str {
        "reference-authority-fix"
    }

    async fn prepare(&self, run: &MigrationRun) -> MigrationResult<MigrationPlan> {
        let sources: Vec<CollectionName> = self
            .preload
            .iter()
            .map(|t| CollectionName::main(t))
            .filter(|c| run.has_collection(c))
            .collect();
        run.preload(sources, Arc::new(IdentitySeed::default())).await?;

        let resolver = StoreResolver::new(Arc::clone(&run.store), Arc::new(DefaultResourceLocator));
        let rewriter = ReferenceRewriter::new(Arc::clone(&run.cache), RewriteStyle::SourceIdWithAuthority)
            .with_live_lookup(Arc::new(resolver));
        let scope = match &self.owner {
            Some(owner) => Filter::security_tag(security::OWNER_SYSTEM, owner.as_str()),
            None => Filter::All,
        };
        let pass = ReferencePass::new(rewriter).with_scope(ReferenceScope::Matching(scope));
        Ok(MigrationPlan {
            rewrite: Some(Arc::new(pass)),
            rename: None,
        })
    }
}
