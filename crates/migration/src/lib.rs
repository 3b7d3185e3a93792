//! Helios FHIR Server Resource Identity Migration
//!
//! This crate rewrites the identities of stored FHIR resources and the
//! references that point at them, across every collection of a MongoDB
//! database, while keeping version history intact.
//!
//! # Features
//!
//! - **Reference rewriting**: cache-driven, with ambiguity detection and an audit trail
//! - **Identity canonicalization**: pluggable naming rules for synthetic ids
//! - **Resumable scans**: `_id`-ordered batches that report where to resume
//! - **History**: every change bumps the version and appends a history entry
//! - **Idempotent**: a second run over migrated data writes nothing
//!
//! # Backend Features
//!
//! - `mongodb` - MongoDB document storage
//! - `s3` - AWS S3 object storage as a preload source
//!
//! The in-memory store is always available and backs the tests.
//!
//! # Architecture
//!
//! - [`store`] - Document store trait, typed filters and backends
//! - [`engine`] - Batch cursor engine and transient indexes
//! - [`cache`] - Reference cache and its preload strategies
//! - [`canonical`] - Naming rules and the identifier canonicalizer
//! - [`rewrite`] - Reference rewriter and unresolved reference log
//! - [`orchestrator`] - Phase state machine and per-collection scheduling
//! - [`variants`] - The migrations shipped with this crate
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use helios_migration::{InMemoryStore, MigrationOrchestrator, RunOptions};
//! use helios_migration::variants::AuthorityRename;
//!
//! # async fn example() -> helios_migration::MigrationResult<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let orchestrator = MigrationOrchestrator::new(store, RunOptions::default());
//! let summary = orchestrator.run(&AuthorityRename::new("client-1", "client")).await?;
//! println!("{} operations", summary.operations());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod canonical;
pub mod collaborators;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod history;
pub mod orchestrator;
pub mod preload;
pub mod resource;
pub mod rewrite;
pub mod store;
pub mod types;
pub mod variants;

pub use cache::{CacheKey, Lookup, ReferenceCache, ReferenceTarget};
pub use canonical::{IdCanonicalizer, NamingRule, NewIdentity};
pub use config::{Command, MigrateConfig, RunOptions};
pub use engine::{BatchReport, CursorState, DocumentHandler, Outcome, ScanRequest, scan};
pub use error::{ConfigError, DocumentError, MigrationError, MigrationResult, StoreError, StoreResult};
pub use history::{HistoryMode, ResourceWriter};
pub use orchestrator::{Migration, MigrationOrchestrator, MigrationRun, Phase, RunSummary};
pub use rewrite::{ReferenceRewriter, RewriteResult, RewriteStyle, UnresolvedLog};
pub use store::{DocumentStore, Filter, InMemoryStore};
pub use types::{CollectionName, DocumentId, IdentityTuple, ParsedReference, StoredDocument};

#[cfg(feature = "mongodb")]
pub use store::{MongoStore, MongoStoreConfig};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initializes the tracing subscriber.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("helios_migration={level},helios_migrate={level}")));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
