//! Command line and environment configuration.
//!
//! Every option can be given as a flag or through a `MIGRATE_*` environment
//! variable. The variant to run is a subcommand.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MIGRATE_MONGO_URL` | mongodb://localhost:27017 | MongoDB connection string |
//! | `MIGRATE_MONGO_DB` | fhir | Database name |
//! | `MIGRATE_LOG_LEVEL` | info | Log level |
//! | `MIGRATE_BATCH_SIZE` | 10000 | Operations per bulk write |
//! | `MIGRATE_REFERENCE_BATCH_SIZE` | 1000 | Cached ids per reference query |
//! | `MIGRATE_COLLECTION_CONCURRENCY` | 4 | Collections processed at once |
//! | `MIGRATE_COLLECTIONS` | (all) | Resource types to process |
//! | `MIGRATE_START_FROM_COLLECTION` | | First collection to process |
//! | `MIGRATE_START_FROM_ID` | | Resume position (`_id`) |
//! | `MIGRATE_HISTORY_MODE` | append | Version modified documents |
//! | `MIGRATE_S3_BUCKET` | | Bucket holding source bundles |
//! | `MIGRATE_ID_CACHE_FILE` | cachedResourceIds.json | Id map cache |
//! | `MIGRATE_PROGRESS_INTERVAL` | 5m | Status log period |

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::history::HistoryMode;
use crate::preload::DEFAULT_ID_CACHE_FILE;
use crate::store::{Comparable, Filter};
use crate::types::DocumentId;

/// Configuration of one migration run.
#[derive(Debug, Clone, Parser)]
#[command(name = "helios-migrate")]
#[command(about = "Resource identity migration and reference resolution")]
pub struct MigrateConfig {
    /// MongoDB connection string.
    #[arg(long, env = "MIGRATE_MONGO_URL", default_value = "mongodb://localhost:27017")]
    pub mongo_url: String,

    /// Database holding the FHIR collections.
    #[arg(long, env = "MIGRATE_MONGO_DB", default_value = "fhir")]
    pub mongo_db: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "MIGRATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Operations per bulk write.
    #[arg(long, env = "MIGRATE_BATCH_SIZE", default_value = "10000")]
    pub batch_size: usize,

    /// Cached source ids per reference query.
    #[arg(long, env = "MIGRATE_REFERENCE_BATCH_SIZE", default_value = "1000")]
    pub reference_batch_size: usize,

    /// Collections processed concurrently.
    #[arg(long, env = "MIGRATE_COLLECTION_CONCURRENCY", default_value = "4")]
    pub collection_concurrency: usize,

    /// Resource types to process (comma-separated, empty for all).
    #[arg(long, env = "MIGRATE_COLLECTIONS", value_delimiter = ',')]
    pub collections: Vec<String>,

    /// Skip collections sorting before this one.
    #[arg(long, env = "MIGRATE_START_FROM_COLLECTION")]
    pub start_from_collection: Option<String>,

    /// Resume every scan at this `_id`.
    #[arg(long, env = "MIGRATE_START_FROM_ID")]
    pub start_from_id: Option<String>,

    /// Maximum documents per collection.
    #[arg(long, env = "MIGRATE_LIMIT")]
    pub limit: Option<usize>,

    /// Documents to pass over per collection.
    #[arg(long, env = "MIGRATE_SKIP")]
    pub skip: Option<usize>,

    /// Only documents last updated after this time (RFC 3339).
    #[arg(long, env = "MIGRATE_AFTER")]
    pub after: Option<String>,

    /// Only documents last updated before this time (RFC 3339).
    #[arg(long, env = "MIGRATE_BEFORE")]
    pub before: Option<String>,

    /// Only documents having all of these fields (comma-separated).
    #[arg(long, env = "MIGRATE_PROPERTIES", value_delimiter = ',')]
    pub properties: Vec<String>,

    /// Run each bulk write in a transaction.
    #[arg(long, env = "MIGRATE_USE_TRANSACTION", default_value = "false", action = clap::ArgAction::Set)]
    pub use_transaction: bool,

    /// Create transient indexes for reference queries.
    #[arg(long, env = "MIGRATE_CREATE_INDEXES", default_value = "true", action = clap::ArgAction::Set)]
    pub create_indexes: bool,

    /// Version modified documents and append history entries.
    #[arg(long, env = "MIGRATE_HISTORY_MODE", value_enum, default_value = "append")]
    pub history_mode: HistoryMode,

    /// Directory for the unresolved references file. Logged only when unset.
    #[arg(long, env = "MIGRATE_UNRESOLVED_DIR")]
    pub unresolved_dir: Option<PathBuf>,

    /// Bucket holding gzip-compressed source bundles.
    #[arg(long, env = "MIGRATE_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Folder (key prefix) of the source bundles.
    #[arg(long, env = "MIGRATE_S3_FOLDER", default_value = "")]
    pub s3_folder: String,

    /// AWS region of the bucket.
    #[arg(long, env = "MIGRATE_S3_REGION")]
    pub s3_region: Option<String>,

    /// Bundle files downloaded at once.
    #[arg(long, env = "MIGRATE_S3_QUERY_BATCH_SIZE", default_value = "3000")]
    pub s3_query_batch_size: usize,

    /// File the id map is cached in between runs.
    #[arg(long, env = "MIGRATE_ID_CACHE_FILE", default_value = DEFAULT_ID_CACHE_FILE)]
    pub id_cache_file: PathBuf,

    /// How often progress is logged.
    #[arg(long, env = "MIGRATE_PROGRESS_INTERVAL", default_value = "5m")]
    pub progress_interval: humantime::Duration,

    #[command(subcommand)]
    pub command: Command,
}

/// The migration to run.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "kebab-case")]
pub enum Command {
    /// Restore original ids of resources shortened to `<authority>-<id>`.
    ConnectionIdFix {
        #[arg(long, default_value = "proa")]
        connection_type: String,
    },
    /// Restore original ids of resources prefixed with `HumanApi-`.
    HumanApiIdFix,
    /// Restore over-long ids from the source bundles.
    ThedacareIdFix,
    /// Point Person links at Person and Patient uuids.
    MasterPersonReferenceFix {
        #[arg(long, default_value = "bwell")]
        owner: String,
    },
    /// Move resources from one source assigning authority to another.
    AuthorityRename {
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
        /// Owner tag selecting the documents (defaults to the old authority).
        #[arg(long)]
        owner: Option<String>,
        /// Resource types to rename (comma-separated).
        #[arg(long, value_delimiter = ',', default_value = "Person")]
        resource_types: Vec<String>,
    },
    /// Add the target's authority to references that lack one.
    ReferenceAuthorityFix {
        /// Resource types whose identities are preloaded (comma-separated).
        #[arg(long, value_delimiter = ',', required = true)]
        preload: Vec<String>,
        /// Owner tag restricting the documents rewritten.
        #[arg(long)]
        owner: Option<String>,
    },
}

impl MigrateConfig {
    /// Validates the configuration and returns errors if any.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.batch_size == 0 {
            errors.push("Batch size cannot be 0".to_string());
        }
        if self.reference_batch_size == 0 {
            errors.push("Reference batch size cannot be 0".to_string());
        }
        if self.collection_concurrency == 0 {
            errors.push("Collection concurrency cannot be 0".to_string());
        }
        if self.s3_query_batch_size == 0 {
            errors.push("S3 query batch size cannot be 0".to_string());
        }

        let after = self.after.as_deref().map(|v| parse_time("after", v));
        let before = self.before.as_deref().map(|v| parse_time("before", v));
        for parsed in [&after, &before] {
            if let Some(Err(e)) = parsed {
                errors.push(e.to_string());
            }
        }
        if let (Some(Ok(after)), Some(Ok(before))) = (&after, &before) {
            if after >= before {
                errors.push("After must be earlier than before".to_string());
            }
        }

        if let Command::AuthorityRename { old, new, .. } = &self.command {
            if old.is_empty() || new.is_empty() {
                errors.push("Authority rename needs both old and new authority".to_string());
            } else if old == new {
                errors.push("Old and new authority are the same".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Run-level options shared by every variant.
    pub fn run_options(&self) -> Result<RunOptions, ConfigError> {
        let after = self.after.as_deref().map(|v| parse_time("after", v)).transpose()?;
        let before = self.before.as_deref().map(|v| parse_time("before", v)).transpose()?;
        Ok(RunOptions {
            batch_size: self.batch_size,
            reference_batch_size: self.reference_batch_size,
            collection_concurrency: self.collection_concurrency,
            collections: self.collections.clone(),
            start_from_collection: self.start_from_collection.clone(),
            start_from_id: self.start_from_id.clone().map(DocumentId::from),
            limit: self.limit,
            skip: self.skip,
            after,
            before,
            properties: self.properties.clone(),
            use_transaction: self.use_transaction,
            create_indexes: self.create_indexes,
            history_mode: self.history_mode,
            unresolved_dir: self.unresolved_dir.clone(),
            progress_interval: self.progress_interval.into(),
            ..RunOptions::default()
        })
    }
}

fn parse_time(name: &str, value: &str) -> Result<DateTime<Utc>, ConfigError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ConfigError::Invalid {
            name: name.to_string(),
            message: e.to_string(),
        })
}

/// Options applying to every collection scan of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    pub batch_size: usize,
    pub reference_batch_size: usize,
    pub collection_concurrency: usize,
    /// Resource types to process; empty means all.
    pub collections: Vec<String>,
    pub start_from_collection: Option<String>,
    pub start_from_id: Option<DocumentId>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub properties: Vec<String>,
    pub use_transaction: bool,
    pub create_indexes: bool,
    pub history_mode: HistoryMode,
    pub unresolved_dir: Option<PathBuf>,
    pub progress_interval: Duration,
    /// Documents per page while preloading caches.
    pub preload_page_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            reference_batch_size: 1000,
            collection_concurrency: 4,
            collections: Vec::new(),
            start_from_collection: None,
            start_from_id: None,
            limit: None,
            skip: None,
            after: None,
            before: None,
            properties: Vec::new(),
            use_transaction: false,
            create_indexes: true,
            history_mode: HistoryMode::Append,
            unresolved_dir: None,
            progress_interval: Duration::from_secs(300),
            preload_page_size: 10_000,
        }
    }
}

impl RunOptions {
    /// The user-supplied document filter (`lastUpdated` window and required fields).
    pub fn document_filter(&self) -> Filter {
        let mut filter = Filter::All;
        if let Some(after) = self.after {
            filter = filter.and(Filter::Gt {
                field: "meta.lastUpdated".to_string(),
                value: Comparable::Date(after),
            });
        }
        if let Some(before) = self.before {
            filter = filter.and(Filter::Lt {
                field: "meta.lastUpdated".to_string(),
                value: Comparable::Date(before),
            });
        }
        for property in &self.properties {
            filter = filter.and(Filter::exists(property.as_str()));
        }
        filter
    }

    /// True if the resource type was selected for this run.
    pub fn includes(&self, resource_type: &str) -> bool {
        self.collections.is_empty() || self.collections.iter().any(|c| c == resource_type)
    }
}
