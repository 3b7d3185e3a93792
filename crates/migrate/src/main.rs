//! Helios FHIR Server migration tool.
//!
//! Runs one resource identity migration against a MongoDB database.

use std::sync::Arc;

use clap::Parser;
use helios_migration::variants::{
    AuthorityRename, IdentityFix, MasterPersonReferenceFix, ReferenceAuthorityFix, ThedacareIdFix,
};
use helios_migration::{Command, DocumentStore, MigrateConfig, Migration, MigrationOrchestrator, init_logging};
use tracing::{info, warn};

/// Connects to MongoDB.
#[cfg(feature = "mongodb")]
async fn connect(config: &MigrateConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    use helios_migration::{MongoStore, MongoStoreConfig};

    info!(database = %config.mongo_db, "Connecting to MongoDB");
    let store = MongoStore::connect(&MongoStoreConfig {
        uri: config.mongo_url.clone(),
        database: config.mongo_db.clone(),
    })
    .await?;
    Ok(Arc::new(store))
}

/// Fallback when mongodb feature is not enabled.
#[cfg(not(feature = "mongodb"))]
async fn connect(_config: &MigrateConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    anyhow::bail!(
        "Migrations require the 'mongodb' feature. \
         Build with: cargo build -p helios-migrate --features mongodb"
    )
}

/// Builds the bundle preload source, if a bucket is configured.
#[cfg(feature = "s3")]
async fn bundle_preload(config: &MigrateConfig) -> Option<helios_migration::preload::BundlePreload> {
    use helios_migration::preload::{AwsS3Client, BundlePreload, BundlePreloadConfig};

    let bucket = config.s3_bucket.as_ref()?;
    let sdk_config = AwsS3Client::load_sdk_config(config.s3_region.as_deref()).await;
    let mut preload_config = BundlePreloadConfig::new(bucket.clone(), config.s3_folder.clone());
    preload_config.query_batch_size = config.s3_query_batch_size;
    Some(BundlePreload::new(
        Arc::new(AwsS3Client::from_sdk_config(&sdk_config)),
        preload_config,
    ))
}

/// Fallback when s3 feature is not enabled.
#[cfg(not(feature = "s3"))]
async fn bundle_preload(config: &MigrateConfig) -> Option<helios_migration::preload::BundlePreload> {
    if config.s3_bucket.is_some() {
        warn!("Ignoring S3 bucket; build with the 's3' feature to download bundles");
    }
    None
}

async fn migration(config: &MigrateConfig) -> Box<dyn Migration> {
    match &config.command {
        Command::ConnectionIdFix { connection_type } => Box::new(IdentityFix::connection(connection_type.clone())),
        Command::HumanApiIdFix => Box::new(IdentityFix::human_api()),
        Command::ThedacareIdFix => Box::new(ThedacareIdFix::new(
            config.id_cache_file.clone(),
            bundle_preload(config).await,
        )),
        Command::MasterPersonReferenceFix { owner } => Box::new(MasterPersonReferenceFix::new(owner.clone())),
        Command::AuthorityRename {
            old,
            new,
            owner,
            resource_types,
        } => {
            let mut rename = AuthorityRename::new(old.clone(), new.clone()).with_resource_types(resource_types.clone());
            if let Some(owner) = owner {
                rename = rename.with_owner(owner.clone());
            }
            Box::new(rename)
        }
        Command::ReferenceAuthorityFix { preload, owner } => {
            let mut fix = ReferenceAuthorityFix::new(preload.clone());
            if let Some(owner) = owner {
                fix = fix.with_owner(owner.clone());
            }
            Box::new(fix)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = MigrateConfig::parse();
    init_logging(&config.log_level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    let options = config
        .run_options()
        .map_err(|e| anyhow::anyhow!("Invalid run configuration: {}", e))?;
    let store = connect(&config).await?;
    let migration = migration(&config).await;

    info!(
        migration = migration.name(),
        batch_size = options.batch_size,
        concurrency = options.collection_concurrency,
        history_mode = ?options.history_mode,
        "Starting migration"
    );

    let summary = MigrationOrchestrator::new(store, options)
        .run(migration.as_ref())
        .await?;

    for failed in summary.failed() {
        warn!(
            collection = %failed.collection,
            phase = %failed.phase,
            start_from_id = ?failed.start_from_id.as_ref().map(|id| id.as_str()),
            error = failed.error.as_deref().unwrap_or_default(),
            "Collection did not finish"
        );
    }
    if summary.has_errors() {
        anyhow::bail!("{} collection(s) failed; re-run to resume", summary.failed().count());
    }
    Ok(())
}
