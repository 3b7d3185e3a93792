//! Sequencing of a migration run.
//!
//! A run moves through fixed phases:
//!
//! ```text
//! Init -> Preload -> RewriteReferences(main) -> RewriteReferences(history)
//!      -> RenameIdentities(main) -> RenameIdentities(history) -> Shutdown
//! ```
//!
//! Within a phase, collections are scanned concurrently up to
//! `collection_concurrency`. A failed collection is logged with its resume
//! position and the phase continues; configuration, setup and index errors
//! abort the run. History collections are scanned after their main collection
//! and only for the documents the main scan changed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cache::{CacheSeed, CacheStats, ReferenceCache};
use crate::config::RunOptions;
use crate::engine::{BatchReport, CursorState, ScanRequest, scan, with_transient_indexes};
use crate::error::{MigrationError, MigrationResult};
use crate::history::ResourceWriter;
use crate::rewrite::UnresolvedLog;
use crate::store::DocumentStore;
use crate::types::{CollectionName, DocumentId};

mod handler;
mod pass;

pub use handler::{Progress, RenameTransform, ResourceTransform, RewriteTransform, TransformHandler};
pub use pass::{FilteredPass, Pass, ReferencePass, ReferenceScope, RenamePass, ScanPlan};

/// Main or history half of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    Main,
    History,
}

/// State of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "scope", rename_all = "camelCase")]
pub enum Phase {
    Init,
    Preload,
    RewriteReferences(Scope),
    RenameIdentities(Scope),
    Shutdown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Init => write!(f, "init"),
            Phase::Preload => write!(f, "preload"),
            Phase::RewriteReferences(Scope::Main) => write!(f, "rewrite-references(main)"),
            Phase::RewriteReferences(Scope::History) => write!(f, "rewrite-references(history)"),
            Phase::RenameIdentities(Scope::Main) => write!(f, "rename-identities(main)"),
            Phase::RenameIdentities(Scope::History) => write!(f, "rename-identities(history)"),
            Phase::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// The passes a migration runs after preloading.
#[derive(Default)]
pub struct MigrationPlan {
    pub rewrite: Option<Arc<dyn Pass>>,
    pub rename: Option<Arc<dyn Pass>>,
}

/// One migration variant.
#[async_trait]
pub trait Migration: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fills the run's cache and returns the passes to run.
    ///
    /// Nothing has been written when this is called, so a missing external
    /// source must fail here.
    async fn prepare(&self, run: &MigrationRun) -> MigrationResult<MigrationPlan>;
}

/// State owned by one run: the store, options and caches.
pub struct MigrationRun {
    pub store: Arc<dyn DocumentStore>,
    pub options: RunOptions,
    pub cache: Arc<ReferenceCache>,
    pub unresolved: Arc<UnresolvedLog>,
    pub writer: ResourceWriter,
    collections: Vec<CollectionName>,
    progress: Arc<Progress>,
    phase: Mutex<Phase>,
}

impl MigrationRun {
    /// Every FHIR collection of the store, sorted.
    pub fn collections(&self) -> &[CollectionName] {
        &self.collections
    }

    pub fn has_collection(&self, collection: &CollectionName) -> bool {
        self.collections.binary_search(collection).is_ok()
    }

    /// Main collections selected by the run options.
    pub fn main_collections(&self) -> Vec<CollectionName> {
        self.collections
            .iter()
            .filter(|c| !c.is_history() && self.options.includes(c.resource_type()))
            .filter(|c| {
                self.options
                    .start_from_collection
                    .as_deref()
                    .is_none_or(|start| c.as_str() >= start)
            })
            .cloned()
            .collect()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    fn enter(&self, phase: Phase) {
        info!(from = %self.phase(), to = %phase, "Phase transition");
        *self.phase.lock() = phase;
    }

    /// Preloads the cache from `collections` with bounded concurrency.
    pub async fn preload(
        &self,
        collections: Vec<CollectionName>,
        seed: Arc<dyn CacheSeed>,
    ) -> MigrationResult<usize> {
        let semaphore = Arc::new(Semaphore::new(self.options.collection_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for collection in collections {
            let semaphore = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let cache = Arc::clone(&self.cache);
            let seed = Arc::clone(&seed);
            let page_size = self.options.preload_page_size;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(setup_error)?;
                cache.preload(store.as_ref(), &collection, seed.as_ref(), page_size).await
            });
        }

        let mut total = 0;
        while let Some(joined) = tasks.join_next().await {
            total += joined.map_err(setup_error)??;
        }
        info!(entries = self.cache.len(), inserted = total, "Preloaded reference cache");
        Ok(total)
    }
}

fn setup_error(e: impl fmt::Display) -> MigrationError {
    MigrationError::Setup {
        message: e.to_string(),
    }
}

/// Result of one collection scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOutcome {
    pub collection: CollectionName,
    pub phase: Phase,
    pub scanned: u64,
    pub operations: u64,
    pub modified: u64,
    pub error: Option<String>,
    /// Where a re-run should resume after an error.
    pub start_from_id: Option<DocumentId>,
}

impl CollectionOutcome {
    fn new(collection: CollectionName, phase: Phase, result: &MigrationResult<BatchReport>) -> Self {
        let (report, error, start_from_id) = match result {
            Ok(report) => (report.clone(), None, None),
            Err(e) => (BatchReport::default(), Some(e.to_string()), e.start_from_id().cloned()),
        };
        Self {
            collection,
            phase,
            scanned: report.scanned,
            operations: report.operations,
            modified: report.modified,
            error,
            start_from_id,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub migration: String,
    pub phases: Vec<Phase>,
    pub collections: Vec<CollectionOutcome>,
    /// Lookup counters per referenced collection.
    pub cache: BTreeMap<String, CacheStats>,
    pub cache_entries: usize,
    pub ambiguous_keys: usize,
    pub unresolved: u64,
    /// The rename phase did not run because the rewrite phase had errors.
    pub rename_skipped: bool,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &CollectionOutcome> {
        self.collections.iter().filter(|c| !c.is_ok())
    }

    pub fn has_errors(&self) -> bool {
        self.failed().next().is_some()
    }

    /// Write operations across all collections.
    pub fn operations(&self) -> u64 {
        self.collections.iter().map(|c| c.operations).sum()
    }
}

/// Runs migrations against one store.
pub struct MigrationOrchestrator {
    store: Arc<dyn DocumentStore>,
    options: RunOptions,
    writer: ResourceWriter,
}

impl MigrationOrchestrator {
    pub fn new(store: Arc<dyn DocumentStore>, options: RunOptions) -> Self {
        let writer = ResourceWriter::new(Arc::new(crate::collaborators::DefaultPreSave), options.history_mode);
        Self { store, options, writer }
    }

    /// Replaces the write path, e.g. to plug in another [`PreSave`](crate::collaborators::PreSave).
    pub fn with_writer(mut self, writer: ResourceWriter) -> Self {
        self.writer = writer;
        self
    }

    /// Runs `migration` to completion.
    ///
    /// # Errors
    ///
    /// Fatal errors only (see [`MigrationError::is_fatal`]). Failed collections are
    /// reported in the [`RunSummary`].
    pub async fn run(&self, migration: &dyn Migration) -> MigrationResult<RunSummary> {
        info!(migration = migration.name(), backend = self.store.backend_name(), "Starting migration");
        let unresolved = match &self.options.unresolved_dir {
            Some(dir) => UnresolvedLog::create_in(dir).await?,
            None => UnresolvedLog::disabled(),
        };
        let mut collections: Vec<CollectionName> = self
            .store
            .list_collections()
            .await?
            .into_iter()
            .filter(|c| c.as_str().contains("_4_0_0"))
            .collect();
        collections.sort();

        let run = Arc::new(MigrationRun {
            store: Arc::clone(&self.store),
            options: self.options.clone(),
            cache: Arc::new(ReferenceCache::new()),
            unresolved: Arc::new(unresolved),
            writer: self.writer.clone(),
            collections,
            progress: Arc::new(Progress::default()),
            phase: Mutex::new(Phase::Init),
        });
        let mut summary = RunSummary {
            migration: migration.name().to_string(),
            phases: vec![Phase::Init],
            ..RunSummary::default()
        };

        let status = spawn_status_logger(Arc::clone(&run));
        let result = self.run_phases(&run, migration, &mut summary).await;
        if let Some(status) = status {
            status.abort();
        }

        run.enter(Phase::Shutdown);
        summary.phases.push(Phase::Shutdown);
        run.unresolved.finish().await?;
        result?;

        summary.cache = run.cache.stats();
        summary.cache_entries = run.cache.len();
        summary.ambiguous_keys = run.cache.ambiguous_keys().len();
        summary.unresolved = run.unresolved.count();
        for (collection, stats) in &summary.cache {
            info!(
                collection = %collection,
                hits = stats.hits,
                misses = stats.misses,
                ambiguous = stats.ambiguous,
                not_found = stats.not_found,
                "Cache statistics"
            );
        }
        info!(
            migration = migration.name(),
            operations = summary.operations(),
            failed = summary.failed().count(),
            unresolved = summary.unresolved,
            "Finished migration"
        );
        Ok(summary)
    }

    async fn run_phases(
        &self,
        run: &Arc<MigrationRun>,
        migration: &dyn Migration,
        summary: &mut RunSummary,
    ) -> MigrationResult<()> {
        run.enter(Phase::Preload);
        summary.phases.push(Phase::Preload);
        let plan = migration.prepare(run).await?;

        if let Some(pass) = plan.rewrite {
            let outcomes = run_pass(run, pass, Phase::RewriteReferences).await?;
            summary.phases.extend([
                Phase::RewriteReferences(Scope::Main),
                Phase::RewriteReferences(Scope::History),
            ]);
            summary.collections.extend(outcomes);
            run.cache.clear_touched();
        }

        if let Some(pass) = plan.rename {
            if summary.has_errors() {
                // any collection may still reference the old ids
                let failed: Vec<&str> = summary.failed().map(|c| c.collection.as_str()).collect();
                warn!(
                    failed = ?failed,
                    "Skipping identity rename because reference rewriting failed"
                );
                summary.rename_skipped = true;
                return Ok(());
            }
            let outcomes = run_pass(run, pass, Phase::RenameIdentities).await?;
            summary.phases.extend([
                Phase::RenameIdentities(Scope::Main),
                Phase::RenameIdentities(Scope::History),
            ]);
            summary.collections.extend(outcomes);
        }
        Ok(())
    }
}

fn spawn_status_logger(run: Arc<MigrationRun>) -> Option<tokio::task::JoinHandle<()>> {
    if run.options.progress_interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(run.options.progress_interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                phase = %run.phase(),
                scanned = run.progress().scanned(),
                changed = run.progress().changed(),
                cache_entries = run.cache.len(),
                "Migration status"
            );
        }
    }))
}

/// A collection scan scheduled by [`run_pass`].
struct Job {
    collection: CollectionName,
    plans: Vec<ScanPlan>,
    /// `resource._uuid` values a history scan is restricted to.
    touched: Option<Vec<String>>,
}

async fn run_pass(
    run: &Arc<MigrationRun>,
    pass: Arc<dyn Pass>,
    phase: fn(Scope) -> Phase,
) -> MigrationResult<Vec<CollectionOutcome>> {
    run.enter(phase(Scope::Main));
    let main_jobs: Vec<Job> = pass
        .collections(run)
        .into_iter()
        .map(|collection| Job {
            plans: pass.plans(run, &collection),
            collection,
            touched: None,
        })
        .collect();
    info!(pass = pass.name(), collections = main_jobs.len(), "Scanning main collections");
    let mut outcomes = run_jobs(run, &pass, phase(Scope::Main), main_jobs).await?;

    run.enter(phase(Scope::History));
    let history_jobs: Vec<Job> = outcomes
        .iter()
        .filter_map(|outcome| {
            let history = outcome.collection.to_history();
            let touched = run.cache.touched(outcome.collection.resource_type())?;
            if touched.is_empty() || !run.has_collection(&history) {
                return None;
            }
            Some(Job {
                plans: vec![pass.history_plan(run, &history)],
                collection: history,
                touched: Some(touched),
            })
        })
        .collect();
    info!(pass = pass.name(), collections = history_jobs.len(), "Scanning history collections");
    outcomes.extend(run_jobs(run, &pass, phase(Scope::History), history_jobs).await?);

    Ok(outcomes)
}

async fn run_jobs(
    run: &Arc<MigrationRun>,
    pass: &Arc<dyn Pass>,
    phase: Phase,
    jobs: Vec<Job>,
) -> MigrationResult<Vec<CollectionOutcome>> {
    let semaphore = Arc::new(Semaphore::new(run.options.collection_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for job in jobs {
        let run = Arc::clone(run);
        let pass = Arc::clone(pass);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(setup_error)?;
            let result = scan_job(&run, pass.as_ref(), &job).await;
            Ok::<_, MigrationError>((job.collection, result))
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (collection, result) = joined.map_err(setup_error)??;
        let result = match result {
            Err(e) if e.is_fatal() => {
                error!(collection = %collection, error = %e, "Aborting migration");
                tasks.abort_all();
                return Err(e);
            }
            other => other,
        };
        match &result {
            Ok(report) if !collection.is_history() => {
                run.cache
                    .record_touched(collection.resource_type(), report.touched.iter().cloned());
            }
            Ok(_) => {}
            Err(e) => {
                let at = e.start_from_id().map(DocumentId::as_str).unwrap_or("start");
                error!(collection = %collection, "Got error {e}. At {at}");
            }
        }
        outcomes.push(CollectionOutcome::new(collection, phase, &result));
    }
    outcomes.sort_by(|a, b| a.collection.cmp(&b.collection));
    Ok(outcomes)
}

async fn scan_job(run: &MigrationRun, pass: &dyn Pass, job: &Job) -> MigrationResult<BatchReport> {
    let handler = TransformHandler::new(
        job.collection.clone(),
        pass.transform(),
        run.writer.clone(),
        Arc::clone(&run.unresolved),
        Arc::clone(&run.progress),
    )
    .replacing(pass.replace());
    let options = &run.options;

    let mut total = BatchReport::default();
    for plan in &job.plans {
        let mut request = ScanRequest::new(job.collection.clone(), plan.filter.clone(), options.batch_size)
            .with_start_from_id(options.start_from_id.clone())
            .with_limit(options.limit)
            .with_skip(options.skip)
            .with_transaction(options.use_transaction);
        if let Some(touched) = &job.touched {
            request = request.with_filter_to_ids("resource._uuid", touched.clone());
        }
        let mut state = CursorState {
            start_from_id: options.start_from_id.clone(),
            ..CursorState::default()
        };

        let store = run.store.as_ref();
        let report = if options.create_indexes && !plan.indexes.is_empty() {
            let (request, state, handler) = (&request, &mut state, &handler);
            with_transient_indexes(store, &job.collection, &plan.indexes, move || {
                scan(store, request, state, handler)
            })
            .await?
        } else {
            scan(store, &request, &mut state, &handler).await?
        };
        total.merge(report);
    }
    Ok(total)
}
