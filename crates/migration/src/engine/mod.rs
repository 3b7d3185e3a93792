//! Resumable batch scans over one collection.
//!
//! [`scan`] pages through the documents matching a [`ScanRequest`] in ascending
//! `_id` order, hands each one to a [`DocumentHandler`], and flushes the
//! resulting operations as unordered bulk writes of at most `batch_size`
//! operations. After every flush the position in [`CursorState`] moves to the
//! last processed document, so an error always reports where a re-run can
//! resume.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{MigrationError, MigrationResult};
use crate::store::{BulkOperation, BulkWriteOptions, DocumentStore, Filter};
use crate::types::{CollectionName, DocumentId, StoredDocument};

mod index;

pub use index::{IndexGuard, with_transient_indexes};

/// Ids per `$in` clause when a scan is restricted to known ids.
pub const DEFAULT_ID_CHUNK_SIZE: usize = 1000;

/// What to scan and how.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub collection: CollectionName,
    pub filter: Filter,
    /// Operations per bulk write, and documents per page.
    pub batch_size: usize,
    /// Resume point; documents with `_id >= start_from_id` are scanned.
    pub start_from_id: Option<DocumentId>,
    /// Maximum number of documents to process.
    pub limit: Option<usize>,
    /// Number of matching documents to pass over before processing.
    pub skip: Option<usize>,
    /// Restricts the scan to documents whose `filter_to_id_property` is one of these.
    pub filter_to_ids: Option<Vec<String>>,
    pub filter_to_id_property: String,
    pub id_chunk_size: usize,
    pub use_transaction: bool,
    pub projection: Option<Vec<String>>,
}

impl ScanRequest {
    pub fn new(collection: CollectionName, filter: Filter, batch_size: usize) -> Self {
        Self {
            collection,
            filter,
            batch_size,
            start_from_id: None,
            limit: None,
            skip: None,
            filter_to_ids: None,
            filter_to_id_property: "_uuid".to_string(),
            id_chunk_size: DEFAULT_ID_CHUNK_SIZE,
            use_transaction: false,
            projection: None,
        }
    }

    pub fn with_start_from_id(mut self, id: Option<DocumentId>) -> Self {
        self.start_from_id = id;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_skip(mut self, skip: Option<usize>) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_filter_to_ids(mut self, property: impl Into<String>, ids: Vec<String>) -> Self {
        self.filter_to_id_property = property.into();
        self.filter_to_ids = Some(ids);
        self
    }

    pub fn with_id_chunk_size(mut self, size: usize) -> Self {
        self.id_chunk_size = size;
        self
    }

    pub fn with_transaction(mut self, use_transaction: bool) -> Self {
        self.use_transaction = use_transaction;
        self
    }

    pub fn with_projection(mut self, projection: Option<Vec<String>>) -> Self {
        self.projection = projection;
        self
    }

    /// One filter per id chunk, or the base filter alone.
    fn filters(&self) -> Vec<Filter> {
        let mut base = self.filter.clone();
        if let Some(start) = &self.start_from_id {
            base = base.and(Filter::IdGte(start.clone()));
        }
        match &self.filter_to_ids {
            None => vec![base],
            Some(ids) => ids
                .chunks(self.id_chunk_size.max(1))
                .map(|chunk| {
                    base.clone().and(Filter::is_in(
                        self.filter_to_id_property.as_str(),
                        chunk.iter().cloned().map(Value::String),
                    ))
                })
                .collect(),
        }
    }
}

/// Progress of one collection scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    /// Last document whose operations have been written.
    pub start_from_id: Option<DocumentId>,
    /// Operations written.
    pub converted: u64,
    pub modified: u64,
    pub upserted: u64,
    pub batches: u64,
}

/// Result of handling one document.
#[derive(Debug)]
pub enum Outcome {
    /// Operations to write; empty when the document needs no change.
    Ok(Vec<BulkOperation>),
    /// The handler chose not to process the document.
    Skipped(String),
    /// The document could not be processed; aborts the scan.
    Err(MigrationError),
}

/// Converts documents into write operations.
#[async_trait]
pub trait DocumentHandler: Send + Sync {
    async fn handle(&self, document: &StoredDocument) -> Outcome;
}

/// Aggregated result of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub scanned: u64,
    pub skipped: u64,
    pub operations: u64,
    pub modified: u64,
    pub batches: u64,
    /// `_uuid`s of documents that produced at least one operation.
    pub touched: BTreeSet<String>,
    pub last_id: Option<DocumentId>,
}

impl BatchReport {
    pub fn merge(&mut self, other: BatchReport) {
        self.scanned += other.scanned;
        self.skipped += other.skipped;
        self.operations += other.operations;
        self.modified += other.modified;
        self.batches += other.batches;
        self.touched.extend(other.touched);
        if other.last_id.is_some() {
            self.last_id = other.last_id;
        }
    }
}

struct Scan<'a> {
    store: &'a dyn DocumentStore,
    request: &'a ScanRequest,
    state: &'a mut CursorState,
    report: BatchReport,
    pending: Vec<BulkOperation>,
    skipped_docs: usize,
}

impl Scan<'_> {
    fn position_error(&self, error: MigrationError) -> MigrationError {
        error.at_position(self.request.collection.as_str(), self.state.start_from_id.clone())
    }

    fn limit_reached(&self) -> bool {
        self.request
            .limit
            .is_some_and(|limit| self.report.scanned >= limit as u64)
    }

    async fn flush(&mut self) -> MigrationResult<()> {
        if self.pending.is_empty() {
            self.state.start_from_id = self.report.last_id.clone();
            return Ok(());
        }
        let operations = std::mem::take(&mut self.pending);
        let count = operations.len() as u64;
        let options = BulkWriteOptions {
            ordered: false,
            transaction: self.request.use_transaction,
        };
        let summary = match self.store.bulk_write(operations, options).await {
            Ok(summary) => summary,
            Err(e) => return Err(self.position_error(e.into())),
        };

        self.state.start_from_id = self.report.last_id.clone();
        self.state.converted += count;
        self.state.modified += summary.modified;
        self.state.upserted += summary.upserted;
        self.state.batches += 1;
        self.report.operations += count;
        self.report.modified += summary.modified;
        self.report.batches += 1;

        info!(
            collection = %self.request.collection,
            start_from_id = ?self.state.start_from_id.as_ref().map(DocumentId::as_str),
            operations = count,
            modified = summary.modified,
            converted = self.state.converted,
            "Processed batch"
        );
        Ok(())
    }

    async fn process(&mut self, document: StoredDocument, handler: &dyn DocumentHandler) -> MigrationResult<()> {
        self.report.scanned += 1;
        match handler.handle(&document).await {
            Outcome::Ok(operations) => {
                if !operations.is_empty() {
                    if let Some(uuid) = document.uuid() {
                        self.report.touched.insert(uuid.to_string());
                    }
                    self.pending.extend(operations);
                }
            }
            Outcome::Skipped(reason) => {
                debug!(collection = %self.request.collection, id = %document.id, reason, "Skipped document");
                self.report.skipped += 1;
            }
            Outcome::Err(e) => return Err(self.position_error(e)),
        }
        self.report.last_id = Some(document.id);
        if self.pending.len() >= self.request.batch_size.max(1) {
            self.flush().await?;
        }
        Ok(())
    }

    async fn run_filter(&mut self, filter: &Filter, handler: &dyn DocumentHandler) -> MigrationResult<()> {
        let page_size = self.request.batch_size.max(1);
        let mut after: Option<DocumentId> = None;
        loop {
            if self.limit_reached() {
                return Ok(());
            }
            let page = self
                .store
                .find_page(
                    &self.request.collection,
                    filter,
                    after.as_ref(),
                    page_size,
                    self.request.projection.as_deref(),
                )
                .await
                .map_err(|e| self.position_error(e.into()))?;
            let exhausted = page.len() < page_size;
            after = page.last().map(|doc| doc.id.clone());

            for document in page {
                if self.request.skip.is_some_and(|skip| self.skipped_docs < skip) {
                    self.skipped_docs += 1;
                    continue;
                }
                if self.limit_reached() {
                    return Ok(());
                }
                self.process(document, handler).await?;
            }
            if exhausted {
                return Ok(());
            }
        }
    }
}

/// Scans one collection, writing the operations the handler produces.
///
/// # Errors
///
/// Handler errors and failed bulk writes abort the scan. Both are returned as
/// [`MigrationError::Batch`] carrying the position of the last written batch.
pub async fn scan(
    store: &dyn DocumentStore,
    request: &ScanRequest,
    state: &mut CursorState,
    handler: &dyn DocumentHandler,
) -> MigrationResult<BatchReport> {
    if request.filter_to_ids.as_ref().is_some_and(Vec::is_empty) {
        debug!(collection = %request.collection, "No ids to scan");
        return Ok(BatchReport::default());
    }

    let mut scan = Scan {
        store,
        request,
        state,
        report: BatchReport::default(),
        pending: Vec::new(),
        skipped_docs: 0,
    };
    for filter in request.filters() {
        scan.run_filter(&filter, handler).await?;
    }
    scan.flush().await?;

    info!(
        collection = %request.collection,
        scanned = scan.report.scanned,
        skipped = scan.report.skipped,
        operations = scan.report.operations,
        batches = scan.report.batches,
        "Finished scan"
    );
    Ok(scan.report)
}
