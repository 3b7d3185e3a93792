//! Error types for the migration engine.
//!
//! Errors are split by where they can be caught: setup and configuration errors
//! abort a run before any write, document errors abort the collection being
//! scanned, and batch errors carry the resumable cursor position so the
//! orchestrator can log it and move on to the next collection.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

use crate::types::DocumentId;

/// The primary error type for all migration operations.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Invalid or missing configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The run could not be set up (fatal, nothing has been written yet).
    #[error("setup failed: {message}")]
    Setup { message: String },

    /// Backend store errors.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A single document could not be processed.
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// A batch or collection scan failed; carries the resumable position.
    #[error("error processing collection {collection} at {}: {source}", display_position(.start_from_id))]
    Batch {
        collection: String,
        start_from_id: Option<DocumentId>,
        #[source]
        source: Box<MigrationError>,
    },

    /// Transient index creation or removal failed.
    #[error("index {index} on {collection} failed: {message}")]
    Index {
        collection: String,
        index: String,
        message: String,
    },

    /// Preloading a cache failed.
    #[error("preload of {source_name} failed: {message}")]
    Preload {
        source_name: String,
        message: String,
    },

    /// Local file I/O (unresolved reference log, id cache file).
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn display_position(id: &Option<DocumentId>) -> String {
    id.as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "<start>".to_string())
}

/// Errors raised while validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required parameter was not supplied.
    #[error("{name} is a required parameter")]
    Missing { name: String },

    /// A parameter was supplied with an invalid value.
    #[error("invalid value for {name}: {message}")]
    Invalid { name: String, message: String },
}

/// Errors originating from the document store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The collection does not exist.
    #[error("collection not found: {collection}")]
    CollectionNotFound { collection: String },

    /// Query execution failed.
    #[error("query on {collection} failed: {message}")]
    Query { collection: String, message: String },

    /// A bulk write failed.
    #[error("bulk write to {collection} failed: {message}")]
    BulkWrite { collection: String, message: String },

    /// Serialization between JSON and the backend representation failed.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Errors raised while processing one document or one of its references.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// The document is not a usable resource.
    #[error("malformed document {id} in {collection}: {message}")]
    Malformed {
        collection: String,
        id: DocumentId,
        message: String,
    },

    /// A reference inside the document could not be processed.
    #[error("error processing reference {reference} in {resource}: {message}")]
    Reference {
        resource: String,
        reference: String,
        message: String,
    },

    /// Looking up a referenced resource failed.
    #[error("lookup of {reference} failed: {source}")]
    Lookup {
        reference: String,
        #[source]
        source: Box<MigrationError>,
    },
}

/// Result type alias for migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl MigrationError {
    /// Wraps an error with the collection and cursor position it happened at.
    pub fn at_position(
        self,
        collection: impl Into<String>,
        start_from_id: Option<DocumentId>,
    ) -> Self {
        MigrationError::Batch {
            collection: collection.into(),
            start_from_id,
            source: Box::new(self),
        }
    }

    /// Returns true if this error must abort the whole run instead of one collection.
    pub fn is_fatal(&self) -> bool {
        match self {
            MigrationError::Config(_)
            | MigrationError::Setup { .. }
            | MigrationError::Index { .. }
            | MigrationError::Preload { .. } => true,
            MigrationError::Batch { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Returns the resumable cursor position, if this error carries one.
    pub fn start_from_id(&self) -> Option<&DocumentId> {
        match self {
            MigrationError::Batch { start_from_id, .. } => start_from_id.as_ref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::Store(err.into())
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Internal {
            backend_name: "mongodb".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for MigrationError {
    fn from(err: mongodb::error::Error) -> Self {
        MigrationError::Store(err.into())
    }
}
