//! Indexes that only exist for the duration of one scan.

use std::future::Future;

use tracing::{error, info};

use crate::error::{MigrationError, MigrationResult};
use crate::store::{DocumentStore, IndexSpec};
use crate::types::CollectionName;

/// Tracks the indexes a scan created so they can be dropped afterwards.
///
/// Indexes that already existed are left in place on release.
pub struct IndexGuard<'a> {
    store: &'a dyn DocumentStore,
    collection: CollectionName,
    created: Vec<String>,
}

impl<'a> IndexGuard<'a> {
    /// Creates every missing index. On failure the indexes created so far are dropped.
    pub async fn create(
        store: &'a dyn DocumentStore,
        collection: &CollectionName,
        indexes: &[IndexSpec],
    ) -> MigrationResult<IndexGuard<'a>> {
        let mut guard = IndexGuard {
            store,
            collection: collection.clone(),
            created: Vec::new(),
        };
        for index in indexes {
            if let Err(e) = guard.ensure(index).await {
                guard.release().await.ok();
                return Err(e);
            }
        }
        Ok(guard)
    }

    async fn ensure(&mut self, index: &IndexSpec) -> MigrationResult<()> {
        let index_error = |message: String| MigrationError::Index {
            collection: self.collection.to_string(),
            index: index.name.clone(),
            message,
        };
        let exists = self
            .store
            .index_exists(&self.collection, &index.name)
            .await
            .map_err(|e| index_error(e.to_string()))?;
        if exists {
            return Ok(());
        }
        info!(collection = %self.collection, index = %index.name, "Creating index");
        self.store
            .create_index(&self.collection, index)
            .await
            .map_err(|e| index_error(e.to_string()))?;
        self.created.push(index.name.clone());
        Ok(())
    }

    pub fn created(&self) -> &[String] {
        &self.created
    }

    /// Drops the indexes this guard created. Every index is attempted; the
    /// first failure is returned.
    pub async fn release(self) -> MigrationResult<()> {
        let mut first_error = None;
        for name in &self.created {
            info!(collection = %self.collection, index = %name, "Dropping index");
            if let Err(e) = self.store.drop_index(&self.collection, name).await {
                error!(collection = %self.collection, index = %name, error = %e, "Failed to drop index");
                first_error.get_or_insert(MigrationError::Index {
                    collection: self.collection.to_string(),
                    index: name.clone(),
                    message: e.to_string(),
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Runs `body` with the given indexes present, dropping the ones it created
/// afterwards whether or not `body` succeeded.
///
/// An error from `body` takes precedence over an error dropping the indexes.
pub async fn with_transient_indexes<T, F, Fut>(
    store: &dyn DocumentStore,
    collection: &CollectionName,
    indexes: &[IndexSpec],
    body: F,
) -> MigrationResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = MigrationResult<T>>,
{
    let guard = IndexGuard::create(store, collection, indexes).await?;
    let result = body().await;
    let released = guard.release().await;
    match (result, released) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(value), Ok(())) => Ok(value),
    }
}
