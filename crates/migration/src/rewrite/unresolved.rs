use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{MigrationError, MigrationResult};

/// `unresolvedReferences-<uuid>.txt`
pub fn unresolved_file_name() -> String {
    format!("unresolvedReferences-{}.txt", Uuid::new_v4())
}

/// Append-only record of references that could not be resolved.
///
/// The file is a JSON-like object with one line per resource:
///
/// ```text
/// {
/// 	"Observation/<uuid>": "Patient/a,Patient/b",
/// }
/// ```
#[derive(Debug)]
pub struct UnresolvedLog {
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
    count: AtomicU64,
}

impl UnresolvedLog {
    /// Logs unresolved references instead of writing them to a file.
    pub fn disabled() -> Self {
        Self {
            file: None,
            path: None,
            count: AtomicU64::new(0),
        }
    }

    pub async fn create(path: impl Into<PathBuf>) -> MigrationResult<Self> {
        let path = path.into();
        let mut file = File::create(&path).await.map_err(|source| io_error(&path, source))?;
        file.write_all(b"{\n").await.map_err(|source| io_error(&path, source))?;
        info!(path = %path.display(), "Writing unresolved references");
        Ok(Self {
            file: Some(Mutex::new(file)),
            path: Some(path),
            count: AtomicU64::new(0),
        })
    }

    /// Creates a uniquely named log in `dir`.
    pub async fn create_in(dir: &Path) -> MigrationResult<Self> {
        Self::create(dir.join(unresolved_file_name())).await
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Resources recorded so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub async fn record(&self, resource_type: &str, uuid: &str, references: &[String]) -> MigrationResult<()> {
        if references.is_empty() {
            return Ok(());
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        let joined = references.join(",");
        let (Some(file), Some(path)) = (&self.file, &self.path) else {
            info!(resource = %format!("{resource_type}/{uuid}"), references = %joined, "Unresolved references");
            return Ok(());
        };
        let line = format!("\t\"{resource_type}/{uuid}\": \"{joined}\",\n");
        file.lock()
            .await
            .write_all(line.as_bytes())
            .await
            .map_err(|source| io_error(path, source))
    }

    /// Closes the object and flushes the file.
    pub async fn finish(&self) -> MigrationResult<()> {
        let (Some(file), Some(path)) = (&self.file, &self.path) else {
            return Ok(());
        };
        let mut file = file.lock().await;
        file.write_all(b"}\n").await.map_err(|source| io_error(path, source))?;
        file.flush().await.map_err(|source| io_error(path, source))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> MigrationError {
    MigrationError::Io {
        path: path.display().to_string(),
        source,
    }
}
