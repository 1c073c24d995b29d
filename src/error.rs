//! Crate-level error types for storage operations and queued transactor work.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Error returned by persistence backends, value stores, and log stores.
///
/// Environment failures ([`Io`](StorageError::Io), [`Json`](StorageError::Json))
/// are kept apart from caller misuse (exporting to a file, importing from a
/// directory, exporting nothing) so callers can tell the two apart.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be encoded or decoded.
    ///
    /// On load this means the entry is corrupt; the value is never
    /// partially returned.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Export was requested but nothing is stored under the key.
    #[error("there is no data to export")]
    NoDataToExport,

    /// Import was requested from a file that holds no data.
    #[error("there is no data to import")]
    NoDataToImport,

    /// Export target exists and is a file rather than a directory.
    #[error("attempted to export to a file instead of a directory: {}", .0.display())]
    AttemptToExportToFile(PathBuf),

    /// Import source is a directory rather than a file.
    #[error("attempted to import from a directory instead of a file: {}", .0.display())]
    AttemptToImportFromDir(PathBuf),

    /// A record with this id is already in the log.
    #[error("a record with id {0} already exists in the log")]
    DuplicateRecord(Uuid),
}

/// Error returned by operations that run through a transactor's commit queue.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The persist, truncate, or rebuild step failed.
    ///
    /// For a plain commit the published aggregate and the log are left
    /// exactly as they were before the attempt.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The persist step exceeded the configured commit timeout.
    ///
    /// The queue is aborted after this error, since the abandoned write
    /// may still complete.
    #[error("commit timed out after {0:?}")]
    TimedOut(Duration),

    /// The request was still queued when the queue was aborted.
    #[error("commit queue was aborted before this request ran")]
    Aborted,

    /// The queue worker has exited, so no further requests can run.
    #[error("transactor is no longer running")]
    TransactorGone,
}
