//! Newest-first log of records kept as a single stored list.
//!
//! Every operation loads the whole list, edits it, and writes the whole list
//! back. That is O(n) per call and bounds the practical log size; it is meant
//! for personal-scale histories, not for write-ahead-log volumes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{Bytes, StorageLocation};
use crate::error::StorageError;
use crate::key::StorageKey;
use crate::transaction::Loggable;
use crate::value_store::{ValueStore, read_import_file};

/// Ordered, append-only store of [`Loggable`] records.
///
/// Index 0 is always the most recently appended record. Read-modify-write
/// operations on one `LogStore` are serialized, so concurrent appends never
/// lose each other.
///
/// Deleting the last remaining record removes the stored entry entirely, so
/// an emptied log and a never-written log look the same.
#[derive(Debug)]
pub struct LogStore<R: Loggable> {
    storage: ValueStore<Vec<R>>,
    writer: Mutex<()>,
}

impl<R: Loggable> LogStore<R> {
    /// Open the log stored under `key` in `namespace` at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if a durable namespace directory cannot
    /// be created.
    pub fn new(
        key: impl Into<String>,
        namespace: Option<&str>,
        cached: bool,
        location: &StorageLocation,
    ) -> Result<Self, StorageError> {
        Ok(Self::with_store(ValueStore::new(
            key, namespace, cached, location,
        )?))
    }

    /// Open the log addressed by a versioned [`StorageKey`].
    ///
    /// # Errors
    ///
    /// Same as [`new`](LogStore::new).
    pub fn from_storage_key(
        key: &StorageKey,
        cached: bool,
        location: &StorageLocation,
    ) -> Result<Self, StorageError> {
        Ok(Self::with_store(ValueStore::from_storage_key(
            key, cached, location,
        )?))
    }

    /// Wrap an existing value store.
    pub fn with_store(storage: ValueStore<Vec<R>>) -> Self {
        Self {
            storage,
            writer: Mutex::new(()),
        }
    }

    /// The key the log is stored under.
    pub fn key(&self) -> &str {
        self.storage.key()
    }

    /// The namespace the log lives in, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.storage.namespace()
    }

    async fn records(&self) -> Result<Vec<R>, StorageError> {
        Ok(self.storage.load().await?.unwrap_or_default())
    }

    /// Write `records` back, or delete the entry if none remain.
    async fn replace(&self, records: Vec<R>) -> Result<(), StorageError> {
        if records.is_empty() {
            self.storage.delete().await
        } else {
            self.storage.save(&records).await
        }
    }

    /// Prepend `record` to the log.
    ///
    /// # Errors
    ///
    /// * [`StorageError::DuplicateRecord`] -- a record with the same id is
    ///   already in the log; nothing is written.
    /// * Any backend error from the load or save.
    pub async fn append(&self, record: R) -> Result<(), StorageError> {
        let _writer = self.writer.lock().await;
        let mut records = self.records().await?;

        let id = record.id();
        if records.iter().any(|r| r.id() == id) {
            return Err(StorageError::DuplicateRecord(id));
        }

        records.insert(0, record);
        self.storage.save(&records).await?;

        tracing::debug!(key = self.storage.key(), %id, len = records.len(), "record appended");
        Ok(())
    }

    /// Every record, newest first.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the log cannot be read or decoded.
    pub async fn load(&self) -> Result<Vec<R>, StorageError> {
        self.records().await
    }

    /// The `count` most recent records, or every record when `count` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the log cannot be read or decoded.
    pub async fn load_last(&self, count: Option<usize>) -> Result<Vec<R>, StorageError> {
        let mut records = self.records().await?;
        if let Some(count) = count {
            records.truncate(count);
        }
        Ok(records)
    }

    /// Records from the most recent back to and including `id`.
    ///
    /// Empty if no record has that id.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the log cannot be read or decoded.
    pub async fn load_from(&self, id: Uuid) -> Result<Vec<R>, StorageError> {
        let mut records = self.records().await?;
        match records.iter().position(|r| r.id() == id) {
            Some(index) => {
                records.truncate(index + 1);
                Ok(records)
            }
            None => Ok(Vec::new()),
        }
    }

    /// The longest run of most recent records whose timestamp is at or after
    /// `since`. Stops at the first strictly older record.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the log cannot be read or decoded.
    pub async fn load_since(&self, since: DateTime<Utc>) -> Result<Vec<R>, StorageError> {
        let mut records = self.records().await?;
        if let Some(index) = records.iter().position(|r| r.timestamp() < since) {
            records.truncate(index);
        }
        Ok(records)
    }

    /// Remove the `count` most recent records.
    ///
    /// `None`, or a count covering the whole log, clears it.
    ///
    /// # Errors
    ///
    /// Returns the backend's error from the load, save, or delete.
    pub async fn delete_last(&self, count: Option<usize>) -> Result<(), StorageError> {
        let _writer = self.writer.lock().await;
        let records = self.records().await?;

        match count {
            Some(0) => Ok(()),
            Some(count) if count < records.len() => {
                self.replace(records.into_iter().skip(count).collect())
                    .await
            }
            _ => self.storage.delete().await,
        }
    }

    /// Remove the record with `id` and every record newer than it.
    ///
    /// Only strictly older records survive. No-op if `id` is not found.
    ///
    /// # Errors
    ///
    /// Returns the backend's error from the load, save, or delete.
    pub async fn delete_including(&self, id: Uuid) -> Result<(), StorageError> {
        let _writer = self.writer.lock().await;
        let records = self.records().await?;

        match records.iter().position(|r| r.id() == id) {
            Some(index) => {
                self.replace(records.into_iter().skip(index + 1).collect())
                    .await
            }
            None => Ok(()),
        }
    }

    /// Remove every record newer than the one with `id`, keeping it.
    ///
    /// No-op if `id` is not found.
    ///
    /// # Errors
    ///
    /// Returns the backend's error from the load or save.
    pub async fn delete_after(&self, id: Uuid) -> Result<(), StorageError> {
        let _writer = self.writer.lock().await;
        let records = self.records().await?;

        match records.iter().position(|r| r.id() == id) {
            Some(0) | None => Ok(()),
            Some(index) => self.replace(records.into_iter().skip(index).collect()).await,
        }
    }

    /// Remove every record whose timestamp is at or after `since`.
    ///
    /// Afterwards [`load`](LogStore::load) returns exactly what
    /// [`load_since`](LogStore::load_since) would have excluded.
    ///
    /// # Errors
    ///
    /// Returns the backend's error from the load, save, or delete.
    pub async fn delete_since(&self, since: DateTime<Utc>) -> Result<(), StorageError> {
        let _writer = self.writer.lock().await;
        let records = self.records().await?;

        match records.iter().position(|r| r.timestamp() < since) {
            Some(0) => Ok(()),
            Some(index) => self.replace(records.into_iter().skip(index).collect()).await,
            None => self.storage.delete().await,
        }
    }

    /// Logical and allocated byte size of the stored log.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn size_and_allocated_size(&self) -> Result<(Bytes, Bytes), StorageError> {
        self.storage.size_and_allocated_size().await
    }

    /// Export the whole log as JSON into `dir`.
    ///
    /// # Errors
    ///
    /// See [`ValueStore::export_data`].
    pub async fn export_data(&self, dir: &Path) -> Result<PathBuf, StorageError> {
        self.storage.export_data(dir).await
    }

    /// Replace the whole log with the one in `file`.
    ///
    /// An imported empty list clears the log.
    ///
    /// # Errors
    ///
    /// * [`StorageError::DuplicateRecord`] -- two imported records share an
    ///   id; nothing is written.
    /// * Otherwise as for [`ValueStore::import_data`].
    pub async fn import_data(&self, file: &Path) -> Result<(), StorageError> {
        let records: Vec<R> = read_import_file(file).await?;

        let mut seen = HashSet::with_capacity(records.len());
        if let Some(duplicate) = records.iter().map(Loggable::id).find(|id| !seen.insert(*id)) {
            return Err(StorageError::DuplicateRecord(duplicate));
        }

        let _writer = self.writer.lock().await;
        let count = records.len();
        self.replace(records).await?;
        tracing::info!(key = self.storage.key(), count, path = %file.display(), "log imported");
        Ok(())
    }
}
