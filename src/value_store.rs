//! Single-key typed persistence with an optional write-through cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::backend::{Bytes, Storable, StorageBackend, StorageLocation};
use crate::error::StorageError;
use crate::file::JsonFileBackend;
use crate::key::StorageKey;

/// Stores one value of type `V` under one logical key.
///
/// With caching enabled, successful saves and read-through loads keep an
/// in-memory copy, and later loads are served from it. Every operation
/// holds the store's mutex across its backend I/O, so the cached copy
/// always matches the last completed write and a failed write never
/// touches it.
pub struct ValueStore<V: Storable> {
    key: String,
    namespace: Option<String>,
    cached: bool,
    backend: Arc<dyn StorageBackend<V>>,
    cache: Mutex<Option<V>>,
}

impl<V: Storable> std::fmt::Debug for ValueStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStore")
            .field("key", &self.key)
            .field("namespace", &self.namespace)
            .field("cached", &self.cached)
            .finish()
    }
}

impl<V: Storable> ValueStore<V> {
    /// Open a store for `key` in `namespace` at `location`.
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
        let backend = location.backend::<V>(namespace)?;
        Ok(Self::with_backend(
            key,
            namespace.map(str::to_owned),
            cached,
            backend,
        ))
    }

    /// Open a store addressed by a versioned [`StorageKey`].
    ///
    /// # Errors
    ///
    /// Same as [`new`](ValueStore::new).
    pub fn from_storage_key(
        key: &StorageKey,
        cached: bool,
        location: &StorageLocation,
    ) -> Result<Self, StorageError> {
        Self::new(key.physical_key(), key.namespace(), cached, location)
    }

    /// Wrap an existing backend.
    ///
    /// `namespace` is only used to place exported files; the backend is
    /// expected to already be scoped to it.
    pub fn with_backend(
        key: impl Into<String>,
        namespace: Option<String>,
        cached: bool,
        backend: Arc<dyn StorageBackend<V>>,
    ) -> Self {
        Self {
            key: key.into(),
            namespace,
            cached,
            backend,
            cache: Mutex::new(None),
        }
    }

    /// The physical key this store writes under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The namespace, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Persist `value`, replacing whatever was stored.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; the cache is left untouched.
    pub async fn save(&self, value: &V) -> Result<(), StorageError> {
        let mut cache = self.cache.lock().await;
        self.backend.save(&self.key, value).await?;
        if self.cached {
            *cache = Some(value.clone());
        }
        Ok(())
    }

    /// Load the stored value, or `None` if nothing has been saved.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the entry cannot be read or decoded.
    pub async fn load(&self) -> Result<Option<V>, StorageError> {
        let mut cache = self.cache.lock().await;
        if self.cached
            && let Some(value) = cache.as_ref()
        {
            return Ok(Some(value.clone()));
        }

        let loaded = self.backend.load(&self.key).await?;
        if self.cached {
            *cache = loaded.clone();
        }
        Ok(loaded)
    }

    /// Remove the stored value and clear the cache.
    ///
    /// # Errors
    ///
    /// Returns the backend's error. Deleting an absent value is not an error.
    pub async fn delete(&self) -> Result<(), StorageError> {
        let mut cache = self.cache.lock().await;
        self.backend.delete(&self.key).await?;
        *cache = None;
        Ok(())
    }

    /// Logical and allocated byte size of the stored value.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn size_and_allocated_size(&self) -> Result<(Bytes, Bytes), StorageError> {
        self.backend.size_and_allocated_size(&self.key).await
    }

    /// Write the stored value as JSON into `dir`, under the same namespace
    /// and key layout a durable backend rooted at `dir` would use.
    ///
    /// `dir` is created if it does not exist.
    ///
    /// # Returns
    ///
    /// The path of the exported file.
    ///
    /// # Errors
    ///
    /// * [`StorageError::AttemptToExportToFile`] -- `dir` is an existing file.
    /// * [`StorageError::NoDataToExport`] -- nothing is stored.
    /// * [`StorageError::Io`] / [`StorageError::Json`] -- the read or write failed.
    pub async fn export_data(&self, dir: &Path) -> Result<PathBuf, StorageError> {
        if tokio::fs::metadata(dir)
            .await
            .is_ok_and(|meta| !meta.is_dir())
        {
            return Err(StorageError::AttemptToExportToFile(dir.to_owned()));
        }

        let _guard = self.cache.lock().await;
        let value = self
            .backend
            .load(&self.key)
            .await?
            .ok_or(StorageError::NoDataToExport)?;

        let target = JsonFileBackend::<V>::create(dir, self.namespace.as_deref()).await?;
        target.save(&self.key, &value).await?;

        let path = target.path_for(&self.key);
        tracing::info!(key = %self.key, path = %path.display(), "value exported");
        Ok(path)
    }

    /// Replace the stored value with the JSON value in `file`.
    ///
    /// # Errors
    ///
    /// * [`StorageError::AttemptToImportFromDir`] -- `file` is a directory.
    /// * [`StorageError::NoDataToImport`] -- `file` is empty.
    /// * [`StorageError::Io`] / [`StorageError::Json`] -- the read, decode, or
    ///   save failed. The current value is kept in that case.
    pub async fn import_data(&self, file: &Path) -> Result<(), StorageError> {
        let value: V = read_import_file(file).await?;

        self.save(&value).await?;
        tracing::info!(key = %self.key, path = %file.display(), "value imported");
        Ok(())
    }
}

/// Read and decode the JSON value held in `file`.
///
/// # Errors
///
/// * [`StorageError::AttemptToImportFromDir`] -- `file` is a directory.
/// * [`StorageError::NoDataToImport`] -- `file` is empty.
/// * [`StorageError::Io`] / [`StorageError::Json`] -- the read or decode
///   failed.
pub(crate) async fn read_import_file<V: DeserializeOwned>(file: &Path) -> Result<V, StorageError> {
    if tokio::fs::metadata(file).await?.is_dir() {
        return Err(StorageError::AttemptToImportFromDir(file.to_owned()));
    }

    let bytes = tokio::fs::read(file).await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(StorageError::NoDataToImport);
    }
    Ok(serde_json::from_slice(&bytes)?)
}
