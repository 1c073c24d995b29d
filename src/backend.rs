//! Persistence backend trait and backend selection.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::StorageError;
use crate::file::JsonFileBackend;
use crate::memory::{MemoryBackend, MemoryTable};

/// Byte count reported by [`StorageBackend::size`] and friends.
pub type Bytes = u64;

/// Bounds every persisted value must satisfy.
///
/// Blanket-implemented for any `Serialize + DeserializeOwned + Clone + Send +
/// Sync + 'static` type, so it never needs a manual impl.
pub trait Storable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Storable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A key-addressed store of values of type `V`.
///
/// # Contract
///
/// - [`load`](StorageBackend::load) returns `Ok(None)` when nothing is stored
///   under the key and an error when the entry exists but cannot be read or
///   decoded.
/// - [`delete`](StorageBackend::delete) is idempotent: deleting an absent key
///   succeeds.
/// - Distinct keys are independent; concurrent access to one key from two
///   unrelated owners is not supported.
#[async_trait]
pub trait StorageBackend<V: Storable>: Send + Sync {
    /// Persist `value` under `key`, replacing any previous value.
    async fn save(&self, key: &str, value: &V) -> Result<(), StorageError>;

    /// Load the value stored under `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<V>, StorageError>;

    /// Remove the value stored under `key`.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Logical size in bytes of the value stored under `key`.
    async fn size(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Bytes actually allocated for the value stored under `key`.
    async fn allocated_size(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Both [`size`](StorageBackend::size) and
    /// [`allocated_size`](StorageBackend::allocated_size) in one call.
    async fn size_and_allocated_size(&self, key: &str) -> Result<(Bytes, Bytes), StorageError> {
        Ok((self.size(key).await?, self.allocated_size(key).await?))
    }
}

/// Where a store keeps its data.
///
/// `Durable` stores one JSON file per key under `root`; `Volatile` keeps
/// values in a shared in-process [`MemoryTable`]. Cloning a `Volatile`
/// location shares the table.
#[derive(Debug, Clone)]
pub enum StorageLocation {
    /// JSON files under this root directory.
    Durable {
        /// Root directory; namespaces become subdirectories.
        root: PathBuf,
    },
    /// Entries in an in-process table.
    Volatile(MemoryTable),
}

impl StorageLocation {
    /// A durable location rooted at `root`.
    pub fn durable(root: impl Into<PathBuf>) -> Self {
        Self::Durable { root: root.into() }
    }

    /// A volatile location backed by `table`.
    pub fn volatile(table: &MemoryTable) -> Self {
        Self::Volatile(table.clone())
    }

    /// Build a backend for values of type `V` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the durable namespace directory cannot
    /// be created.
    pub fn backend<V: Storable>(
        &self,
        namespace: Option<&str>,
    ) -> Result<Arc<dyn StorageBackend<V>>, StorageError> {
        match self {
            Self::Durable { root } => Ok(Arc::new(JsonFileBackend::<V>::new(root, namespace)?)),
            Self::Volatile(table) => Ok(Arc::new(MemoryBackend::<V>::new(table, namespace))),
        }
    }
}


#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn durable_location_creates_namespace_dir() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let location = StorageLocation::durable(tmp.path());

        let backend = location
            .backend::<u32>(Some("scores"))
            .expect("backend should build");
        backend.save("k", &7).await.expect("save should succeed");

        assert!(tmp.path().join("scores").is_dir());
        assert_eq!(backend.load("k").await.expect("load"), Some(7));
    }

    #[tokio::test]
    async fn volatile_locations_share_one_table() {
        let table = MemoryTable::new();
        let a = StorageLocation::volatile(&table)
            .backend::<String>(Some("ns"))
            .expect("backend should build");
        let b = StorageLocation::volatile(&table)
            .backend::<String>(Some("ns"))
            .expect("backend should build");

        a.save("greeting", &"hi".to_owned()).await.expect("save");
        assert_eq!(
            b.load("greeting").await.expect("load"),
            Some("hi".to_owned())
        );
    }

    #[tokio::test]
    async fn default_size_and_allocated_size_combines_both() {
        let table = MemoryTable::new();
        let backend = StorageLocation::volatile(&table)
            .backend::<u8>(None)
            .expect("backend should build");
        backend.save("k", &1).await.expect("save");

        let sizes = backend
            .size_and_allocated_size("k")
            .await
            .expect("sizes should succeed");
        assert_eq!(sizes, (0, 0));
    }
}
