//! Volatile in-process backend.
//!
//! Values live in a [`MemoryTable`] that the caller creates and passes
//! around explicitly. Every handle cloned from one table observes every
//! write immediately; the namespace is the only isolation between stores
//! sharing a table.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::backend::{Bytes, Storable, StorageBackend};
use crate::error::StorageError;

/// Shared in-process table keyed by `(namespace, key)`.
///
/// Values are held as `serde_json::Value`, which lets one table serve
/// stores of different value types and makes encode/decode failures
/// surface the same way they would on disk. Cloning is cheap and shares
/// the underlying map. Access to different keys does not contend on a
/// single lock.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    entries: Arc<DashMap<(String, String), serde_json::Value>>,
}

impl MemoryTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all namespaces.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry in every namespace.
    pub fn wipe(&self) {
        self.entries.clear();
    }
}

/// [`StorageBackend`] over a [`MemoryTable`] namespace.
///
/// Reports zero for both size accessors.
pub struct MemoryBackend<V> {
    table: MemoryTable,
    namespace: String,
    _value: PhantomData<fn() -> V>,
}

impl<V> MemoryBackend<V> {
    /// Create a backend over `table`. `None` maps to the empty namespace.
    pub fn new(table: &MemoryTable, namespace: Option<&str>) -> Self {
        Self {
            table: table.clone(),
            namespace: namespace.unwrap_or_default().to_owned(),
            _value: PhantomData,
        }
    }

    fn entry_key(&self, key: &str) -> (String, String) {
        (self.namespace.clone(), key.to_owned())
    }
}

impl<V> std::fmt::Debug for MemoryBackend<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[async_trait]
impl<V: Storable> StorageBackend<V> for MemoryBackend<V> {
    async fn save(&self, key: &str, value: &V) -> Result<(), StorageError> {
        let encoded = serde_json::to_value(value)?;
        self.table.entries.insert(self.entry_key(key), encoded);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<V>, StorageError> {
        // Clone out of the map so the shard guard is released before decoding.
        let stored = self
            .table
            .entries
            .get(&self.entry_key(key))
            .map(|entry| entry.value().clone());

        match stored {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.table.entries.remove(&self.entry_key(key));
        Ok(())
    }

    async fn size(&self, _key: &str) -> Result<Bytes, StorageError> {
        Ok(0)
    }

    async fn allocated_size(&self, _key: &str) -> Result<Bytes, StorageError> {
        Ok(0)
    }
}
