//! Versioned storage keys.

use serde::{Deserialize, Serialize};

/// A namespaced, versioned logical key.
///
/// Collapses to the physical key `"{key}-{version}"`. Bumping `version` is
/// how a stored schema migrates: the new version reads and writes a fresh
/// entry while the old one stays untouched beside it.
///
/// # Examples
///
/// ```
/// use foldlog::StorageKey;
///
/// let key = StorageKey::new("reviews", 2).with_namespace("deck-7");
/// assert_eq!(key.physical_key(), "reviews-2");
/// assert_eq!(key.namespace(), Some("deck-7"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    namespace: Option<String>,
    key: String,
    version: u32,
}

impl StorageKey {
    /// Create a key with no namespace.
    pub fn new(key: impl Into<String>, version: u32) -> Self {
        Self {
            namespace: None,
            key: key.into(),
            version,
        }
    }

    /// Place the key in `namespace`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// The namespace, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The human-readable part of the key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The schema version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The single physical key this collapses to.
    pub fn physical_key(&self) -> String {
        format!("{}-{}", self.key, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_key_joins_key_and_version() {
        assert_eq!(StorageKey::new("cards", 1).physical_key(), "cards-1");
        assert_eq!(StorageKey::new("cards", 12).physical_key(), "cards-12");
    }

    #[test]
    fn versions_are_distinct_keys() {
        let v1 = StorageKey::new("cards", 1);
        let v2 = StorageKey::new("cards", 2);
        assert_ne!(v1.physical_key(), v2.physical_key());
        assert_ne!(v1, v2);
    }

    #[test]
    fn namespace_is_optional() {
        assert_eq!(StorageKey::new("k", 0).namespace(), None);
        assert_eq!(
            StorageKey::new("k", 0).with_namespace("ns").namespace(),
            Some("ns")
        );
    }
}
