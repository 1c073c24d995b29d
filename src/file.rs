//! Durable JSON-file backend.
//!
//! Each key is stored as its own file:
//! ```text
//! <root>/
//!     <namespace>/                     -- omitted when no namespace is given
//!         <key>_<TypeName>.json
//! ```
//!
//! Namespace, key, and type name all pass through [`sanitize`] so they are
//! safe as path components. Writes go to a `.json.tmp` sibling that is then
//! renamed over the target, so readers never see a half-written file.

use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::backend::{Bytes, Storable, StorageBackend};
use crate::error::StorageError;

/// Longest sanitized path component, in characters.
const MAX_COMPONENT_LEN: usize = 255;

/// Reduce `raw` to a safe path component.
///
/// Keeps alphanumerics, `_`, and `-`, drops everything else, and truncates
/// to 255 characters.
///
/// # Examples
///
/// ```
/// use foldlog::sanitize;
///
/// assert_eq!(sanitize("notes/2024: draft"), "notes2024draft");
/// assert_eq!(sanitize("log_v-2"), "log_v-2");
/// ```
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_COMPONENT_LEN)
        .collect()
}

/// Rust type name of `V` with module paths removed, e.g.
/// `Vec<Transaction<String>>`.
fn short_type_name<V>() -> String {
    let full = std::any::type_name::<V>();
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();

    for c in full.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            segment.push(c);
        } else {
            out.push_str(segment.rsplit("::").next().unwrap_or_default());
            segment.clear();
            out.push(c);
        }
    }
    out.push_str(segment.rsplit("::").next().unwrap_or_default());
    out
}

/// [`StorageBackend`] storing one JSON file per key.
pub struct JsonFileBackend<V> {
    dir: PathBuf,
    type_tag: String,
    _value: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for JsonFileBackend<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileBackend")
            .field("dir", &self.dir)
            .field("type_tag", &self.type_tag)
            .finish()
    }
}

impl<V> JsonFileBackend<V> {
    /// Create a backend rooted at `root`, creating the namespace directory
    /// if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the directory cannot be created.
    pub fn new(root: impl AsRef<Path>, namespace: Option<&str>) -> io::Result<Self> {
        let backend = Self::layout(root.as_ref(), namespace);
        std::fs::create_dir_all(&backend.dir)?;
        Ok(backend)
    }

    /// Same as [`new`](JsonFileBackend::new), creating the directory through
    /// `tokio::fs` for use inside async code.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the directory cannot be created.
    pub async fn create(root: impl AsRef<Path>, namespace: Option<&str>) -> io::Result<Self> {
        let backend = Self::layout(root.as_ref(), namespace);
        tokio::fs::create_dir_all(&backend.dir).await?;
        Ok(backend)
    }

    fn layout(root: &Path, namespace: Option<&str>) -> Self {
        let mut dir = root.to_owned();
        if let Some(namespace) = namespace {
            dir.push(sanitize(namespace));
        }

        Self {
            dir,
            type_tag: sanitize(&short_type_name::<V>()),
            _value: PhantomData,
        }
    }

    /// Directory holding this backend's files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path used for `key`.
    ///
    /// `<dir>/<sanitized key>_<TypeName>.json`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}.json", sanitize(key), self.type_tag))
    }

    /// Lists the sanitized keys that currently have a file for this value
    /// type, sorted.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading the directory fails for a reason other
    /// than the directory not existing.
    pub fn stored_keys(&self) -> io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let suffix = format!("_{}.json", self.type_tag);
        let mut keys: Vec<String> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                if !entry.file_type().ok()?.is_file() {
                    return None;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(&suffix).map(str::to_owned)
            })
            .collect();

        keys.sort();
        Ok(keys)
    }
}

/// Metadata for `path`, or `None` if it does not exist.
async fn metadata_if_exists(path: &Path) -> io::Result<Option<std::fs::Metadata>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn allocated_bytes(meta: &std::fs::Metadata) -> Bytes {
    use std::os::unix::fs::MetadataExt;
    meta.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_bytes(meta: &std::fs::Metadata) -> Bytes {
    meta.len()
}

#[async_trait]
impl<V: Storable> StorageBackend<V> for JsonFileBackend<V> {
    async fn save(&self, key: &str, value: &V) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec(value)?;

        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::debug!(path = %path.display(), bytes = json.len(), "value saved");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<V>, StorageError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "value deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn size(&self, key: &str) -> Result<Bytes, StorageError> {
        let meta = metadata_if_exists(&self.path_for(key)).await?;
        Ok(meta.filter(|m| m.is_file()).map_or(0, |m| m.len()))
    }

    async fn allocated_size(&self, key: &str) -> Result<Bytes, StorageError> {
        let meta = metadata_if_exists(&self.path_for(key)).await?;
        Ok(meta.filter(|m| m.is_file()).map_or(0, |m| allocated_bytes(&m)))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    use super::*;
    use crate::transaction::Transaction;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        volume: u8,
    }

    #[test]
    fn sanitize_strips_disallowed_characters() {
        assert_eq!(sanitize("a/b\\c..d e"), "abcde");
        assert_eq!(sanitize("keep_this-one"), "keep_this-one");
        assert_eq!(sanitize("ünïcode"), "ünïcode");
    }

    #[test]
    fn sanitize_truncates_long_input() {
        let long = "x".repeat(400);
        assert_eq!(sanitize(&long).chars().count(), 255);
    }

    #[test]
    fn short_type_name_drops_module_paths() {
        assert_eq!(short_type_name::<String>(), "String");
        assert_eq!(
            short_type_name::<Vec<Transaction<String>>>(),
            "Vec<Transaction<String>>"
        );
    }

    #[test]
    fn path_layout_includes_namespace_key_and_type() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let backend = JsonFileBackend::<Vec<Transaction<String>>>::new(tmp.path(), Some("deck/1"))
            .expect("backend should build");

        assert_eq!(backend.dir(), tmp.path().join("deck1"));
        assert_eq!(
            backend.path_for("log-2"),
            tmp.path().join("deck1/log-2_VecTransactionString.json")
        );
    }

    #[test]
    fn no_namespace_writes_into_root() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let backend =
            JsonFileBackend::<Settings>::new(tmp.path(), None).expect("backend should build");

        assert_eq!(
            backend.path_for("prefs"),
            tmp.path().join("prefs_Settings.json")
        );
    }

    #[tokio::test]
    async fn save_load_delete_cycle() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let backend =
            JsonFileBackend::<Settings>::new(tmp.path(), Some("app")).expect("backend");

        backend
            .save("prefs", &Settings { volume: 3 })
            .await
            .expect("save should succeed");
        assert!(backend.path_for("prefs").is_file());
        assert!(
            !backend.path_for("prefs").with_extension("json.tmp").exists(),
            "temp file should be renamed away"
        );

        let loaded = backend.load("prefs").await.expect("load should succeed");
        assert_eq!(loaded, Some(Settings { volume: 3 }));

        backend.delete("prefs").await.expect("delete should succeed");
        assert_eq!(backend.load("prefs").await.expect("load"), None);
    }

    #[tokio::test]
    async fn delete_absent_key_is_not_an_error() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let backend = JsonFileBackend::<Settings>::new(tmp.path(), None).expect("backend");

        backend
            .delete("never-written")
            .await
            .expect("deleting an absent key should succeed");
    }

    #[tokio::test]
    async fn corrupt_file_is_a_json_error() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let backend = JsonFileBackend::<Settings>::new(tmp.path(), None).expect("backend");
        std::fs::write(backend.path_for("prefs"), b"{not json").expect("write");

        let result = backend.load("prefs").await;
        assert!(
            matches!(result, Err(StorageError::Json(_))),
            "expected Json error, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn sizes_reflect_file_on_disk() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let backend = JsonFileBackend::<Settings>::new(tmp.path(), None).expect("backend");

        assert_eq!(backend.size("prefs").await.expect("size"), 0);

        backend
            .save("prefs", &Settings { volume: 9 })
            .await
            .expect("save");
        let expected = std::fs::metadata(backend.path_for("prefs"))
            .expect("metadata")
            .len();

        let (size, allocated) = backend
            .size_and_allocated_size("prefs")
            .await
            .expect("sizes");
        assert_eq!(size, expected);
        assert!(allocated >= size || allocated == 0);
    }

    #[tokio::test]
    async fn stored_keys_lists_only_this_value_type() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let settings = JsonFileBackend::<Settings>::new(tmp.path(), None).expect("backend");
        let strings = JsonFileBackend::<String>::new(tmp.path(), None).expect("backend");

        settings
            .save("b", &Settings { volume: 1 })
            .await
            .expect("save");
        settings
            .save("a", &Settings { volume: 2 })
            .await
            .expect("save");
        strings.save("c", &"text".to_owned()).await.expect("save");

        assert_eq!(settings.stored_keys().expect("list"), vec!["a", "b"]);
        assert_eq!(strings.stored_keys().expect("list"), vec!["c"]);
    }

    #[tokio::test]
    async fn create_builds_nested_namespace_dir() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let root = tmp.path().join("export").join("nested");

        let backend = JsonFileBackend::<Settings>::create(&root, Some("app"))
            .await
            .expect("backend should build");

        assert!(root.join("app").is_dir());
        assert_eq!(backend.dir(), root.join("app"));
    }
}
