//! Subscription index persistence
//!
//! The index maps every durable subscription id to its topic so the
//! subscriptions can be re-created after a restart. It is rewritten
//! wholesale on every create and delete.

use crate::error::{EventError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the index inside the subscription directory
pub const INDEX_FILE: &str = "index.json";

/// Trait for persisting the subscription index
pub trait IndexStore: Send + Sync {
    /// Replace the persisted index with `subscriptions` (sub id → topic)
    fn save(&self, subscriptions: &BTreeMap<String, String>) -> Result<()>;

    /// Load the persisted index
    fn load(&self) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriptionIndex {
    #[serde(default)]
    subscriptions: BTreeMap<String, String>,
}

/// JSON file-based index store
///
/// Writes go to a temp file that is synced and renamed over the index.
/// A missing, empty or unparsable index loads as empty.
pub struct FileIndexStore {
    path: PathBuf,
}

impl FileIndexStore {
    /// Create a new file index store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Index store for `index.json` inside a subscription directory
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(INDEX_FILE))
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IndexStore for FileIndexStore {
    fn save(&self, subscriptions: &BTreeMap<String, String>) -> Result<()> {
        let index = SubscriptionIndex {
            subscriptions: subscriptions.clone(),
        };
        let json = serde_json::to_vec(&index)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EventError::log_io(parent, e))?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp =
            std::fs::File::create(&tmp_path).map_err(|e| EventError::log_io(&tmp_path, e))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.sync_all())
            .map_err(|e| EventError::log_io(&tmp_path, e))?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.path).map_err(|e| EventError::log_io(&self.path, e))?;

        tracing::debug!(
            path = %self.path.display(),
            count = subscriptions.len(),
            "Subscription index saved"
        );
        Ok(())
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(EventError::log_io(&self.path, e)),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            tracing::warn!(path = %self.path.display(), "Subscription index is empty");
            return Ok(BTreeMap::new());
        }

        // invalid UTF-8 is reported by the parser like any other corruption
        let index: SubscriptionIndex = match serde_json::from_slice(&raw) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Subscription index is corrupt, starting empty"
                );
                return Ok(BTreeMap::new());
            }
        };

        tracing::debug!(
            path = %self.path.display(),
            count = index.subscriptions.len(),
            "Subscription index loaded"
        );
        Ok(index.subscriptions)
    }
}

/// In-memory index store for testing
#[derive(Default)]
pub struct MemoryIndexStore {
    state: std::sync::RwLock<BTreeMap<String, String>>,
}

impl IndexStore for MemoryIndexStore {
    fn save(&self, subscriptions: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = subscriptions.clone();
        Ok(())
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("analyst".to_string(), "market.*".to_string());
        map.insert("monitor".to_string(), "*.error".to_string());
        map
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("a3s-pubsub-index-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_memory_store_save_load() {
        let store = MemoryIndexStore::default();
        assert!(store.load().unwrap().is_empty());

        store.save(&sample()).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["analyst"], "market.*");
    }

    #[test]
    fn test_memory_store_overwrite() {
        let store = MemoryIndexStore::default();
        store.save(&sample()).unwrap();

        let mut updated = BTreeMap::new();
        updated.insert("new-sub".to_string(), "events".to_string());
        store.save(&updated).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("new-sub"));
    }

    #[test]
    fn test_file_store_format() {
        let dir = temp_dir();
        let store = FileIndexStore::in_dir(&dir);
        store.save(&sample()).unwrap();

        let content = std::fs::read_to_string(dir.join("index.json")).unwrap();
        assert_eq!(
            content,
            r#"{"subscriptions":{"analyst":"market.*","monitor":"*.error"}}"#
        );
        assert!(!dir.join("index.tmp").exists());
        assert_eq!(store.load().unwrap(), sample());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_load_nonexistent() {
        let store = FileIndexStore::new(temp_dir().join("index.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_empty_or_corrupt() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let store = FileIndexStore::in_dir(&dir);

        std::fs::write(store.path(), "").unwrap();
        assert!(store.load().unwrap().is_empty());

        std::fs::write(store.path(), "{\"subscriptions\": {").unwrap();
        assert!(store.load().unwrap().is_empty());

        std::fs::write(store.path(), "{}").unwrap();
        assert!(store.load().unwrap().is_empty());

        std::fs::write(store.path(), [0xff, 0xfe, 0x00, b'{']).unwrap();
        assert!(store.load().unwrap().is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_creates_parent_dirs() {
        let root = temp_dir();
        let store = FileIndexStore::in_dir(root.join("nested/deep"));
        store.save(&BTreeMap::new()).unwrap();
        assert!(store.path().exists());

        std::fs::remove_dir_all(&root).unwrap();
    }
}
