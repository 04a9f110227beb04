//! Durable storage for the offline queue.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::offline::QueuedAction;

/// Key/value persistence for the whole queue.
pub trait QueuePersistence: Send + Sync {
    fn load(&self) -> Result<Vec<QueuedAction>>;
    fn save(&self, actions: &[QueuedAction]) -> Result<()>;
}

// == JSON File ==
/// Stores the queue as one JSON document, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where an unreadable queue file is moved before the queue starts over.
    pub fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        PathBuf::from(name)
    }
}

impl QueuePersistence for JsonFilePersistence {
    fn load(&self) -> Result<Vec<QueuedAction>> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                let aside = self.corrupt_path();
                match fs::rename(&self.path, &aside) {
                    Ok(()) => warn!(path = %aside.display(), "corrupt queue file moved aside"),
                    Err(err) => warn!(path = %self.path.display(), error = %err, "could not move corrupt queue file"),
                }
                SyncError::Persistence(format!("corrupt queue file: {}", e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(SyncError::Persistence(e.to_string())),
        }
    }

    fn save(&self, actions: &[QueuedAction]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(actions)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| SyncError::Persistence(e.to_string()))?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| SyncError::Persistence(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| SyncError::Persistence(e.to_string()))
    }
}

// == In Memory ==
/// Keeps the serialized queue in memory. Clones share storage, so a new
/// queue built from a clone sees what the old one saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    document: Arc<Mutex<Option<String>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later save fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn saved_len(&self) -> usize {
        self.load().map(|actions| actions.len()).unwrap_or(0)
    }
}

impl QueuePersistence for MemoryPersistence {
    fn load(&self) -> Result<Vec<QueuedAction>> {
        match self.document.lock().as_deref() {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, actions: &[QueuedAction]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Persistence("storage unavailable".to_string()));
        }
        *self.document.lock() = Some(serde_json::to_string(actions)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::ActionKind;
    use crate::transport::Method;
    use serde_json::json;

    fn action(id: &str) -> QueuedAction {
        QueuedAction::new(
            ActionKind::Update,
            "client",
            Some(id.to_string()),
            Method::Patch,
            format!("/clients/{}", id),
            json!({"name": id}),
        )
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("queue").join("actions.json"));
        assert!(store.load().unwrap().is_empty());

        let actions = vec![action("1"), action("2")];
        store.save(&actions).unwrap();
        assert_eq!(store.load().unwrap(), actions);
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_json_file_corrupt_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.json");
        fs::write(&path, b"{not json").unwrap();
        let store = JsonFilePersistence::new(path.clone());
        let result = store.load();
        assert!(matches!(result, Err(SyncError::Persistence(_))));

        // The unreadable file is kept aside, not overwritten by the next save.
        assert!(!path.exists());
        assert_eq!(fs::read(store.corrupt_path()).unwrap(), b"{not json");
        store.save(&[action("1")]).unwrap();
        assert_eq!(fs::read(store.corrupt_path()).unwrap(), b"{not json");
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_clones_share_storage() {
        let original = MemoryPersistence::new();
        let reopened = original.clone();
        original.save(&[action("1")]).unwrap();
        assert_eq!(reopened.load().unwrap().len(), 1);

        original.set_failing(true);
        assert!(matches!(
            original.save(&[]),
            Err(SyncError::Persistence(_))
        ));
        assert_eq!(reopened.saved_len(), 1);
    }
}
