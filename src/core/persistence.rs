//! Durable key/value storage behind the state containers.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CONVERSATIONS_KEY: &str = "conversation-storage";
pub const PROJECTS_KEY: &str = "projects-storage";
pub const SETTINGS_KEY: &str = "settings-storage";

/// File name of the process-wide store inside the data directory.
pub const STORE_FILE_NAME: &str = "splat.json";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to access store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode store contents: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to replace store at {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },

    #[error("store writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
    async fn remove_item(&self, key: &str) -> Result<(), PersistenceError>;
}

/// All keys in one JSON object on disk, rewritten atomically on every change.
///
/// The file is read lazily on first access. A missing file is an empty store;
/// an unreadable or corrupt one is logged and also treated as empty, so a bad
/// blob never keeps the client from starting.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Option<BTreeMap<String, String>>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_entries(&self) -> BTreeMap<String, String> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Store file does not exist yet");
                return BTreeMap::new();
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Failed to read store; starting empty");
                return BTreeMap::new();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Store file is corrupt; starting empty");
                BTreeMap::new()
            }
        }
    }

    /// Run `update` against the loaded entries and write the result back.
    async fn update<F>(&self, update: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_entries().await);
        }
        let Some(entries) = guard.as_mut() else {
            return Ok(());
        };
        update(entries);

        let contents = serde_json::to_string_pretty(&*entries)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &contents)).await??;
        Ok(())
    }
}

fn write_atomically(path: &Path, contents: &str) -> Result<(), PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());

    if let Some(dir) = parent {
        std::fs::create_dir_all(dir).map_err(io_err)?;
    }
    let mut temp_file = match parent {
        Some(dir) => NamedTempFile::new_in(dir),
        None => NamedTempFile::new(),
    }
    .map_err(io_err)?;

    temp_file.write_all(contents.as_bytes()).map_err(io_err)?;
    temp_file.as_file_mut().sync_all().map_err(io_err)?;
    temp_file
        .persist(path)
        .map_err(|source| PersistenceError::Persist {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

#[async_trait]
impl PersistenceAdapter for JsonFileStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_entries().await);
        }
        Ok(guard.as_ref().and_then(|entries| entries.get(key).cloned()))
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
        .await
    }

    async fn remove_item(&self, key: &str) -> Result<(), PersistenceError> {
        self.update(|entries| {
            entries.remove(key);
        })
        .await
    }
}

/// Volatile store for tests and `--ephemeral` sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: parking_lot::Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), PersistenceError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Prefixes every key as `{prefix}-{key}` so several clients can share one
/// backing store.
#[derive(Clone)]
pub struct Namespaced {
    prefix: String,
    inner: Arc<dyn PersistenceAdapter>,
}

impl Namespaced {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}-{}", self.prefix, key)
    }
}

#[async_trait]
impl PersistenceAdapter for Namespaced {
    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        self.inner.get_item(&self.key(key)).await
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.inner.set_item(&self.key(key), value).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), PersistenceError> {
        self.inner.remove_item(&self.key(key)).await
    }
}
