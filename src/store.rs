//! # Persistence — durable key→JSON store with typed repositories
//!
//! Entities are serialized as JSON under namespaced string keys
//! (`key_`, `incident_`, `audit_log_`, `consent_`, `pseudonym_`, ...).
//! The prefix convention is owned by [`Repository`]; callers never build
//! raw keys. Each write is atomic per key (temp file + rename).

use crate::error::AegisResult;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Flat key→JSON-string persistence collaborator.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> AegisResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AegisResult<()>;
    fn remove(&self, key: &str) -> AegisResult<bool>;
    fn list_keys(&self, prefix: &str) -> AegisResult<Vec<String>>;
}

/// In-memory store for tests and ephemeral runs.
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> AegisResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AegisResult<()> {
        self.entries.write().insert(key.into(), value.into());
        Ok(())
    }

    fn remove(&self, key: &str) -> AegisResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn list_keys(&self, prefix: &str) -> AegisResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// File-backed store: one file per key, hex-encoded key as file name so any
/// key string is a valid path. Writes go through a temp file and rename.
pub struct FileKvStore {
    base_dir: PathBuf,
}

impl FileKvStore {
    pub fn open(base_dir: impl Into<PathBuf>) -> AegisResult<Self> {
        let dir = base_dir.into();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "Key-value store opened");
        Ok(Self { base_dir: dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", hex::encode(key)))
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> AegisResult<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(&path)?))
    }

    fn set(&self, key: &str, value: &str) -> AegisResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> AegisResult<bool> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        Ok(true)
    }

    fn list_keys(&self, prefix: &str) -> AegisResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(raw) = hex::decode(stem) else { continue };
            let Ok(key) = String::from_utf8(raw) else { continue };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Typed view over a [`KvStore`] namespace. The prefix is an internal detail;
/// callers address entities by bare ID.
pub struct Repository<T> {
    store: Arc<dyn KvStore>,
    prefix: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Repository<T> {
    pub fn new(store: Arc<dyn KvStore>, prefix: &'static str) -> Self {
        Self { store, prefix, _marker: PhantomData }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn get(&self, id: &str) -> AegisResult<Option<T>> {
        match self.store.get(&self.key(id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, id: &str, value: &T) -> AegisResult<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(&self.key(id), &raw)
    }

    pub fn delete(&self, id: &str) -> AegisResult<bool> {
        self.store.remove(&self.key(id))
    }

    /// All IDs in this namespace, sorted.
    pub fn ids(&self) -> AegisResult<Vec<String>> {
        Ok(self
            .store
            .list_keys(self.prefix)?
            .into_iter()
            .map(|k| k[self.prefix.len()..].to_string())
            .collect())
    }

    /// All entities in this namespace. Unreadable entries are skipped;
    /// callers treat this as a scan, not a consistency check.
    pub fn all(&self) -> AegisResult<Vec<T>> {
        let mut out = Vec::new();
        for id in self.ids()? {
            if let Some(v) = self.get(&id)? {
                out.push(v);
            }
        }
        Ok(out)
    }
}
