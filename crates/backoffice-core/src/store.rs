//! Persisted key/value storage for session data.
//!
//! The session layer only talks to [`PersistedStore`]. Stores never return
//! errors: an unavailable backing store reads as empty and ignores writes,
//! logging the failure instead.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atomic::{Access, replace_file};

fn now_millis_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
        .unwrap_or(u64::MAX)
}

/// Options for [`PersistedStore::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Entry reads as absent once this much time has passed.
    pub max_age: Option<Duration>,
}

impl SetOptions {
    pub fn with_max_age(max_age: Option<Duration>) -> Self {
        Self { max_age }
    }
}

/// Synchronous key/value store that survives process restarts.
pub trait PersistedStore: Send + Sync {
    /// Returns the stored value, or `None` if absent, expired or unreadable.
    fn get(&self, key: &str) -> Option<Value>;

    /// Stores a value. Silently does nothing if the backing store fails.
    fn set(&self, key: &str, value: Value, options: SetOptions);

    /// Removes a value. Silently does nothing if the backing store fails.
    fn remove(&self, key: &str);
}

/// A stored value with its optional expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredEntry {
    value: Value,
    /// Expiry timestamp in milliseconds since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires: Option<u64>,
}

impl StoredEntry {
    fn new(value: Value, options: SetOptions) -> Self {
        let expires = options.max_age.map(|age| {
            let age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX);
            now_millis_u64().saturating_add(age_ms)
        });
        Self { value, expires }
    }

    fn is_expired(&self) -> bool {
        self.expires.is_some_and(|expires| now_millis_u64() >= expires)
    }

    fn live_value(&self) -> Option<Value> {
        (!self.is_expired()).then(|| self.value.clone())
    }
}

/// In-process store. Lives as long as the value does; used by tests and by
/// hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-populated with entries that never expire.
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(k, v)| (k.into(), StoredEntry::new(v, SetOptions::default())))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl PersistedStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).and_then(StoredEntry::live_value)
    }

    fn set(&self, key: &str, value: Value, options: SetOptions) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), StoredEntry::new(value, options));
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }
}

/// On-disk document backing [`FileStore`].
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(flatten)]
    entries: BTreeMap<String, StoredEntry>,
}

/// JSON-file store with restricted permissions (0600).
///
/// Every operation re-reads the file, so separate processes observe each
/// other's writes. Stored values are never logged.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default session path (`<home>/session.json`).
    pub fn at_default_path() -> Self {
        Self::new(crate::config::paths::session_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the document. Returns an empty document if the file doesn't exist.
    fn load(&self) -> Result<StoreDocument> {
        if !self.path.exists() {
            return Ok(StoreDocument::default());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read session store {}", self.path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse session store {}", self.path.display()))
    }

    /// Replaces the file; it ends up 0600 even if it existed with looser bits.
    fn save(&self, doc: &StoreDocument) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(doc).context("Failed to serialize session store")?;
        replace_file(&self.path, contents.as_bytes(), Access::OwnerOnly)
    }

    fn update(&self, op: &str, mutate: impl FnOnce(&mut StoreDocument)) {
        let result = self.load().and_then(|mut doc| {
            mutate(&mut doc);
            self.save(&doc)
        });
        if let Err(err) = result {
            tracing::warn!(path = %self.path.display(), op, error = %format!("{err:#}"), "session store unavailable");
        }
    }
}

impl PersistedStore for FileStore {
    fn get(&self, key: &str) -> Option<Value> {
        match self.load() {
            Ok(doc) => doc.entries.get(key).and_then(StoredEntry::live_value),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), key, error = %format!("{err:#}"), "session store unavailable");
                None
            }
        }
    }

    fn set(&self, key: &str, value: Value, options: SetOptions) {
        self.update("set", |doc| {
            doc.entries
                .insert(key.to_string(), StoredEntry::new(value, options));
        });
    }

    fn remove(&self, key: &str) {
        self.update("remove", |doc| {
            doc.entries.remove(key);
        });
    }
}
