//! Profile-scoped key/value persistence.
//!
//! Calibration, calibration details and backlash compensation settings are
//! stored per mount class under `"/<MountClass>/..."` keys. The core only sees
//! the [`KeyValueStore`] capability; two backends are provided:
//!
//! | Backend          | Durability                            |
//! |------------------|---------------------------------------|
//! | [`MemoryStore`]  | Process lifetime                      |
//! | [`TomlFileStore`]| TOML file, rewritten on every `set()` |
//!
//! Records spanning several keys are written with [`KeyValueStore::apply`];
//! both backends apply a batch all-or-nothing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

// ─── Values & Errors ────────────────────────────────────────────────

/// A stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for StoreValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for StoreValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for StoreValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for StoreValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for StoreValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for StoreValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store parse error: {0}")]
    Parse(String),

    #[error("store serialize error: {0}")]
    Serialize(String),
}

/// One mutation in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Set(String, StoreValue),
    Remove(String),
}

impl StoreOp {
    pub fn set(key: impl Into<String>, value: impl Into<StoreValue>) -> Self {
        Self::Set(key.into(), value.into())
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::Remove(key.into())
    }

    fn with_prefix(self, prefix: &str) -> Self {
        match self {
            Self::Set(key, value) => Self::Set(format!("{prefix}{key}"), value),
            Self::Remove(key) => Self::Remove(format!("{prefix}{key}")),
        }
    }

    fn apply_to(self, map: &mut BTreeMap<String, StoreValue>) {
        match self {
            Self::Set(key, value) => {
                map.insert(key, value);
            }
            Self::Remove(key) => {
                map.remove(&key);
            }
        }
    }
}

// ─── Trait ──────────────────────────────────────────────────────────

/// Flat key/value store with absolute, `/`-separated keys.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<StoreValue>;

    fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError>;

    /// Remove a key; missing keys are not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// All keys starting with `prefix`, in lexical order.
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    /// Apply `ops` in order.
    ///
    /// The default runs them one at a time and stops at the first error, so
    /// a failed batch may be partially applied. Backends that can commit the
    /// whole batch at once override this.
    fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        for op in ops {
            match op {
                StoreOp::Set(key, value) => self.set(&key, value)?,
                StoreOp::Remove(key) => self.remove(&key)?,
            }
        }
        Ok(())
    }
}

fn lock(map: &Mutex<BTreeMap<String, StoreValue>>) -> MutexGuard<'_, BTreeMap<String, StoreValue>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

fn prefixed(map: &BTreeMap<String, StoreValue>, prefix: &str) -> Vec<String> {
    map.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect()
}

// ─── Memory Store ───────────────────────────────────────────────────

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, StoreValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<StoreValue> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        prefixed(&lock(&self.entries), prefix)
    }

    fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut map = lock(&self.entries);
        for op in ops {
            op.apply_to(&mut map);
        }
        Ok(())
    }
}

// ─── TOML File Store ────────────────────────────────────────────────

/// File-backed store. The whole map is loaded on open and rewritten on
/// every mutation.
///
/// A mutation is staged on a copy of the map, written to a sibling temp file
/// and renamed over the profile. The in-memory map only changes once the
/// rename succeeded, so memory and disk never disagree after a failure.
#[derive(Debug)]
pub struct TomlFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, StoreValue>>,
}

impl TomlFileStore {
    /// Open (or start) a store at `path`. A missing file yields an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| StoreError::Io(e.to_string()))?;
            let map: BTreeMap<String, StoreValue> =
                toml::from_str(&content).map_err(|e| StoreError::Parse(e.to_string()))?;
            info!("Loaded {} profile keys from {:?}", map.len(), path);
            map
        } else {
            debug!("Profile file {:?} does not exist, starting empty", path);
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn flush(&self, map: &BTreeMap<String, StoreValue>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }
        let content = toml::to_string(map).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let tmp = self.temp_path();
        fs::write(&tmp, content)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                StoreError::Io(e.to_string())
            })
    }

    fn commit(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut map = lock(&self.entries);
        let mut staged = map.clone();
        for op in ops {
            op.apply_to(&mut staged);
        }
        if staged == *map {
            return Ok(());
        }
        self.flush(&staged)?;
        *map = staged;
        Ok(())
    }
}

impl KeyValueStore for TomlFileStore {
    fn get(&self, key: &str) -> Option<StoreValue> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        self.commit(vec![StoreOp::Set(key.to_string(), value)])
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.commit(vec![StoreOp::Remove(key.to_string())])
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        prefixed(&lock(&self.entries), prefix)
    }

    fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        debug!("Committing {} profile changes to {:?}", ops.len(), self.path);
        self.commit(ops)
    }
}

// ─── Scoped Store ───────────────────────────────────────────────────

/// A store view rooted at `"/<MountClass>"`.
///
/// Relative keys passed to the accessors must start with `/`.
#[derive(Clone)]
pub struct ScopedStore {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl std::fmt::Debug for ScopedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl ScopedStore {
    pub fn new(store: Arc<dyn KeyValueStore>, class_name: &str) -> Self {
        Self {
            store,
            prefix: format!("/{class_name}"),
        }
    }

    /// Scope over a fresh in-memory store.
    pub fn in_memory(class_name: &str) -> Self {
        Self::new(Arc::new(MemoryStore::new()), class_name)
    }

    /// Absolute key for a relative one.
    pub fn key(&self, rel: &str) -> String {
        format!("{}{}", self.prefix, rel)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn get(&self, rel: &str) -> Option<StoreValue> {
        self.store.get(&self.key(rel))
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.get(rel).is_some()
    }

    pub fn set(&self, rel: &str, value: impl Into<StoreValue>) -> Result<(), StoreError> {
        self.store.set(&self.key(rel), value.into())
    }

    pub fn remove(&self, rel: &str) -> Result<(), StoreError> {
        self.store.remove(&self.key(rel))
    }

    /// Apply a batch whose keys are relative to this scope.
    pub fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let ops = ops.into_iter().map(|op| op.with_prefix(&self.prefix)).collect();
        self.store.apply(ops)
    }

    /// Remove every key under `rel`.
    pub fn remove_all(&self, rel: &str) -> Result<(), StoreError> {
        let ops = self
            .store
            .keys_with_prefix(&self.key(rel))
            .into_iter()
            .map(StoreOp::Remove)
            .collect();
        self.store.apply(ops)
    }

    pub fn get_bool(&self, rel: &str, default: bool) -> bool {
        match self.get(rel) {
            Some(StoreValue::Bool(v)) => v,
            Some(StoreValue::Int(v)) => v != 0,
            _ => default,
        }
    }

    pub fn get_int(&self, rel: &str, default: i64) -> i64 {
        match self.get(rel) {
            Some(StoreValue::Int(v)) => v,
            Some(StoreValue::Float(v)) if v.is_finite() => v as i64,
            _ => default,
        }
    }

    pub fn get_float(&self, rel: &str, default: f64) -> f64 {
        match self.get(rel) {
            Some(StoreValue::Float(v)) => v,
            Some(StoreValue::Int(v)) => v as f64,
            _ => default,
        }
    }

    pub fn get_text(&self, rel: &str, default: &str) -> String {
        match self.get(rel) {
            Some(StoreValue::Text(v)) => v,
            _ => default.to_string(),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
