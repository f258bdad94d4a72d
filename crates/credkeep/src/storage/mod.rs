// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! String key-value storage backends and the at-rest sealing capability.

pub mod file;
pub mod sealer;

pub use file::FileStore;
pub use sealer::{AeadSealer, Sealer};

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Flat string key-value storage shared by every credential component.
///
/// Writes are last-write-wins; callers do their own read-modify-write.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
    /// All keys starting with `prefix`, in lexical order.
    fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

/// Process-local store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Read a JSON value, treating a missing key as `None`.
pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> anyhow::Result<Option<T>> {
    match store.get(key)? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("malformed value at {key}: {e}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub fn set_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

/// Remove every key under `prefix`. Returns how many were removed.
pub fn remove_prefix(store: &dyn KeyValueStore, prefix: &str) -> anyhow::Result<usize> {
    let keys = store.keys(prefix)?;
    for key in &keys {
        store.remove(key)?;
    }
    Ok(keys.len())
}
