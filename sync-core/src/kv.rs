//! Key-value capability injected into trackers that cache small values.
//!
//! The core never touches process-wide state; trackers that want to
//! remember something (last-seen times, history totals) receive a
//! [`KeyValueStore`] explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Minimal string key-value store.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value, replacing any previous one.
    fn put(&self, key: &str, value: String);

    /// Delete a value.
    fn remove(&self, key: &str);
}

/// Shared handle to a key-value store.
pub type SharedKeyValueStore = Arc<dyn KeyValueStore>;

/// In-memory store, lives as long as the session.
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyValueStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryKeyValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in a shared handle.
    pub fn shared() -> SharedKeyValueStore {
        Arc::new(Self::new())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A panic while holding this lock cannot leave the map half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        self.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.lock().remove(key);
    }
}
