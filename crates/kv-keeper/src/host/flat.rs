//! Synchronous flat host store.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use super::HostError;

/// A synchronous, flat, string-keyed host store.
///
/// Mirrors the shape of a browser `Storage` object: every call completes
/// before it returns, and keys are enumerated by index.
pub trait FlatStore: Send + Sync {
    /// Store `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns the host's error event, e.g. `QuotaExceededError`.
    fn set_item(&self, key: &str, value: &str) -> Result<(), HostError>;

    /// The value under `key`, or `None` if absent.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Remove `key`. Absent keys are ignored.
    fn remove_item(&self, key: &str);

    /// The key at `index` in the host's enumeration order.
    fn key(&self, index: usize) -> Option<String>;

    /// Total number of keys in the host store, foreign keys included.
    fn len(&self) -> usize;

    /// Whether the host store holds no keys at all.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every key the host exposes.
    fn keys(&self) -> Vec<String> {
        (0..self.len()).filter_map(|i| self.key(i)).collect()
    }

    /// Check that the store can be accessed at all.
    ///
    /// # Errors
    ///
    /// Returns the host error raised on access. A store whose probe fails is
    /// treated as unavailable.
    fn probe(&self) -> Result<(), HostError> {
        Ok(())
    }
}

/// In-memory flat store for tests and ephemeral data.
///
/// Keys enumerate in lexicographic order. An optional quota, counted in
/// characters of keys plus values, rejects writes that would exceed it with a
/// `QuotaExceededError`.
#[derive(Debug, Default)]
pub struct MemoryFlatStore {
    data: RwLock<BTreeMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryFlatStore {
    /// Create an empty store without a quota.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store limited to `quota` characters.
    #[must_use]
    pub fn with_quota(quota: usize) -> Self {
        Self {
            data: RwLock::default(),
            quota: Some(quota),
        }
    }

    fn entry_size(key: &str, value: &str) -> usize {
        key.chars().count().saturating_add(value.chars().count())
    }
}

impl FlatStore for MemoryFlatStore {
    fn set_item(&self, key: &str, value: &str) -> Result<(), HostError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(quota) = self.quota {
            let used: usize = data
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| Self::entry_size(k, v))
                .fold(0, usize::saturating_add);
            if used.saturating_add(Self::entry_size(key, value)) > quota {
                return Err(HostError::new(
                    "QuotaExceededError",
                    format!("Setting the value of '{key}' exceeded the quota"),
                ));
            }
        }
        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn get_item(&self, key: &str) -> Option<String> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(key).cloned()
    }

    fn remove_item(&self, key: &str) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.remove(key);
    }

    fn key(&self, index: usize) -> Option<String> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.keys().nth(index).cloned()
    }

    fn len(&self) -> usize {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.len()
    }

    fn keys(&self) -> Vec<String> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.keys().cloned().collect()
    }
}
