//! Flat-store adapter.
//!
//! Wraps a synchronous [`FlatStore`] that may be shared with unrelated data.
//! Every key is stored under the configured [`Namespace`]; enumeration,
//! counting, and clearing only ever see namespaced keys. Operations finish
//! without suspending, but are exposed through the async [`KvStorage`]
//! contract like every other backend.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::backend::KvStorage;
use crate::error::{KeeperError, KeeperResult};
use crate::host::FlatStore;
use crate::namespace::Namespace;

/// Adapter over a synchronous flat host store.
pub struct FlatStorage {
    store: Arc<dyn FlatStore>,
    namespace: Namespace,
}

impl fmt::Debug for FlatStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatStorage")
            .field("prefix", &self.namespace.prefix())
            .finish_non_exhaustive()
    }
}

impl FlatStorage {
    /// Create an adapter writing under `namespace`.
    #[must_use]
    pub fn new(store: Arc<dyn FlatStore>, namespace: Namespace) -> Self {
        Self { store, namespace }
    }

    /// The namespace keys are written under.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Host keys owned by this namespace.
    fn owned_host_keys(&self) -> Vec<String> {
        self.store
            .keys()
            .into_iter()
            .filter(|k| self.namespace.owns(k))
            .collect()
    }
}

#[async_trait]
impl KvStorage for FlatStorage {
    async fn set_item(&self, key: &str, value: &str) -> KeeperResult<()> {
        trace!(key, "flat set");
        self.store
            .set_item(&self.namespace.wrap(key), value)
            .map_err(|e| KeeperError::host_request("Unable to set item", e))
    }

    async fn get_item(&self, key: &str) -> KeeperResult<Option<String>> {
        Ok(self.store.get_item(&self.namespace.wrap(key)))
    }

    async fn has_item(&self, key: &str) -> KeeperResult<bool> {
        Ok(self.store.get_item(&self.namespace.wrap(key)).is_some())
    }

    async fn remove_item(&self, key: &str) -> KeeperResult<()> {
        trace!(key, "flat remove");
        self.store.remove_item(&self.namespace.wrap(key));
        Ok(())
    }

    async fn get_keys(&self) -> KeeperResult<Vec<String>> {
        Ok(self
            .store
            .keys()
            .iter()
            .filter_map(|k| self.namespace.unwrap_key(k))
            .map(str::to_owned)
            .collect())
    }

    async fn get_length(&self) -> KeeperResult<u64> {
        let count = self.owned_host_keys().len();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn clear(&self) -> KeeperResult<()> {
        // Collect first: removing while enumerating by index would skip keys.
        let keys = self.owned_host_keys();
        trace!(count = keys.len(), "flat clear");
        for key in &keys {
            self.store.remove_item(key);
        }
        Ok(())
    }
}
