//! The storage facade.
//!
//! [`KvKeeper`] owns the configuration, the backend registry, and the error
//! hub for one facade context. It hands out [`Storage`] handles and proxies
//! the CRUD operations to whatever backend the default type resolves to.
//!
//! Every error a facade or handle operation returns is broadcast to the
//! registered error listeners exactly once, before the caller sees it.

use std::fmt::{self, Display};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendType, KvStorage};
use crate::config::{ConfigCell, KeeperConfig, KeeperOptions};
use crate::error::KeeperResult;
use crate::host::HostEnvironment;
use crate::hub::{ErrorHub, ErrorListener};
use crate::registry::Registry;

struct KeeperInner {
    config: ConfigCell,
    registry: Registry,
    hub: ErrorHub,
}

/// Process-facing storage facade.
///
/// Cloning yields another handle to the same facade context.
#[derive(Clone)]
pub struct KvKeeper {
    inner: Arc<KeeperInner>,
}

impl fmt::Debug for KvKeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvKeeper")
            .field("config", &self.inner.config.current())
            .field("hub", &self.inner.hub)
            .finish_non_exhaustive()
    }
}

impl KvKeeper {
    /// Create a facade over the stores `host` exposes, with default
    /// configuration.
    #[must_use]
    pub fn new(host: HostEnvironment) -> Self {
        Self {
            inner: Arc::new(KeeperInner {
                config: ConfigCell::new(),
                registry: Registry::new(host),
                hub: ErrorHub::new(),
            }),
        }
    }

    /// Apply `options`. Succeeds at most once per facade.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the facade was already configured or an
    /// option value is invalid. An invalid call still consumes the single
    /// configuration opportunity and leaves the defaults in place.
    pub fn configure(&self, options: KeeperOptions) -> KeeperResult<()> {
        self.inner.config.apply(Ok(options))
    }

    /// Apply options given as a JSON object.
    ///
    /// # Errors
    ///
    /// As [`KvKeeper::configure`], plus unknown keys or mistyped values.
    pub fn configure_from_json(&self, value: serde_json::Value) -> KeeperResult<()> {
        self.inner.config.apply(KeeperOptions::from_json(value))
    }

    /// Apply options given as a TOML document.
    ///
    /// # Errors
    ///
    /// As [`KvKeeper::configure_from_json`].
    pub fn configure_from_toml(&self, document: &str) -> KeeperResult<()> {
        self.inner.config.apply(KeeperOptions::from_toml(document))
    }

    /// Snapshot of the active configuration.
    #[must_use]
    pub fn config(&self) -> Arc<KeeperConfig> {
        self.inner.config.current()
    }

    /// Resolve a storage handle. `None` uses the configured default type.
    ///
    /// # Errors
    ///
    /// Returns an unavailability error when the host exposes no matching
    /// backend, or the backend's initialization error.
    pub async fn get_storage(&self, requested: Option<BackendType>) -> KeeperResult<Storage> {
        let result = self.resolve(requested).await;
        self.inner.hub.observe(result)
    }

    /// Resolve a storage handle from a string tag such as `"db"` or `"flat"`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown tag, otherwise as
    /// [`KvKeeper::get_storage`].
    pub async fn get_storage_named(&self, tag: &str) -> KeeperResult<Storage> {
        let requested = match tag.parse::<BackendType>() {
            Ok(requested) => requested,
            Err(e) => return self.inner.hub.observe(Err(e)),
        };
        self.get_storage(Some(requested)).await
    }

    async fn resolve(&self, requested: Option<BackendType>) -> KeeperResult<Storage> {
        let config = self.inner.config.current();
        let requested = requested.unwrap_or_else(|| config.default_type());
        let backend = self.inner.registry.resolve(requested, &config).await?;
        Ok(Storage {
            backend,
            keeper: Arc::clone(&self.inner),
        })
    }

    /// Start resolving the default backend in the background.
    ///
    /// A failure is broadcast to the error listeners. Must be called from
    /// within a tokio runtime.
    pub fn preconnect(&self) -> JoinHandle<()> {
        let keeper = self.clone();
        tokio::spawn(async move {
            match keeper.get_storage(None).await {
                Ok(storage) => info!(backend = %storage.backend_type(), "preconnected"),
                Err(e) => warn!(error = %e, "preconnect failed"),
            }
        })
    }

    // -----------------------------------------------------------------------
    // Error listeners
    // -----------------------------------------------------------------------

    /// Register an error listener.
    pub fn add_error_listener(&self, listener: ErrorListener) {
        self.inner.hub.add(listener);
    }

    /// Remove the earliest registration of `listener`.
    pub fn remove_error_listener(&self, listener: &ErrorListener) -> bool {
        self.inner.hub.remove(listener)
    }

    /// Registered listeners, in registration order.
    #[must_use]
    pub fn error_listeners(&self) -> Vec<ErrorListener> {
        self.inner.hub.listeners()
    }

    /// Remove every error listener.
    pub fn remove_all_error_listeners(&self) {
        self.inner.hub.clear();
    }

    // -----------------------------------------------------------------------
    // Default-backend proxies
    // -----------------------------------------------------------------------

    /// Store `value` under `key` in the default backend.
    ///
    /// # Errors
    ///
    /// Returns the resolution error or the backend's write error.
    pub async fn set_item(&self, key: &str, value: impl Display) -> KeeperResult<()> {
        self.get_storage(None).await?.set_item(key, value).await
    }

    /// Read `key` from the default backend.
    ///
    /// # Errors
    ///
    /// Returns the resolution error or the backend's read error.
    pub async fn get_item(&self, key: &str) -> KeeperResult<Option<String>> {
        self.get_storage(None).await?.get_item(key).await
    }

    /// Whether `key` exists in the default backend.
    ///
    /// # Errors
    ///
    /// Returns the resolution error or the backend's read error.
    pub async fn has_item(&self, key: &str) -> KeeperResult<bool> {
        self.get_storage(None).await?.has_item(key).await
    }

    /// Delete `key` from the default backend.
    ///
    /// # Errors
    ///
    /// Returns the resolution error or the backend's delete error.
    pub async fn remove_item(&self, key: &str) -> KeeperResult<()> {
        self.get_storage(None).await?.remove_item(key).await
    }

    /// Keys held by the default backend.
    ///
    /// # Errors
    ///
    /// Returns the resolution error or the backend's enumeration error.
    pub async fn get_keys(&self) -> KeeperResult<Vec<String>> {
        self.get_storage(None).await?.get_keys().await
    }

    /// Number of keys held by the default backend.
    ///
    /// # Errors
    ///
    /// Returns the resolution error or the backend's count error.
    pub async fn get_length(&self) -> KeeperResult<u64> {
        self.get_storage(None).await?.get_length().await
    }

    /// Remove every key from the default backend.
    ///
    /// # Errors
    ///
    /// Returns the resolution error or the backend's clear error.
    pub async fn clear(&self) -> KeeperResult<()> {
        self.get_storage(None).await?.clear().await
    }
}

/// A resolved storage handle.
///
/// Operations forward to the underlying adapter; errors are broadcast to the
/// owning facade's listeners.
#[derive(Clone)]
pub struct Storage {
    backend: Backend,
    keeper: Arc<KeeperInner>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// The concrete backend behind this handle.
    #[must_use]
    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    /// The underlying adapter.
    #[must_use]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Whether this handle and `other` share an adapter instance.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        self.backend.same_instance(&other.backend)
    }

    /// Close the adapter and evict it from the registry. The next resolution
    /// of this type builds a fresh adapter.
    pub fn close(&self) {
        debug!(backend = %self.backend_type(), "closing storage");
        self.backend.close();
        self.keeper.registry.evict(&self.backend);
    }

    fn observe<T>(&self, result: KeeperResult<T>) -> KeeperResult<T> {
        self.keeper.hub.observe(result)
    }

    /// Store the string form of `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns the adapter's write error.
    pub async fn set_item(&self, key: &str, value: impl Display) -> KeeperResult<()> {
        let value = value.to_string();
        let result = self.backend.set_item(key, &value).await;
        self.observe(result)
    }

    /// Read `key`.
    ///
    /// # Errors
    ///
    /// Returns the adapter's read error.
    pub async fn get_item(&self, key: &str) -> KeeperResult<Option<String>> {
        let result = self.backend.get_item(key).await;
        self.observe(result)
    }

    /// Whether `key` exists.
    ///
    /// # Errors
    ///
    /// Returns the adapter's read error.
    pub async fn has_item(&self, key: &str) -> KeeperResult<bool> {
        let result = self.backend.has_item(key).await;
        self.observe(result)
    }

    /// Delete `key`. Deleting a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns the adapter's delete error.
    pub async fn remove_item(&self, key: &str) -> KeeperResult<()> {
        let result = self.backend.remove_item(key).await;
        self.observe(result)
    }

    /// Every key held by the adapter.
    ///
    /// # Errors
    ///
    /// Returns the adapter's enumeration error.
    pub async fn get_keys(&self) -> KeeperResult<Vec<String>> {
        let result = self.backend.get_keys().await;
        self.observe(result)
    }

    /// Number of keys held by the adapter.
    ///
    /// # Errors
    ///
    /// Returns the adapter's count error.
    pub async fn get_length(&self) -> KeeperResult<u64> {
        let result = self.backend.get_length().await;
        self.observe(result)
    }

    /// Remove every key held by the adapter.
    ///
    /// # Errors
    ///
    /// Returns the adapter's clear error.
    pub async fn clear(&self) -> KeeperResult<()> {
        let result = self.backend.clear().await;
        self.observe(result)
    }
}
