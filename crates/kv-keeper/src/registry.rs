//! Backend registry and arbitration.
//!
//! Holds at most one ready adapter per concrete [`BackendType`], plus the
//! adapter the last `auto` resolution selected. Slots change only when an
//! initialization completes or an adapter is evicted; the slot lock is never
//! held across an `.await`.
//!
//! Concurrent resolutions of a type that is still initializing share one
//! pending initialization instead of each constructing their own adapter.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::backend::{Backend, BackendType};
use crate::config::KeeperConfig;
use crate::error::{KeeperError, KeeperResult};
use crate::flat::FlatStorage;
use crate::host::HostEnvironment;
use crate::namespace::Namespace;
use crate::record::RecordStorage;

type PendingInit = Shared<BoxFuture<'static, KeeperResult<Backend>>>;

#[derive(Default)]
enum Slot {
    #[default]
    Empty,
    Pending(PendingInit),
    Ready(Backend),
}

#[derive(Default)]
struct Slots {
    flat: Slot,
    transactional: Slot,
    auto: Option<Backend>,
}

impl Slots {
    /// Slot for a concrete tag. `Auto` owns no concrete slot and is never
    /// passed here.
    fn concrete(&mut self, kind: BackendType) -> &mut Slot {
        match kind {
            BackendType::Flat => &mut self.flat,
            BackendType::Transactional | BackendType::Auto => &mut self.transactional,
        }
    }
}

/// Per-type adapter cache.
pub(crate) struct Registry {
    host: HostEnvironment,
    slots: Mutex<Slots>,
}

impl Registry {
    pub(crate) fn new(host: HostEnvironment) -> Self {
        Self {
            host,
            slots: Mutex::new(Slots::default()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `requested` to a ready adapter, constructing one if needed.
    pub(crate) async fn resolve(
        &self,
        requested: BackendType,
        config: &Arc<KeeperConfig>,
    ) -> KeeperResult<Backend> {
        if requested.is_concrete() {
            return self
                .resolve_concrete(requested, config)
                .await?
                .ok_or(KeeperError::Unsupported(requested));
        }

        if let Some(backend) = self.cached_auto() {
            debug!(backend = %backend.backend_type(), "auto resolution cache hit");
            return Ok(backend);
        }
        for kind in BackendType::PREFERENCE {
            if let Some(backend) = self.resolve_concrete(kind, config).await? {
                debug!(backend = %kind, "auto resolved");
                self.slots().auto = Some(backend.clone());
                return Ok(backend);
            }
        }
        Err(KeeperError::NoSupportedStorage)
    }

    fn cached_auto(&self) -> Option<Backend> {
        let mut slots = self.slots();
        match &slots.auto {
            Some(backend) if !backend.is_closed() => Some(backend.clone()),
            Some(_) => {
                slots.auto = None;
                None
            },
            None => None,
        }
    }

    /// Resolve a concrete type. `Ok(None)` means the host lacks it.
    async fn resolve_concrete(
        &self,
        kind: BackendType,
        config: &Arc<KeeperConfig>,
    ) -> KeeperResult<Option<Backend>> {
        let pending = {
            let mut slots = self.slots();
            let slot = slots.concrete(kind);
            match slot {
                Slot::Ready(backend) if !backend.is_closed() => {
                    debug!(backend = %kind, "cache hit");
                    return Ok(Some(backend.clone()));
                },
                Slot::Pending(pending) => {
                    debug!(backend = %kind, "joining pending initialization");
                    pending.clone()
                },
                Slot::Ready(_) | Slot::Empty => {
                    let Some(init) = self.construct(kind, config) else {
                        debug!(backend = %kind, "backend not available on this host");
                        *slot = Slot::Empty;
                        return Ok(None);
                    };
                    let pending = init.shared();
                    *slot = Slot::Pending(pending.clone());
                    pending
                },
            }
        };

        let result = pending.clone().await;

        let mut slots = self.slots();
        let slot = slots.concrete(kind);
        if matches!(slot, Slot::Pending(p) if p.ptr_eq(&pending)) {
            *slot = match &result {
                Ok(backend) => Slot::Ready(backend.clone()),
                Err(_) => Slot::Empty,
            };
        }
        result.map(Some)
    }

    /// Build the initialization future for `kind`, or `None` if unavailable.
    fn construct(
        &self,
        kind: BackendType,
        config: &Arc<KeeperConfig>,
    ) -> Option<BoxFuture<'static, KeeperResult<Backend>>> {
        match kind {
            BackendType::Flat => {
                let store = self.host.flat_store()?;
                debug!(prefix = config.prefix(), "constructing flat storage");
                let storage = FlatStorage::new(store, Namespace::new(config.prefix()));
                let backend = Backend::Flat(Arc::new(storage));
                Some(futures::future::ready(Ok::<_, KeeperError>(backend)).boxed())
            },
            BackendType::Transactional => {
                let factory = self.host.record_factory()?;
                debug!(name = config.name(), "constructing transactional storage");
                let storage = Arc::new(RecordStorage::new(
                    factory,
                    config.name(),
                    config.record_collection(),
                ));
                Some(
                    async move {
                        storage.init().await?;
                        Ok::<_, KeeperError>(Backend::Transactional(storage))
                    }
                    .boxed(),
                )
            },
            BackendType::Auto => None,
        }
    }

    /// Drop `backend` from its concrete slot and from the auto slot.
    pub(crate) fn evict(&self, backend: &Backend) {
        let mut slots = self.slots();
        let slot = slots.concrete(backend.backend_type());
        if matches!(slot, Slot::Ready(cached) if cached.same_instance(backend)) {
            *slot = Slot::Empty;
            debug!(backend = %backend.backend_type(), "evicted");
        }
        if slots
            .auto
            .as_ref()
            .is_some_and(|cached| cached.same_instance(backend))
        {
            slots.auto = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryFlatStore, MemoryRecordHost};

    fn config() -> Arc<KeeperConfig> {
        Arc::new(KeeperConfig::default())
    }

    #[tokio::test]
    async fn test_auto_prefers_transactional() {
        let registry = Registry::new(HostEnvironment::in_memory());
        let backend = registry.resolve(BackendType::Auto, &config()).await.unwrap();
        assert_eq!(backend.backend_type(), BackendType::Transactional);
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_flat() {
        let host = HostEnvironment::new().with_flat_store(Arc::new(MemoryFlatStore::new()));
        let registry = Registry::new(host);
        let backend = registry.resolve(BackendType::Auto, &config()).await.unwrap();
        assert_eq!(backend.backend_type(), BackendType::Flat);
    }

    #[tokio::test]
    async fn test_auto_without_backends_fails() {
        let registry = Registry::new(HostEnvironment::new());
        assert!(matches!(
            registry.resolve(BackendType::Auto, &config()).await,
            Err(KeeperError::NoSupportedStorage)
        ));
    }

    #[tokio::test]
    async fn test_concrete_unsupported() {
        let registry = Registry::new(HostEnvironment::new());
        assert!(matches!(
            registry.resolve(BackendType::Flat, &config()).await,
            Err(KeeperError::Unsupported(BackendType::Flat))
        ));
    }

    #[tokio::test]
    async fn test_instances_are_cached() {
        let registry = Registry::new(HostEnvironment::in_memory());
        let cfg = config();
        let a = registry.resolve(BackendType::Transactional, &cfg).await.unwrap();
        let b = registry.resolve(BackendType::Transactional, &cfg).await.unwrap();
        let auto = registry.resolve(BackendType::Auto, &cfg).await.unwrap();
        assert!(a.same_instance(&b));
        assert!(a.same_instance(&auto));
    }

    #[tokio::test]
    async fn test_concurrent_resolution_is_coalesced() {
        let host = MemoryRecordHost::new();
        let registry = Registry::new(
            HostEnvironment::new().with_record_factory(Arc::new(host.clone())),
        );
        let cfg = config();
        let (a, b) = tokio::join!(
            registry.resolve(BackendType::Transactional, &cfg),
            registry.resolve(BackendType::Transactional, &cfg),
        );
        assert!(a.unwrap().same_instance(&b.unwrap()));
        assert_eq!(host.open_connection_count("kv-keeper"), 1);
    }

    #[tokio::test]
    async fn test_evict_clears_both_slots() {
        let registry = Registry::new(HostEnvironment::in_memory());
        let cfg = config();
        let first = registry.resolve(BackendType::Auto, &cfg).await.unwrap();
        first.close();
        registry.evict(&first);
        let second = registry.resolve(BackendType::Auto, &cfg).await.unwrap();
        assert!(!first.same_instance(&second));
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn test_closed_cached_instance_is_replaced() {
        let registry = Registry::new(HostEnvironment::in_memory());
        let cfg = config();
        let first = registry.resolve(BackendType::Transactional, &cfg).await.unwrap();
        first.close();
        let second = registry.resolve(BackendType::Transactional, &cfg).await.unwrap();
        assert!(!first.same_instance(&second));
    }
}
