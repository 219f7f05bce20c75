//! Ready-made facades and host environments.

use std::sync::Arc;

use kv_keeper::host::{FlatStore, HostEnvironment, MemoryFlatStore, MemoryRecordHost, RecordFactory};
use kv_keeper::{KeeperOptions, KvKeeper};

use crate::mocks::ErrorLog;

/// A facade over fresh in-memory flat and record stores.
#[must_use]
pub fn test_keeper() -> KvKeeper {
    KvKeeper::new(HostEnvironment::in_memory())
}

/// A facade configured with `options` over fresh in-memory stores.
///
/// # Panics
///
/// Panics if `options` are rejected.
#[must_use]
pub fn configured_keeper(options: KeeperOptions) -> KvKeeper {
    let keeper = test_keeper();
    keeper
        .configure(options)
        .expect("test options should be valid");
    keeper
}

/// A facade whose host exposes only an in-memory flat store.
#[must_use]
pub fn flat_only_keeper() -> (KvKeeper, Arc<MemoryFlatStore>) {
    let store = Arc::new(MemoryFlatStore::new());
    let env = HostEnvironment::new().with_flat_store(Arc::clone(&store) as Arc<dyn FlatStore>);
    (KvKeeper::new(env), store)
}

/// A facade whose host exposes only an in-memory record store.
#[must_use]
pub fn record_only_keeper() -> (KvKeeper, MemoryRecordHost) {
    let host = MemoryRecordHost::new();
    let env = HostEnvironment::new().with_record_factory(Arc::new(host.clone()));
    (KvKeeper::new(env), host)
}

/// A host exposing only `store` as its flat store.
#[must_use]
pub fn flat_only_env(store: impl FlatStore + 'static) -> HostEnvironment {
    HostEnvironment::new().with_flat_store(Arc::new(store))
}

/// A host exposing only `factory` as its record store.
#[must_use]
pub fn record_only_env(factory: impl RecordFactory + 'static) -> HostEnvironment {
    HostEnvironment::new().with_record_factory(Arc::new(factory))
}

/// A facade over `env` with an [`ErrorLog`] already listening.
#[must_use]
pub fn recording_keeper(env: HostEnvironment) -> (KvKeeper, ErrorLog) {
    let keeper = KvKeeper::new(env);
    let log = ErrorLog::new();
    keeper.add_error_listener(log.listener());
    (keeper, log)
}
