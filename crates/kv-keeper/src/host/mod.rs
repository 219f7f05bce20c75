//! Host store contracts and in-process implementations.
//!
//! The facade never talks to a concrete persistence API directly. It consumes
//! two host contracts:
//!
//! - [`FlatStore`]: synchronous, flat, string-keyed (completes immediately)
//! - [`RecordFactory`]: asynchronous, transactional, record-oriented; every
//!   request completes through a terminal event
//!
//! A [`HostEnvironment`] records which of them the host exposes. Implementations:
//!
//! - **In-memory** (always available): [`MemoryFlatStore`], [`MemoryRecordHost`]
//! - **`SurrealKV`** (behind `kv` feature): [`SurrealRecordHost`]

use std::fmt;
use std::sync::Arc;

use tracing::debug;

pub mod flat;
pub mod memory;
pub mod record;

#[cfg(feature = "kv")]
pub mod surreal;

pub use flat::{FlatStore, MemoryFlatStore};
pub use memory::MemoryRecordHost;
pub use record::{
    CursorRequest, CursorResponder, OpenEvent, OpenRequest, OpenResponder, Record,
    RecordCollection, RecordConnection, RecordCursor, RecordFactory, RecordTransaction, Request,
    RequestEvent, Responder, TransactionMode, VersionChange, VersionChangeHandler, cursor_request,
    open_request, request,
};

#[cfg(feature = "kv")]
pub use surreal::SurrealRecordHost;

/// An error event raised by a host store.
///
/// `name` is the host's error class (e.g. `QuotaExceededError`), `message`
/// the human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct HostError {
    /// Error class reported by the host.
    pub name: String,
    /// Detail message reported by the host.
    pub message: String,
}

impl HostError {
    /// Create a host error.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// The host stores available to the facade.
#[derive(Clone, Default)]
pub struct HostEnvironment {
    flat: Option<Arc<dyn FlatStore>>,
    record: Option<Arc<dyn RecordFactory>>,
}

impl fmt::Debug for HostEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEnvironment")
            .field("flat", &self.flat.is_some())
            .field("record", &self.record.is_some())
            .finish()
    }
}

impl HostEnvironment {
    /// A host exposing no stores at all.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A host exposing fresh in-memory flat and record stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new()
            .with_flat_store(Arc::new(MemoryFlatStore::new()))
            .with_record_factory(Arc::new(MemoryRecordHost::new()))
    }

    /// Expose a flat store.
    #[must_use]
    pub fn with_flat_store(mut self, store: Arc<dyn FlatStore>) -> Self {
        self.flat = Some(store);
        self
    }

    /// Expose a transactional record store.
    #[must_use]
    pub fn with_record_factory(mut self, factory: Arc<dyn RecordFactory>) -> Self {
        self.record = Some(factory);
        self
    }

    /// The flat store, if exposed and accessible.
    #[must_use]
    pub fn flat_store(&self) -> Option<Arc<dyn FlatStore>> {
        let store = self.flat.as_ref()?;
        match store.probe() {
            Ok(()) => Some(Arc::clone(store)),
            Err(e) => {
                debug!(error = %e, "flat store not accessible");
                None
            },
        }
    }

    /// The transactional record store, if exposed.
    #[must_use]
    pub fn record_factory(&self) -> Option<Arc<dyn RecordFactory>> {
        self.record.clone()
    }
}
