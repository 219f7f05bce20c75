//! kv-keeper - one key-value API over whatever stores the host offers.
//!
//! A host may expose two kinds of persistence:
//!
//! # Flat store ([`FlatStorage`])
//!
//! A synchronous, string-keyed map that may be shared with unrelated data.
//! Keys are written under a namespace derived from the configured name and
//! collection, so enumeration and clearing never touch foreign keys.
//!
//! # Transactional store ([`RecordStorage`])
//!
//! An asynchronous, versioned record database. The adapter opens a named
//! connection, creates its collection on schema upgrade, and runs each
//! operation in its own transaction.
//!
//! # Facade ([`KvKeeper`])
//!
//! Resolves a backend by type (`auto` picks transactional, then flat), caches
//! one adapter per type, and broadcasts every returned error to registered
//! listeners.
//!
//! # Feature Flags
//!
//! - **`kv`** - [`SurrealRecordHost`](host::SurrealRecordHost), a
//!   transactional host backed by `SurrealKV`

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod backend;
pub mod config;
pub mod error;
pub mod flat;
pub mod global;
pub mod host;
pub mod hub;
pub mod keeper;
pub mod namespace;
pub mod record;

mod registry;

pub use backend::{Backend, BackendType, KvStorage};
pub use config::{
    DEFAULT_NAME, DEFAULT_RECORD_COLLECTION, KeeperConfig, KeeperOptions, SCHEMA_VERSION,
};
pub use error::{ErrorKind, KeeperError, KeeperResult};
pub use flat::FlatStorage;
pub use host::{HostEnvironment, HostError};
pub use hub::{ErrorHub, ErrorListener};
pub use keeper::{KvKeeper, Storage};
pub use namespace::{Namespace, namespace_prefix};
pub use record::{ConnectionStatus, KeyStream, RecordStorage};
