//! Backend tags and the uniform storage contract.
//!
//! [`BackendType`] is the tag a caller asks for. [`KvStorage`] is the contract
//! every concrete adapter fulfils, and [`Backend`] is the tagged variant the
//! registry caches: one constructor per concrete backend, dispatched through
//! an explicit `match`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{KeeperError, KeeperResult};
use crate::flat::FlatStorage;
use crate::record::RecordStorage;

/// Backend tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendType {
    /// Synchronous flat string-keyed host store.
    Flat,
    /// Asynchronous transactional record host store.
    Transactional,
    /// First available concrete backend, transactional preferred.
    #[default]
    Auto,
}

impl BackendType {
    /// Concrete backends in auto-resolution preference order.
    pub const PREFERENCE: [Self; 2] = [Self::Transactional, Self::Flat];

    /// Stable tag used in configuration and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Transactional => "transactional",
            Self::Auto => "auto",
        }
    }

    /// Whether this tag names a concrete backend.
    #[must_use]
    pub fn is_concrete(self) -> bool {
        !matches!(self, Self::Auto)
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat" | "ls" => Ok(Self::Flat),
            "transactional" | "db" => Ok(Self::Transactional),
            "auto" => Ok(Self::Auto),
            other => Err(KeeperError::Validation(format!(
                "Unknown storage type \"{other}\", expected one of: flat, transactional, auto"
            ))),
        }
    }
}

impl TryFrom<String> for BackendType {
    type Error = KeeperError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendType> for String {
    fn from(value: BackendType) -> Self {
        value.as_str().to_owned()
    }
}

/// The uniform key-value contract.
///
/// Values are strings; callers coerce on write. Every failure is returned in
/// the `Err` slot, never raised as a panic.
#[async_trait]
pub trait KvStorage: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn set_item(&self, key: &str, value: &str) -> KeeperResult<()>;

    /// Get the value stored under `key`, or `None` if absent.
    async fn get_item(&self, key: &str) -> KeeperResult<Option<String>>;

    /// Whether any value (including an empty string) is stored under `key`.
    async fn has_item(&self, key: &str) -> KeeperResult<bool>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn remove_item(&self, key: &str) -> KeeperResult<()>;

    /// Every key currently stored, in no particular order.
    async fn get_keys(&self) -> KeeperResult<Vec<String>>;

    /// Number of keys currently stored.
    async fn get_length(&self) -> KeeperResult<u64>;

    /// Remove every key owned by this storage.
    async fn clear(&self) -> KeeperResult<()>;
}

/// A live, initialized adapter for one concrete backend.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Flat-store adapter.
    Flat(Arc<FlatStorage>),
    /// Transactional-store adapter.
    Transactional(Arc<RecordStorage>),
}

impl Backend {
    /// The concrete tag of this adapter.
    #[must_use]
    pub fn backend_type(&self) -> BackendType {
        match self {
            Self::Flat(_) => BackendType::Flat,
            Self::Transactional(_) => BackendType::Transactional,
        }
    }

    /// Whether the adapter can no longer serve requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Flat(_) => false,
            Self::Transactional(storage) => storage.is_closed(),
        }
    }

    /// Release host resources held by the adapter.
    pub(crate) fn close(&self) {
        match self {
            Self::Flat(_) => {},
            Self::Transactional(storage) => storage.close_connection(),
        }
    }

    /// Whether both handles point at the same adapter instance.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Flat(a), Self::Flat(b)) => Arc::ptr_eq(a, b),
            (Self::Transactional(a), Self::Transactional(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn storage(&self) -> &dyn KvStorage {
        match self {
            Self::Flat(storage) => storage.as_ref(),
            Self::Transactional(storage) => storage.as_ref(),
        }
    }
}

#[async_trait]
impl KvStorage for Backend {
    async fn set_item(&self, key: &str, value: &str) -> KeeperResult<()> {
        self.storage().set_item(key, value).await
    }

    async fn get_item(&self, key: &str) -> KeeperResult<Option<String>> {
        self.storage().get_item(key).await
    }

    async fn has_item(&self, key: &str) -> KeeperResult<bool> {
        self.storage().has_item(key).await
    }

    async fn remove_item(&self, key: &str) -> KeeperResult<()> {
        self.storage().remove_item(key).await
    }

    async fn get_keys(&self) -> KeeperResult<Vec<String>> {
        self.storage().get_keys().await
    }

    async fn get_length(&self) -> KeeperResult<u64> {
        self.storage().get_length().await
    }

    async fn clear(&self) -> KeeperResult<()> {
        self.storage().clear().await
    }
}
