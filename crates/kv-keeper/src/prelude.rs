//! Prelude module - commonly used types for convenient import.
//!
//! Use `use kv_keeper::prelude::*;` to import all essential types.
//!
//! # Example
//!
//! ```rust
//! use kv_keeper::prelude::*;
//!
//! # async fn example() -> KeeperResult<()> {
//! let keeper = KvKeeper::new(HostEnvironment::in_memory());
//! keeper.set_item("greeting", "hello").await?;
//!
//! let storage = keeper.get_storage(Some(BackendType::Flat)).await?;
//! assert!(storage.get_item("greeting").await?.is_none());
//! # Ok(())
//! # }
//! ```

// Facade
pub use crate::{KvKeeper, Storage};

// Configuration
pub use crate::{KeeperConfig, KeeperOptions};

// Backends
pub use crate::{Backend, BackendType, KvStorage};

// Hosts
pub use crate::host::{FlatStore, HostEnvironment, MemoryFlatStore, MemoryRecordHost, RecordFactory};

// Errors
pub use crate::{ErrorHub, ErrorKind, ErrorListener, KeeperError, KeeperResult};
