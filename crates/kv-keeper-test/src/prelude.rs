//! Prelude module - commonly used types for convenient import.
//!
//! Use `use kv_keeper_test::prelude::*;` to import all essential types.

// The crate already uses glob re-exports, so we mirror that pattern
pub use crate::fixtures::*;
pub use crate::harness::*;
pub use crate::mocks::*;
