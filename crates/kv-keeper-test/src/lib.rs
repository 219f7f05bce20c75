//! kv-keeper Test - shared test utilities for kv-keeper.
//!
//! Fault-injecting host stores, ready-made facades, and a logging harness,
//! for use as a dev-dependency.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! kv-keeper-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use kv_keeper_test::prelude::*;
//!
//! #[tokio::test]
//! async fn test_quota_errors_reach_listeners() {
//!     let (keeper, errors) = recording_keeper(flat_only_env(MockFlatStore::new().with_failing_writes()));
//!     assert!(keeper.set_item("k", "v").await.is_err());
//!     assert_eq!(errors.len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
