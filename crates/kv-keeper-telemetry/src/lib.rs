//! kv-keeper Telemetry - log subscriber setup for applications embedding
//! kv-keeper.
//!
//! The storage crates only emit `tracing` events. Applications that have no
//! subscriber of their own can install one here:
//!
//! ```rust,no_run
//! use kv_keeper_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), kv_keeper_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_storage_level("debug");
//!
//! setup_logging(&config)?;
//! tracing::info!("storage logging ready");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LOG_ENV_VAR, LogConfig, LogFormat, LogTarget,
    setup_default_logging, setup_logging,
};
