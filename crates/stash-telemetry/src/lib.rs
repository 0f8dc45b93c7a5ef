//! Stash Telemetry - logging setup for stash.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and one
//! formatting layer, writing to stdout, stderr, or a rolling file.
//!
//! # Example
//!
//! ```rust,no_run
//! use stash_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), stash_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("stash_db=debug");
//!
//! setup_logging(&config)?;
//! tracing::info!("logging ready");
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - **`config`** - build [`LogConfig`] from `stash_config::LoggingSection`

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
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging,
    setup_logging,
};
