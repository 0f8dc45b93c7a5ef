//! Stash Test - shared test utilities.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! stash-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use stash_test::{RecordingEngine, recording_stash};
//!
//! #[tokio::test]
//! async fn test_burst() {
//!     let (stash, engine) = recording_stash();
//!     let kv = stash.database("db").collection("kv");
//!     let _ = tokio::join!(kv.put_with_key(json!(1), 1_i64), kv.get(1_i64));
//!     assert_eq!(engine.transactions().len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod recording;

pub use fixtures::*;
pub use harness::*;
pub use recording::*;
