//! Stash: batched, self-migrating key-value access over versioned storage
//! engines.
//!
//! Callers never see transactions or version numbers. Every operation
//! started during one burst of caller code (before the caller's next
//! `.await`) is committed in a single engine transaction, and declared
//! collections and indexes are diffed against the live schema so the
//! database version is bumped only when something actually changes.
//!
//! # Layers
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Handles | [`Stash`], [`Database`], [`Collection`], [`Index`] | Queue work, return futures |
//! | Coordinator | internal | Coalesce a burst into one commit pass |
//! | Ledger / queue | internal | Pending schema changes and operations |
//! | Adapter | [`Pending`], [`CursorSequence`] | Engine requests as futures and streams |
//! | Engine port | [`engine`] | What a storage engine must provide |
//!
//! [`MemoryEngine`](engine::MemoryEngine) implements the port in process.
//!
//! # Feature Flags
//!
//! - **`config`** - build [`SchedulerConfig`] from `stash-config` sections

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod engine;
pub mod error;
pub mod key;
pub mod options;
pub mod prelude;

mod adapter;
mod coordinator;
mod database;
mod handle;
mod ledger;
mod queue;

pub use adapter::{CursorEntry, CursorItem, CursorSequence, KeyEntry, Pending};
pub use coordinator::{Phase, SchedulerConfig};
pub use database::{Database, Stash};
pub use engine::MemoryEngine;
pub use error::{EngineError, EngineResult, StashError, StashResult};
pub use handle::{Collection, CollectionInfo, Index, IndexInfo, ReadAccess};
pub use key::{Direction, Key, KeyPath, KeyRange, Query};
pub use options::{CollectionOptions, IndexSpec};
