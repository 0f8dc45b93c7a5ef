//! Prelude module - commonly used types for convenient import.
//!
//! Use `use stash_db::prelude::*;` to import all essential types.

// Entry points
pub use crate::{Database, Phase, SchedulerConfig, Stash};

// Handles
pub use crate::{Collection, CollectionInfo, Index, IndexInfo, ReadAccess};

// Results and cursors
pub use crate::{CursorEntry, CursorSequence, KeyEntry, Pending};

// Keys and options
pub use crate::{CollectionOptions, Direction, IndexSpec, Key, KeyPath, KeyRange, Query};

// Errors
pub use crate::{EngineError, StashError, StashResult};
