//! Prelude module - commonly used test helpers.

pub use crate::{EngineEvent, RecordingEngine, TransactionRecord};
pub use crate::{
    auto_increment, by_age, keyed_by_id, people, person, recording_stash, setup_test_logging,
    setup_test_logging_default, unique_name,
};
