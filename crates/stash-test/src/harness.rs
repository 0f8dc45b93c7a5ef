//! Test harness helpers.

use std::sync::Arc;

use stash_db::{MemoryEngine, Stash};
use tracing_subscriber::EnvFilter;

use crate::recording::RecordingEngine;

/// Initialize tracing for tests, writing through the test harness.
///
/// Safe to call from every test; only the first call installs a
/// subscriber.
///
/// ```rust,ignore
/// use stash_test::setup_test_logging;
///
/// #[tokio::test]
/// async fn my_test() {
///     setup_test_logging("stash_db=debug");
///     // ... test code
/// }
/// ```
pub fn setup_test_logging(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_test_writer()
        .try_init();
}

/// Set up test logging with the default filter (warn level).
pub fn setup_test_logging_default() {
    setup_test_logging("warn");
}

/// A [`Stash`] over a fresh recording in-memory engine.
///
/// # Panics
///
/// Panics outside a tokio runtime.
#[must_use]
#[allow(clippy::expect_used)]
pub fn recording_stash() -> (Stash, Arc<RecordingEngine<MemoryEngine>>) {
    let engine = Arc::new(RecordingEngine::in_memory());
    let stash = Stash::new(engine.clone()).expect("recording_stash needs a tokio runtime");
    (stash, engine)
}
