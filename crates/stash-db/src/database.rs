//! Entry point and database handles.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::coordinator::{Coordinator, Phase, SchedulerConfig};
use crate::engine::{MemoryEngine, StorageEngine};
use crate::error::{StashError, StashResult};
use crate::handle::Collection;
use crate::ledger::SchemaChange;
use crate::options::{CollectionOptions, IndexSpec};

/// Entry point: a storage engine plus the runtime commit passes run on.
///
/// # Example
///
/// ```rust,ignore
/// use stash_db::prelude::*;
/// use serde_json::json;
///
/// let stash = Stash::in_memory()?;
/// let db = stash.database("app");
/// let store = db.collection_with(
///     "store1",
///     CollectionOptions::new().with_auto_increment(),
///     [],
/// );
///
/// // Started together: one transaction.
/// let (a, b) = tokio::join!(store.add(json!("a")), store.add(json!("b")));
/// assert_eq!((a?, b?), (Key::Int(1), Key::Int(2)));
/// ```
#[derive(Clone)]
pub struct Stash {
    engine: Arc<dyn StorageEngine>,
    runtime: Handle,
    config: SchedulerConfig,
}

impl Stash {
    /// Wrap `engine`, capturing the ambient tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StashError::Usage`] when called outside a tokio runtime.
    pub fn new(engine: Arc<dyn StorageEngine>) -> StashResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            StashError::Usage(format!("stash must be created inside a tokio runtime: {e}"))
        })?;
        Ok(Self {
            engine,
            runtime,
            config: SchedulerConfig::default(),
        })
    }

    /// Backed by a fresh [`MemoryEngine`].
    ///
    /// # Errors
    ///
    /// Returns [`StashError::Usage`] when called outside a tokio runtime.
    pub fn in_memory() -> StashResult<Self> {
        Self::new(Arc::new(MemoryEngine::new()))
    }

    /// Use `config` for databases opened from now on.
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Scheduler settings handed to new databases.
    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Handle to the database called `name`.
    ///
    /// Nothing is opened until the first operation or declaration. Every
    /// call returns an independent handle; handles to the same name
    /// converge through the engine.
    #[must_use]
    pub fn database(&self, name: impl Into<String>) -> Database {
        Database {
            coordinator: Coordinator::new(
                name.into(),
                Arc::clone(&self.engine),
                self.runtime.clone(),
                self.config,
            ),
        }
    }

    /// Delete the database called `name`. Waits for open sessions to close.
    ///
    /// # Errors
    ///
    /// Returns [`StashError::Engine`] if the engine refuses.
    pub async fn delete_database(&self, name: &str) -> StashResult<()> {
        self.engine
            .delete_database(name)
            .await
            .map_err(StashError::Engine)
    }
}

impl std::fmt::Debug for Stash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stash")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle to one named database.
///
/// Clones share the same queues, so work queued through any clone lands
/// in the same commit pass.
#[derive(Clone)]
pub struct Database {
    coordinator: Arc<Coordinator>,
}

impl Database {
    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.coordinator.name()
    }

    /// Version this handle last upgraded the database to.
    ///
    /// `None` until a schema change forced an upgrade.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.coordinator.version()
    }

    /// Current scheduling phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.coordinator.phase()
    }

    /// Number of completed commit passes.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.coordinator.passes()
    }

    /// Handle to `name`. The collection is declared with default options
    /// the first time this handle touches it.
    #[must_use]
    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection::new(Arc::clone(&self.coordinator), name.into())
    }

    /// Declare `name` with `options` and `indexes`, then return its handle.
    ///
    /// If the collection already exists its options are left untouched;
    /// missing indexes are still created.
    pub fn collection_with(
        &self,
        name: impl Into<String>,
        options: CollectionOptions,
        indexes: impl IntoIterator<Item = IndexSpec>,
    ) -> Collection {
        let name = name.into();
        self.coordinator
            .declare_collection(SchemaChange::create_collection(&name, options));
        for spec in indexes {
            self.coordinator
                .declare(SchemaChange::create_index(&name, spec));
        }
        self.collection(name)
    }

    /// Declare removal of `name`. Removing a missing collection is a no-op.
    pub fn delete_collection(&self, name: &str) {
        self.coordinator
            .declare_removal(SchemaChange::delete_collection(name));
    }

    /// Resolves after the pass that handles everything queued so far.
    ///
    /// The barrier is registered when this method is called.
    pub fn flush(&self) -> impl Future<Output = ()> + Send + 'static {
        let barrier = self.coordinator.barrier();
        let mut trigger = self.coordinator.trigger();
        async move {
            trigger.fire();
            let _ = barrier.await;
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.coordinator.name())
            .field("phase", &self.coordinator.phase())
            .field("version", &self.coordinator.version())
            .finish()
    }
}
