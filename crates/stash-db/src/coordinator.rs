//! Commit coordinator.
//!
//! One coordinator exists per [`Database`](crate::Database) handle. It owns
//! the schema ledger and the operation queue and turns everything queued
//! during one burst of caller code into a single commit pass:
//!
//! ```text
//! Idle --enqueue--> FlushPending --continuation runs--> Committing --pass done--> Idle
//! ```
//!
//! The first enqueue while idle spawns the flush continuation. On a
//! current-thread runtime it cannot run before the caller yields. On a
//! multi-thread runtime it also waits until the caller first polls or drops
//! one of the futures it was handed (or a `flush()` barrier). Either way
//! every operation started before the caller's next `.await` lands in the
//! same pass. Passes are serialized: pass N finishes (commit or abort)
//! before pass N + 1 opens its session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{Notify, oneshot};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::engine::{
    SchemaContext, SessionPort, StorageEngine, TransactionMode, UpgradeCallback, UpgradeEvent,
};
use crate::error::{EngineError, EngineResult, StashError};
use crate::adapter::FlushTrigger;
use crate::ledger::{LiveSchema, SchemaChange, SchemaLedger, index_owners};
use crate::queue::{OperationIntent, OperationQueue, TransactionScope};

/// Scheduler tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Extra cooperative yields the flush continuation performs before it
    /// drains the queues. Zero drains at the first opportunity.
    pub coalesce_yields: u32,
}

impl SchedulerConfig {
    /// Set [`coalesce_yields`](Self::coalesce_yields).
    #[must_use]
    pub fn with_coalesce_yields(mut self, yields: u32) -> Self {
        self.coalesce_yields = yields;
        self
    }
}

#[cfg(feature = "config")]
impl From<&stash_config::SchedulerSection> for SchedulerConfig {
    fn from(section: &stash_config::SchedulerSection) -> Self {
        Self {
            coalesce_yields: section.coalesce_yields,
        }
    }
}

/// Where a database handle is in its flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing queued.
    Idle,
    /// Work is queued and a flush is scheduled.
    FlushPending,
    /// A commit pass is running.
    Committing,
}

#[derive(Debug, Default)]
struct State {
    scheduled: bool,
    committing: bool,
    ledger: SchemaLedger,
    queue: OperationQueue,
    /// The scheduled flush has been told the caller yielded.
    kicked: bool,
    version: Option<u64>,
    /// Collections declared since the last drain.
    declared: HashSet<String>,
    /// Flush waiters released when the next pass finishes.
    barriers: Vec<oneshot::Sender<()>>,
}

pub(crate) struct Coordinator {
    name: String,
    engine: Arc<dyn StorageEngine>,
    runtime: Handle,
    config: SchedulerConfig,
    /// Flushes wait for a [`FlushTrigger`] before draining.
    gated: bool,
    released: Notify,
    state: Mutex<State>,
    /// Held for the whole of a pass.
    commit_lock: tokio::sync::Mutex<()>,
    passes: AtomicU64,
}

impl Coordinator {
    pub(crate) fn new(
        name: String,
        engine: Arc<dyn StorageEngine>,
        runtime: Handle,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let gated = runtime.runtime_flavor() != RuntimeFlavor::CurrentThread;
        Arc::new(Self {
            name,
            engine,
            runtime,
            config,
            gated,
            released: Notify::new(),
            state: Mutex::new(State::default()),
            commit_lock: tokio::sync::Mutex::new(()),
            passes: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Version computed by the last schema bump, if any.
    pub(crate) fn version(&self) -> Option<u64> {
        self.lock().version
    }

    pub(crate) fn phase(&self) -> Phase {
        let state = self.lock();
        if state.committing {
            Phase::Committing
        } else if state.scheduled {
            Phase::FlushPending
        } else {
            Phase::Idle
        }
    }

    /// Number of completed commit passes.
    pub(crate) fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Enqueueing
    // -----------------------------------------------------------------------

    fn request_flush(self: &Arc<Self>, state: &mut State) {
        if state.scheduled {
            return;
        }
        state.scheduled = true;
        debug!(database = %self.name, "flush scheduled");
        let coordinator = Arc::clone(self);
        self.runtime.spawn(async move { coordinator.run_scheduled().await });
    }

    /// Record a schema change and schedule a flush.
    pub(crate) fn declare(self: &Arc<Self>, change: SchemaChange) {
        let mut state = self.lock();
        state.ledger.declare(change);
        debug!(
            database = %self.name,
            pending = state.ledger.snapshot().len(),
            "schema change declared"
        );
        self.request_flush(&mut state);
    }

    /// A trigger that releases the scheduled flush when fired.
    pub(crate) fn trigger(self: &Arc<Self>) -> FlushTrigger {
        let coordinator = Arc::clone(self);
        FlushTrigger::new(move || coordinator.kick())
    }

    fn kick(&self) {
        let mut state = self.lock();
        if state.scheduled && !state.kicked {
            state.kicked = true;
            self.released.notify_one();
        }
    }

    /// Declare a collection, remembering it until the next drain.
    pub(crate) fn declare_collection(self: &Arc<Self>, change: SchemaChange) {
        {
            let mut state = self.lock();
            state.declared.insert(change.target().to_owned());
        }
        self.declare(change);
    }

    /// Declare a collection removal.
    pub(crate) fn declare_removal(self: &Arc<Self>, change: SchemaChange) {
        {
            let mut state = self.lock();
            state.declared.remove(change.target());
        }
        self.declare(change);
    }

    /// Declare `name` with default options unless the pending pass already
    /// does.
    pub(crate) fn ensure_declared(self: &Arc<Self>, name: &str) {
        let mut state = self.lock();
        if state.declared.insert(name.to_owned()) {
            state
                .ledger
                .declare(SchemaChange::create_collection(name, Default::default()));
            self.request_flush(&mut state);
        }
    }

    /// Queue an operation and schedule a flush.
    pub(crate) fn enqueue(self: &Arc<Self>, intent: OperationIntent) {
        let mut state = self.lock();
        state.queue.enqueue(intent);
        self.request_flush(&mut state);
    }

    /// Resolves once everything queued before the call has been committed
    /// or rejected.
    pub(crate) fn barrier(self: &Arc<Self>) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.lock();
        state.barriers.push(sender);
        self.request_flush(&mut state);
        receiver
    }

    // -----------------------------------------------------------------------
    // Commit pass
    // -----------------------------------------------------------------------

    async fn run_scheduled(self: Arc<Self>) {
        if self.gated {
            self.released.notified().await;
        }
        for _ in 0..self.config.coalesce_yields {
            tokio::task::yield_now().await;
        }
        let _pass_guard = self.commit_lock.lock().await;

        let (changes, queue, barriers) = {
            let mut state = self.lock();
            state.scheduled = false;
            state.kicked = false;
            state.committing = true;
            state.declared.clear();
            (
                state.ledger.drain(),
                state.queue.drain(),
                std::mem::take(&mut state.barriers),
            )
        };

        let pass = self.passes().saturating_add(1);
        let span = info_span!("commit_pass", database = %self.name, pass);
        self.commit_pass(changes, queue).instrument(span).await;

        self.passes.fetch_add(1, Ordering::AcqRel);
        self.lock().committing = false;
        for barrier in barriers {
            let _ = barrier.send(());
        }
    }

    async fn commit_pass(&self, changes: Vec<SchemaChange>, queue: OperationQueue) {
        let session = match self.prepare_session(changes, !queue.is_empty()).await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, operations = queue.len(), "commit pass failed");
                for intent in queue.into_intents() {
                    intent.reject(StashError::Engine(err.clone()));
                }
                return;
            },
        };
        let Some(session) = session else {
            return;
        };

        if !queue.is_empty() {
            self.run_operations(session.as_ref(), queue).await;
        }
        session.close();
    }

    /// Run the schema step and return the session the data step should use.
    ///
    /// Returns `None` when there is neither schema nor data work. When
    /// another session takes the target version first, the changes are
    /// re-checked against the new schema and the upgrade retried one
    /// version higher.
    async fn prepare_session(
        &self,
        changes: Vec<SchemaChange>,
        has_operations: bool,
    ) -> EngineResult<Option<Box<dyn SessionPort>>> {
        if changes.is_empty() {
            if !has_operations {
                return Ok(None);
            }
            return self.engine.open(&self.name, None, None).await.map(Some);
        }

        let owners = index_owners(&changes);
        let mut changes = changes;
        let mut session = self.engine.open(&self.name, None, None).await?;
        loop {
            let live = inspect(session.as_ref(), &owners).await?;
            if !live.requires_upgrade(&changes) {
                debug!(changes = changes.len(), "schema already converged");
                return Ok(Some(session));
            }
            for change in changes.iter().filter(|change| change.is_necessary(&live)) {
                debug!(target = change.target(), kind = ?change.kind(), "schema change required");
            }

            let current = session.version();
            let target = current
                .checked_add(1)
                .ok_or_else(|| EngineError::Version("version counter exhausted".into()))?;
            session.close();

            let mut pending = Some(changes);
            let opened = {
                let mut upgrade = |schema: &mut dyn SchemaContext,
                                   event: UpgradeEvent|
                 -> EngineResult<()> {
                    info!(
                        old_version = event.old_version,
                        new_version = event.new_version,
                        "applying schema changes"
                    );
                    for change in pending.take().unwrap_or_default() {
                        change.apply(schema)?;
                    }
                    Ok(())
                };
                let callback: &mut UpgradeCallback<'_> = &mut upgrade;
                self.engine
                    .open(&self.name, Some(target), Some(callback))
                    .await
            };

            session = match opened {
                Ok(session) => session,
                Err(EngineError::Version(reason)) => {
                    debug!(target, %reason, "target version overtaken");
                    self.engine.open(&self.name, None, None).await?
                },
                Err(err) => return Err(err),
            };
            match pending.take() {
                None => {
                    self.lock().version = Some(target);
                    return Ok(Some(session));
                },
                Some(unapplied) => {
                    debug!(target, "target version taken by another session, retrying");
                    changes = unapplied;
                },
            }
        }
    }

    async fn run_operations(&self, session: &dyn SessionPort, queue: OperationQueue) {
        let collections = queue.implied_collections();
        let mode = queue.implied_mode();
        debug!(?collections, %mode, operations = queue.len(), "transaction scope");

        let transaction = match session.transaction(&collections, mode).await {
            Ok(transaction) => transaction,
            Err(err) => {
                warn!(error = %err, "transaction could not start");
                for intent in queue.into_intents() {
                    intent.reject(StashError::TransactionAborted(err.clone()));
                }
                return;
            },
        };

        let mut failure: Option<EngineError> = None;
        {
            let scope = TransactionScope::new(transaction.as_ref(), collections);
            for intent in queue.into_intents() {
                if let Some(cause) = &failure {
                    intent.reject(StashError::TransactionAborted(cause.clone()));
                    continue;
                }
                if let Err(err) = intent.run(&scope) {
                    let cause = EngineError::Aborted(format!("operation failed: {err}"));
                    transaction.abort(cause.clone());
                    failure = Some(cause);
                }
            }
        }

        if let Err(err) = transaction.commit().await {
            warn!(error = %err, "transaction aborted");
        }
    }
}

/// Live schema, including index names of the existing collections among
/// `owners`.
async fn inspect(session: &dyn SessionPort, owners: &[String]) -> EngineResult<LiveSchema> {
    let mut live = LiveSchema::new(session.collection_names());
    let owners: Vec<String> = owners
        .iter()
        .filter(|owner| live.has_collection(owner))
        .cloned()
        .collect();
    if owners.is_empty() {
        return Ok(live);
    }

    let transaction = session
        .transaction(&owners, TransactionMode::ReadOnly)
        .await?;
    for owner in &owners {
        let names = transaction.collection(owner)?.index_names();
        live.add_indexes(owner, names);
    }
    transaction.commit().await?;
    Ok(live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryEngine, Request};
    use crate::options::{CollectionOptions, IndexSpec};
    use crate::key::{Key, Query};
    use serde_json::json;

    fn coordinator(engine: &Arc<MemoryEngine>) -> Arc<Coordinator> {
        Coordinator::new(
            "db".into(),
            Arc::clone(engine) as Arc<dyn StorageEngine>,
            Handle::current(),
            SchedulerConfig::default(),
        )
    }

    fn put(
        coordinator: &Arc<Coordinator>,
        collection: &str,
        key: i64,
        value: serde_json::Value,
    ) -> crate::adapter::Pending<Key> {
        coordinator.ensure_declared(collection);
        let name = collection.to_owned();
        let (intent, pending) =
            OperationIntent::new(collection, TransactionMode::ReadWrite, move |scope| {
                Ok(scope.collection(&name)?.put(value, Some(Key::Int(key))))
            });
        coordinator.enqueue(intent);
        pending.with_trigger(coordinator.trigger())
    }

    fn get(
        coordinator: &Arc<Coordinator>,
        collection: &str,
        key: i64,
    ) -> crate::adapter::Pending<Option<serde_json::Value>> {
        coordinator.ensure_declared(collection);
        let name = collection.to_owned();
        let (intent, pending) =
            OperationIntent::new(collection, TransactionMode::ReadOnly, move |scope| {
                Ok(scope.collection(&name)?.get(&Query::from(key)))
            });
        coordinator.enqueue(intent);
        pending.with_trigger(coordinator.trigger())
    }

    #[tokio::test]
    async fn test_phase_transitions() {
        let engine = Arc::new(MemoryEngine::new());
        let coordinator = coordinator(&engine);
        assert_eq!(coordinator.phase(), Phase::Idle);

        let pending = put(&coordinator, "kv", 1, json!("a"));
        assert_eq!(coordinator.phase(), Phase::FlushPending);
        pending.await.unwrap();

        coordinator.barrier().await.unwrap();
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_burst_shares_one_pass() {
        let engine = Arc::new(MemoryEngine::new());
        let coordinator = coordinator(&engine);

        let a = put(&coordinator, "kv", 1, json!("a"));
        let b = put(&coordinator, "kv", 2, json!("b"));
        let read = get(&coordinator, "kv", 1);
        let (a, b, read) = tokio::join!(a, b, read);
        assert_eq!(a.unwrap(), Key::Int(1));
        assert_eq!(b.unwrap(), Key::Int(2));
        assert_eq!(read.unwrap(), Some(json!("a")));
        assert_eq!(coordinator.passes(), 1);
        assert_eq!(coordinator.version(), Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_multi_thread_flush_waits_for_the_caller() {
        let engine = Arc::new(MemoryEngine::new());
        let coordinator = coordinator(&engine);

        let first = put(&coordinator, "kv", 1, json!("a"));
        // A free worker could start the flush while this burst is still running.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(coordinator.phase(), Phase::FlushPending);
        let second = put(&coordinator, "kv", 2, json!("b"));
        let barrier = coordinator.barrier();

        let (first, second) = tokio::join!(first, second);
        first.unwrap();
        second.unwrap();
        barrier.await.unwrap();
        assert_eq!(coordinator.passes(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_future_releases_the_flush() {
        let engine = Arc::new(MemoryEngine::new());
        let coordinator = coordinator(&engine);

        drop(put(&coordinator, "kv", 1, json!("a")));
        let mut trigger = coordinator.trigger();
        let barrier = coordinator.barrier();
        trigger.fire();
        barrier.await.unwrap();
        assert_eq!(engine.collection_names("db").await, vec!["kv"]);
    }

    #[tokio::test]
    async fn test_commit_pass_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let engine = Arc::new(MemoryEngine::new());
        let coordinator = coordinator(&engine);
        let pass = Arc::clone(&coordinator).run_scheduled();
        assert_send(&pass);
        drop(pass);
    }

    #[tokio::test]
    async fn test_collection_deleted_elsewhere_is_redeclared() {
        let engine = Arc::new(MemoryEngine::new());
        let writer = coordinator(&engine);
        put(&writer, "kv", 1, json!("a")).await.unwrap();

        let other = coordinator(&engine);
        other.declare_removal(SchemaChange::delete_collection("kv"));
        other.barrier().await.unwrap();
        assert!(engine.collection_names("db").await.is_empty());

        put(&writer, "kv", 2, json!("b")).await.unwrap();
        assert_eq!(get(&writer, "kv", 2).await.unwrap(), Some(json!("b")));
        assert_eq!(engine.collection_names("db").await, vec!["kv"]);
    }

    #[tokio::test]
    async fn test_awaited_operations_use_separate_passes() {
        let engine = Arc::new(MemoryEngine::new());
        let coordinator = coordinator(&engine);

        put(&coordinator, "kv", 1, json!("a")).await.unwrap();
        put(&coordinator, "kv", 2, json!("b")).await.unwrap();
        assert_eq!(get(&coordinator, "kv", 2).await.unwrap(), Some(json!("b")));
        assert_eq!(coordinator.passes(), 3);
    }

    #[tokio::test]
    async fn test_converged_schema_skips_upgrade() {
        let engine = Arc::new(MemoryEngine::new());
        let coordinator = coordinator(&engine);
        coordinator.declare_collection(SchemaChange::create_collection(
            "kv",
            CollectionOptions::new(),
        ));
        coordinator.barrier().await.unwrap();
        assert_eq!(engine.version("db"), Some(2));

        let again = Coordinator::new(
            "db".into(),
            Arc::clone(&engine) as Arc<dyn StorageEngine>,
            Handle::current(),
            SchedulerConfig::default(),
        );
        again.declare_collection(SchemaChange::create_collection("kv", CollectionOptions::new()));
        again.declare(SchemaChange::delete_index("kv", "missing"));
        again.barrier().await.unwrap();
        assert_eq!(engine.version("db"), Some(2));
        assert_eq!(again.version(), None);
    }

    #[tokio::test]
    async fn test_index_declared_after_data() {
        let engine = Arc::new(MemoryEngine::new());
        let coordinator = coordinator(&engine);
        put(&coordinator, "people", 1, json!({"city": "x"})).await.unwrap();

        coordinator.declare(SchemaChange::create_index(
            "people",
            IndexSpec::new("by_city", "city"),
        ));
        let name = "people".to_owned();
        let (intent, pending) =
            OperationIntent::new("people", TransactionMode::ReadOnly, move |scope| {
                Ok(scope.index(&name, "by_city")?.get_all(&Query::All, None))
            });
        coordinator.enqueue(intent);
        assert_eq!(pending.await.unwrap(), vec![json!({"city": "x"})]);
        assert_eq!(engine.index_names("db", "people").await, vec!["by_city"]);
    }

    #[tokio::test]
    async fn test_failing_operation_aborts_the_batch() {
        let engine = Arc::new(MemoryEngine::new());
        let coordinator = coordinator(&engine);
        put(&coordinator, "kv", 1, json!("seed")).await.unwrap();

        let earlier = put(&coordinator, "kv", 2, json!("lost"));
        let (broken, broken_result) =
            OperationIntent::new("kv", TransactionMode::ReadWrite, |_| -> crate::StashResult<Request<()>> {
                Err(StashError::Usage("broken operation".into()))
            });
        coordinator.enqueue(broken);
        let later = put(&coordinator, "kv", 3, json!("never"));

        let (earlier, broken_result, later) = tokio::join!(earlier, broken_result, later);
        assert!(matches!(earlier, Err(StashError::TransactionAborted(_))));
        assert_eq!(broken_result, Err(StashError::Usage("broken operation".into())));
        assert!(matches!(later, Err(StashError::TransactionAborted(_))));

        assert_eq!(get(&coordinator, "kv", 2).await.unwrap(), None);
        assert_eq!(get(&coordinator, "kv", 1).await.unwrap(), Some(json!("seed")));
    }

    #[tokio::test]
    async fn test_fresh_handle_adopts_stored_version() {
        let engine = Arc::new(MemoryEngine::new());
        let writer = coordinator(&engine);
        put(&writer, "kv", 1, json!(1)).await.unwrap();
        engine.open("db", Some(10), None).await.unwrap().close();

        let reader = coordinator(&engine);
        assert_eq!(get(&reader, "kv", 1).await.unwrap(), Some(json!(1)));
        assert_eq!(engine.version("db"), Some(10));
        assert_eq!(reader.version(), None);
    }
}
