//! In-memory storage engine.
//!
//! Databases live in process memory and disappear with the engine. This is
//! the default engine and the one the test suites run against.
//!
//! Read-write transactions hold the database's write lock until they
//! finish; read-only transactions work on a snapshot. Requests execute as
//! soon as they are issued, against state staged inside the transaction,
//! and their results are published when the transaction finishes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, watch};
use tracing::{debug, info};

use super::{
    CollectionPort, CursorPort, CursorRecord, ErrorSlot, IndexPort, Request, SchemaContext,
    SessionPort, SourcePort, StorageEngine, TransactionMode, TransactionPort, UpgradeCallback,
    UpgradeEvent,
};
use crate::error::{EngineError, EngineResult};
use crate::key::{Direction, Key, KeyPath, KeyRange, Query};
use crate::options::{CollectionOptions, IndexSpec};

/// Smallest possible key.
const MIN_KEY: Key = Key::Int(i64::MIN);

type Stores = BTreeMap<String, StoreData>;

// ---------------------------------------------------------------------------
// Collection data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoreData {
    options: CollectionOptions,
    records: BTreeMap<Key, Value>,
    next_key: i64,
    indexes: BTreeMap<String, IndexData>,
}

#[derive(Debug, Clone)]
struct IndexData {
    spec: IndexSpec,
    /// `(index key, primary key)` pairs.
    entries: BTreeSet<(Key, Key)>,
}

impl IndexData {
    fn primaries<'a>(&'a self, index_key: &'a Key) -> impl Iterator<Item = &'a Key> + 'a {
        self.entries
            .range((index_key.clone(), MIN_KEY)..)
            .take_while(move |(key, _)| key == index_key)
            .map(|(_, primary)| primary)
    }
}

/// Index keys `spec` derives from `value`.
fn index_keys(spec: &IndexSpec, value: &Value) -> Vec<Key> {
    match spec.key_path.extract(value) {
        Some(Key::Array(items)) if spec.multi_entry => items
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        Some(key) => vec![key],
        None => Vec::new(),
    }
}

fn below_upper(range: &KeyRange, key: &Key) -> bool {
    match range.upper() {
        Bound::Included(upper) => key <= upper,
        Bound::Excluded(upper) => key < upper,
        Bound::Unbounded => true,
    }
}

/// `Some(0)` and `None` both mean "no limit".
fn limit_len(limit: Option<u32>) -> usize {
    match limit {
        Some(0) | None => usize::MAX,
        Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
    }
}

impl StoreData {
    fn new(options: CollectionOptions) -> Self {
        Self {
            options,
            records: BTreeMap::new(),
            next_key: 1,
            indexes: BTreeMap::new(),
        }
    }

    fn generate_key(&mut self) -> EngineResult<Key> {
        let key = self.next_key;
        self.next_key = key
            .checked_add(1)
            .ok_or_else(|| EngineError::Constraint("key generator exhausted".into()))?;
        Ok(Key::Int(key))
    }

    /// Work out the primary key for `value`, generating one if allowed.
    fn resolve_key(&mut self, value: &mut Value, key: Option<Key>) -> EngineResult<Key> {
        let key = match (self.options.key_path.clone(), key) {
            (Some(_), Some(_)) => {
                return Err(EngineError::Data(
                    "collection uses in-line keys; an explicit key is not allowed".into(),
                ));
            },
            (Some(path), None) => match path.extract(value) {
                Some(key) => key,
                None if self.options.auto_increment => {
                    let key = self.generate_key()?;
                    if !path.inject(value, &key) {
                        return Err(EngineError::Data(format!(
                            "generated key cannot be written at key path {path:?}"
                        )));
                    }
                    key
                },
                None => {
                    return Err(EngineError::Data(format!(
                        "value has no valid key at key path {path:?}"
                    )));
                },
            },
            (None, Some(key)) => key,
            (None, None) if self.options.auto_increment => self.generate_key()?,
            (None, None) => {
                return Err(EngineError::Data(
                    "no key supplied and the collection has no key generator".into(),
                ));
            },
        };

        if self.options.auto_increment
            && let Key::Int(n) = key
            && n >= self.next_key
        {
            self.next_key = n.saturating_add(1);
        }
        Ok(key)
    }

    fn write(&mut self, key: Key, value: Value, overwrite: bool) -> EngineResult<()> {
        if !overwrite && self.records.contains_key(&key) {
            return Err(EngineError::Constraint(format!(
                "key {key} already exists"
            )));
        }
        for index in self.indexes.values().filter(|index| index.spec.unique) {
            for index_key in index_keys(&index.spec, &value) {
                if index.primaries(&index_key).any(|owner| *owner != key) {
                    return Err(EngineError::Constraint(format!(
                        "unique index {} already contains {index_key}",
                        index.spec.name
                    )));
                }
            }
        }

        self.remove(&key);
        for index in self.indexes.values_mut() {
            for index_key in index_keys(&index.spec, &value) {
                index.entries.insert((index_key, key.clone()));
            }
        }
        self.records.insert(key, value);
        Ok(())
    }

    fn remove(&mut self, key: &Key) {
        let Some(old) = self.records.remove(key) else {
            return;
        };
        for index in self.indexes.values_mut() {
            for index_key in index_keys(&index.spec, &old) {
                index.entries.remove(&(index_key, key.clone()));
            }
        }
    }

    fn delete_range(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        let keys: Vec<Key> = self
            .records
            .range::<Key, _>(range.bounds())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
    }

    fn clear(&mut self) {
        self.records.clear();
        for index in self.indexes.values_mut() {
            index.entries.clear();
        }
    }

    fn add_index(&mut self, spec: &IndexSpec) -> EngineResult<()> {
        if self.indexes.contains_key(&spec.name) {
            return Err(EngineError::Constraint(format!(
                "index {} already exists",
                spec.name
            )));
        }
        let mut index = IndexData {
            spec: spec.clone(),
            entries: BTreeSet::new(),
        };
        for (primary, value) in &self.records {
            for index_key in index_keys(spec, value) {
                if spec.unique && index.primaries(&index_key).next().is_some() {
                    return Err(EngineError::Constraint(format!(
                        "existing records violate unique index {} at {index_key}",
                        spec.name
                    )));
                }
                index.entries.insert((index_key, primary.clone()));
            }
        }
        self.indexes.insert(spec.name.clone(), index);
        Ok(())
    }

    /// `(key, primary key)` pairs selected by `range`, ascending.
    fn rows(&self, index: Option<&str>, range: &KeyRange) -> EngineResult<Vec<(Key, Key)>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let Some(name) = index else {
            return Ok(self
                .records
                .range::<Key, _>(range.bounds())
                .map(|(key, _)| (key.clone(), key.clone()))
                .collect());
        };

        let index = self
            .indexes
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("index {name}")))?;
        let start = match range.lower() {
            Bound::Included(lower) | Bound::Excluded(lower) => {
                Bound::Included((lower.clone(), MIN_KEY))
            },
            Bound::Unbounded => Bound::Unbounded,
        };
        Ok(index
            .entries
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| below_upper(range, key))
            .filter(|(key, _)| range.contains(key))
            .cloned()
            .collect())
    }

    fn cursor_records(
        &self,
        index: Option<&str>,
        range: &KeyRange,
        direction: Direction,
        with_values: bool,
    ) -> EngineResult<Vec<CursorRecord>> {
        let mut rows = self.rows(index, range)?;
        if direction.is_unique() {
            rows.dedup_by(|later, earlier| later.0 == earlier.0);
        }
        if direction.is_reverse() {
            rows.reverse();
        }
        Ok(rows
            .into_iter()
            .map(|(key, primary_key)| CursorRecord {
                value: if with_values {
                    self.records.get(&primary_key).cloned()
                } else {
                    None
                },
                key,
                primary_key,
            })
            .collect())
    }
}

fn store<'a>(stores: &'a Stores, name: &str) -> EngineResult<&'a StoreData> {
    stores
        .get(name)
        .ok_or_else(|| EngineError::NotFound(format!("collection {name}")))
}

fn store_mut<'a>(stores: &'a mut Stores, name: &str) -> EngineResult<&'a mut StoreData> {
    stores
        .get_mut(name)
        .ok_or_else(|| EngineError::NotFound(format!("collection {name}")))
}

fn aborted(cause: &EngineError) -> EngineError {
    match cause {
        EngineError::Aborted(_) => cause.clone(),
        other => EngineError::Aborted(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemoryDatabase {
    name: String,
    version: AtomicU64,
    stores: Arc<RwLock<Stores>>,
    /// Number of open sessions.
    sessions: watch::Sender<usize>,
}

impl MemoryDatabase {
    fn new(name: &str) -> Self {
        let (sessions, _) = watch::channel(0);
        Self {
            name: name.to_owned(),
            version: AtomicU64::new(0),
            stores: Arc::new(RwLock::new(BTreeMap::new())),
            sessions,
        }
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn register(&self) {
        self.sessions
            .send_modify(|open| *open = open.saturating_add(1));
    }

    fn release(&self) {
        self.sessions
            .send_modify(|open| *open = open.saturating_sub(1));
    }

    async fn wait_for_sessions(&self) -> EngineResult<()> {
        let mut sessions = self.sessions.subscribe();
        let open = *sessions.borrow_and_update();
        if open > 0 {
            debug!(database = %self.name, open, "waiting for open sessions to close");
        }
        sessions
            .wait_for(|open| *open == 0)
            .await
            .map_err(|_| EngineError::Internal("session registry closed".into()))?;
        Ok(())
    }

    /// Upgrade to `requested`, then register a session.
    ///
    /// Waits (indefinitely) for every other session to close first.
    /// Returns the collection names at the new version.
    async fn upgrade(
        &self,
        requested: u64,
        mut callback: Option<&mut UpgradeCallback<'_>>,
    ) -> EngineResult<Vec<String>> {
        loop {
            self.wait_for_sessions().await?;
            let mut stores = self.stores.write().await;
            if *self.sessions.borrow() > 0 {
                drop(stores);
                continue;
            }

            let current = self.version();
            if requested < current {
                return Err(EngineError::Version(format!(
                    "requested version {requested} is older than stored version {current}"
                )));
            }
            if requested > current {
                let mut staged = stores.clone();
                if let Some(callback) = callback.take() {
                    let event = UpgradeEvent {
                        old_version: current,
                        new_version: requested,
                    };
                    callback(&mut MemorySchema { stores: &mut staged }, event)?;
                }
                *stores = staged;
                self.version.store(requested, Ordering::Release);
                info!(
                    database = %self.name,
                    old_version = current,
                    new_version = requested,
                    "database upgraded"
                );
            }
            self.register();
            return Ok(stores.keys().cloned().collect());
        }
    }
}

/// Engine that keeps every database in memory.
///
/// Cheap to create. Share it behind an `Arc` to inspect databases from
/// tests while a client is using them.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    databases: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
}

impl MemoryEngine {
    /// Create an engine with no databases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryDatabase>>> {
        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        Arc::clone(
            self.lock()
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(MemoryDatabase::new(name))),
        )
    }

    fn existing(&self, name: &str) -> Option<Arc<MemoryDatabase>> {
        self.lock().get(name).cloned()
    }

    /// Stored version of `name`, or `None` if it was never opened.
    #[must_use]
    pub fn version(&self, name: &str) -> Option<u64> {
        self.existing(name).map(|database| database.version())
    }

    /// Number of sessions currently open on `name`.
    #[must_use]
    pub fn open_sessions(&self, name: &str) -> usize {
        self.existing(name)
            .map_or(0, |database| *database.sessions.borrow())
    }

    /// Collections stored in `name`.
    pub async fn collection_names(&self, name: &str) -> Vec<String> {
        match self.existing(name) {
            Some(database) => database.stores.read().await.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Indexes defined on `collection` in `name`.
    pub async fn index_names(&self, name: &str, collection: &str) -> Vec<String> {
        let Some(database) = self.existing(name) else {
            return Vec::new();
        };
        let stores = database.stores.read().await;
        stores
            .get(collection)
            .map(|store| store.indexes.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn open(
        &self,
        name: &str,
        version: Option<u64>,
        upgrade: Option<&mut UpgradeCallback<'_>>,
    ) -> EngineResult<Box<dyn SessionPort>> {
        if version == Some(0) {
            return Err(EngineError::Version("version must be at least 1".into()));
        }
        let database = self.database(name);
        let current = database.version();
        let requested = version.unwrap_or_else(|| current.max(1));
        if requested < current {
            return Err(EngineError::Version(format!(
                "requested version {requested} is older than stored version {current}"
            )));
        }

        let collections = if requested > current {
            database.upgrade(requested, upgrade).await?
        } else {
            let collections: Vec<String> =
                database.stores.read().await.keys().cloned().collect();
            database.register();
            collections
        };
        debug!(database = name, version = requested, "session opened");

        Ok(Box::new(MemorySession {
            database,
            version: requested,
            collections,
            released: AtomicBool::new(false),
        }))
    }

    async fn delete_database(&self, name: &str) -> EngineResult<()> {
        let Some(database) = self.existing(name) else {
            return Ok(());
        };
        database.wait_for_sessions().await?;

        let mut databases = self.lock();
        if databases
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, &database))
        {
            databases.remove(name);
            info!(database = name, "database deleted");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sessions and schema
// ---------------------------------------------------------------------------

struct MemorySession {
    database: Arc<MemoryDatabase>,
    version: u64,
    collections: Vec<String>,
    released: AtomicBool,
}

impl MemorySession {
    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.database.release();
            debug!(database = %self.database.name, "session closed");
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Copies of the `scope` collections.
fn stage(stores: &Stores, scope: &[String]) -> EngineResult<Stores> {
    scope
        .iter()
        .map(|name| Ok((name.clone(), store(stores, name)?.clone())))
        .collect()
}

#[async_trait]
impl SessionPort for MemorySession {
    fn name(&self) -> &str {
        &self.database.name
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn collection_names(&self) -> Vec<String> {
        self.collections.clone()
    }

    async fn transaction(
        &self,
        collections: &[String],
        mode: TransactionMode,
    ) -> EngineResult<Box<dyn TransactionPort>> {
        if self.released.load(Ordering::Acquire) {
            return Err(EngineError::InvalidState("session is closed".into()));
        }
        if collections.is_empty() {
            return Err(EngineError::InvalidState("transaction scope is empty".into()));
        }
        let mut scope: Vec<String> = Vec::with_capacity(collections.len());
        for name in collections {
            if !scope.contains(name) {
                scope.push(name.clone());
            }
        }

        let (stores, guard) = match mode {
            TransactionMode::ReadOnly => {
                let stores = self.database.stores.read().await;
                (stage(&stores, &scope)?, None)
            },
            TransactionMode::ReadWrite => {
                let guard = Arc::clone(&self.database.stores).write_owned().await;
                (stage(&guard, &scope)?, Some(guard))
            },
        };
        debug!(database = %self.database.name, %mode, ?scope, "transaction started");

        Ok(Box::new(MemoryTransaction {
            shared: Arc::new(TxnShared {
                database: self.database.name.clone(),
                mode,
                scope,
                error: ErrorSlot::new(),
                state: Mutex::new(TxnState {
                    stores,
                    deliveries: Vec::new(),
                    failure: None,
                    finished: false,
                }),
            }),
            guard,
        }))
    }

    fn close(self: Box<Self>) {
        self.release();
    }
}

struct MemorySchema<'a> {
    stores: &'a mut Stores,
}

impl SchemaContext for MemorySchema<'_> {
    fn collection_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    fn create_collection(&mut self, name: &str, options: &CollectionOptions) -> EngineResult<()> {
        if self.stores.contains_key(name) {
            return Err(EngineError::Constraint(format!(
                "collection {name} already exists"
            )));
        }
        self.stores
            .insert(name.to_owned(), StoreData::new(options.clone()));
        Ok(())
    }

    fn delete_collection(&mut self, name: &str) -> EngineResult<()> {
        self.stores
            .remove(name)
            .map(drop)
            .ok_or_else(|| EngineError::NotFound(format!("collection {name}")))
    }

    fn index_names(&self, collection: &str) -> EngineResult<Vec<String>> {
        Ok(store(self.stores, collection)?.indexes.keys().cloned().collect())
    }

    fn create_index(&mut self, collection: &str, spec: &IndexSpec) -> EngineResult<()> {
        store_mut(self.stores, collection)?.add_index(spec)
    }

    fn delete_index(&mut self, collection: &str, name: &str) -> EngineResult<()> {
        store_mut(self.stores, collection)?
            .indexes
            .remove(name)
            .map(drop)
            .ok_or_else(|| EngineError::NotFound(format!("index {name}")))
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Publishes a request's result; receives the abort cause if the
/// transaction did not commit.
type Delivery = Box<dyn FnOnce(Option<&EngineError>) + Send>;

struct TxnState {
    stores: Stores,
    deliveries: Vec<Delivery>,
    failure: Option<EngineError>,
    finished: bool,
}

struct TxnShared {
    database: String,
    mode: TransactionMode,
    scope: Vec<String>,
    error: ErrorSlot,
    state: Mutex<TxnState>,
}

impl TxnShared {
    fn lock(&self) -> MutexGuard<'_, TxnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, state: &mut TxnState, cause: EngineError) {
        debug!(database = %self.database, error = %cause, "transaction aborting");
        self.error.set(aborted(&cause));
        state.failure = Some(cause);
    }

    /// Run `op` against the staged state and queue its result.
    fn issue<T, F>(&self, op: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Stores) -> EngineResult<T>,
    {
        let (responder, request) = Request::channel(&self.error);
        let mut state = self.lock();
        if state.finished {
            responder.respond(Err(EngineError::InvalidState(
                "transaction has already finished".into(),
            )));
            return request;
        }

        let result = match state.failure.clone() {
            Some(cause) => Err(aborted(&cause)),
            None => op(&mut state.stores),
        };
        if let Err(err) = &result
            && state.failure.is_none()
        {
            self.fail(&mut state, err.clone());
        }
        state
            .deliveries
            .push(Box::new(move |abort: Option<&EngineError>| {
                let outcome = match (result, abort) {
                    (Ok(_), Some(cause)) => Err(cause.clone()),
                    (result, _) => result,
                };
                responder.respond(outcome);
            }));
        request
    }
}

struct MemoryTransaction {
    shared: Arc<TxnShared>,
    guard: Option<OwnedRwLockWriteGuard<Stores>>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        let deliveries = {
            let mut state = self.shared.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            std::mem::take(&mut state.deliveries)
        };
        let abort = EngineError::Aborted("transaction dropped before commit".into());
        self.shared.error.set(abort.clone());
        for deliver in deliveries {
            deliver(Some(&abort));
        }
    }
}

#[async_trait]
impl TransactionPort for MemoryTransaction {
    fn mode(&self) -> TransactionMode {
        self.shared.mode
    }

    fn scope(&self) -> Vec<String> {
        self.shared.scope.clone()
    }

    fn collection(&self, name: &str) -> EngineResult<Box<dyn CollectionPort>> {
        let state = self.shared.lock();
        let data = state.stores.get(name).ok_or_else(|| {
            EngineError::NotFound(format!("collection {name} is not in the transaction scope"))
        })?;
        Ok(Box::new(MemoryAccessor {
            shared: Arc::clone(&self.shared),
            collection: name.to_owned(),
            index: None,
            options: data.options.clone(),
            index_names: data.indexes.keys().cloned().collect(),
        }))
    }

    fn abort(&self, reason: EngineError) {
        let mut state = self.shared.lock();
        if !state.finished && state.failure.is_none() {
            self.shared.fail(&mut state, reason);
        }
    }

    async fn commit(mut self: Box<Self>) -> EngineResult<()> {
        let (deliveries, failure, stores) = {
            let mut state = self.shared.lock();
            state.finished = true;
            (
                std::mem::take(&mut state.deliveries),
                state.failure.clone(),
                std::mem::take(&mut state.stores),
            )
        };

        if let Some(cause) = failure {
            let abort = aborted(&cause);
            for deliver in deliveries {
                deliver(Some(&abort));
            }
            debug!(database = %self.shared.database, error = %cause, "transaction aborted");
            return Err(cause);
        }

        if let Some(mut guard) = self.guard.take() {
            for (name, data) in stores {
                guard.insert(name, data);
            }
        }
        for deliver in deliveries {
            deliver(None);
        }
        debug!(database = %self.shared.database, "transaction committed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

/// Collection accessor, or index accessor when `index` is set.
struct MemoryAccessor {
    shared: Arc<TxnShared>,
    collection: String,
    index: Option<IndexSpec>,
    options: CollectionOptions,
    index_names: Vec<String>,
}

impl MemoryAccessor {
    fn read<T, F>(&self, op: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(&StoreData, Option<&str>) -> EngineResult<T>,
    {
        let index = self.index.as_ref().map(|spec| spec.name.as_str());
        self.shared
            .issue(|stores| op(store(stores, &self.collection)?, index))
    }

    fn write<T, F>(&self, op: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreData) -> EngineResult<T>,
    {
        if self.shared.mode.is_read_only() {
            return self.shared.issue(|_| {
                Err(EngineError::ReadOnly(format!(
                    "cannot write to {} in a read-only transaction",
                    self.collection
                )))
            });
        }
        self.shared
            .issue(|stores| op(store_mut(stores, &self.collection)?))
    }

    fn cursor(
        &self,
        query: &Query,
        direction: Direction,
        with_values: bool,
    ) -> Request<Box<dyn CursorPort>> {
        let range = query.to_range();
        self.read(move |data, index| {
            let records = data.cursor_records(index, &range, direction, with_values)?;
            Ok(Box::new(MemoryCursor {
                records: records.into_iter(),
            }) as Box<dyn CursorPort>)
        })
    }
}

impl SourcePort for MemoryAccessor {
    fn name(&self) -> &str {
        self.index
            .as_ref()
            .map_or(self.collection.as_str(), |spec| spec.name.as_str())
    }

    fn key_path(&self) -> Option<KeyPath> {
        match &self.index {
            Some(spec) => Some(spec.key_path.clone()),
            None => self.options.key_path.clone(),
        }
    }

    fn get(&self, query: &Query) -> Request<Option<Value>> {
        let range = query.to_range();
        self.read(move |data, index| {
            Ok(data
                .rows(index, &range)?
                .first()
                .and_then(|(_, primary)| data.records.get(primary).cloned()))
        })
    }

    fn get_key(&self, query: &Query) -> Request<Option<Key>> {
        let range = query.to_range();
        self.read(move |data, index| {
            Ok(data
                .rows(index, &range)?
                .into_iter()
                .next()
                .map(|(_, primary)| primary))
        })
    }

    fn get_all(&self, query: &Query, limit: Option<u32>) -> Request<Vec<Value>> {
        let range = query.to_range();
        self.read(move |data, index| {
            Ok(data
                .rows(index, &range)?
                .iter()
                .take(limit_len(limit))
                .filter_map(|(_, primary)| data.records.get(primary).cloned())
                .collect())
        })
    }

    fn get_all_keys(&self, query: &Query, limit: Option<u32>) -> Request<Vec<Key>> {
        let range = query.to_range();
        self.read(move |data, index| {
            Ok(data
                .rows(index, &range)?
                .into_iter()
                .take(limit_len(limit))
                .map(|(_, primary)| primary)
                .collect())
        })
    }

    fn count(&self, query: &Query) -> Request<u64> {
        let range = query.to_range();
        self.read(move |data, index| {
            let rows = data.rows(index, &range)?;
            Ok(u64::try_from(rows.len()).unwrap_or(u64::MAX))
        })
    }

    fn open_cursor(&self, query: &Query, direction: Direction) -> Request<Box<dyn CursorPort>> {
        self.cursor(query, direction, true)
    }

    fn open_key_cursor(&self, query: &Query, direction: Direction) -> Request<Box<dyn CursorPort>> {
        self.cursor(query, direction, false)
    }
}

impl CollectionPort for MemoryAccessor {
    fn auto_increment(&self) -> bool {
        self.options.auto_increment
    }

    fn index_names(&self) -> Vec<String> {
        self.index_names.clone()
    }

    fn index(&self, name: &str) -> EngineResult<Box<dyn IndexPort>> {
        let spec = {
            let state = self.shared.lock();
            store(&state.stores, &self.collection)?
                .indexes
                .get(name)
                .map(|index| index.spec.clone())
                .ok_or_else(|| EngineError::NotFound(format!("index {name}")))?
        };
        Ok(Box::new(Self {
            shared: Arc::clone(&self.shared),
            collection: self.collection.clone(),
            index: Some(spec),
            options: self.options.clone(),
            index_names: self.index_names.clone(),
        }))
    }

    fn add(&self, value: Value, key: Option<Key>) -> Request<Key> {
        self.write(move |data| {
            let mut value = value;
            let key = data.resolve_key(&mut value, key)?;
            data.write(key.clone(), value, false)?;
            Ok(key)
        })
    }

    fn put(&self, value: Value, key: Option<Key>) -> Request<Key> {
        self.write(move |data| {
            let mut value = value;
            let key = data.resolve_key(&mut value, key)?;
            data.write(key.clone(), value, true)?;
            Ok(key)
        })
    }

    fn delete(&self, query: &Query) -> Request<()> {
        let range = query.to_range();
        self.write(move |data| {
            data.delete_range(&range);
            Ok(())
        })
    }

    fn clear(&self) -> Request<()> {
        self.write(|data| {
            data.clear();
            Ok(())
        })
    }
}

impl IndexPort for MemoryAccessor {
    fn unique(&self) -> bool {
        self.index.as_ref().is_some_and(|spec| spec.unique)
    }

    fn multi_entry(&self) -> bool {
        self.index.as_ref().is_some_and(|spec| spec.multi_entry)
    }
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Cursor over a snapshot of its range taken when it was opened.
struct MemoryCursor {
    records: std::vec::IntoIter<CursorRecord>,
}

#[async_trait]
impl CursorPort for MemoryCursor {
    async fn advance(&mut self, count: u32) -> EngineResult<Option<CursorRecord>> {
        if count == 0 {
            return Err(EngineError::Data("cursor advance count must be positive".into()));
        }
        let skip = usize::try_from(count.saturating_sub(1)).unwrap_or(usize::MAX);
        Ok(self.records.nth(skip))
    }
}
