//! Collection and index handles.
//!
//! Handles are plain names. Every method queues work on the owning
//! database and returns immediately; nothing touches the engine until the
//! next commit pass. Any number of handles may refer to the same name.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::adapter::{CursorEntry, CursorSequence, KeyEntry, Pending};
use crate::coordinator::Coordinator;
use crate::engine::{CollectionPort, IndexPort, Request, SourcePort, TransactionMode};
use crate::error::{StashError, StashResult};
use crate::key::{Direction, Key, KeyPath, Query};
use crate::ledger::SchemaChange;
use crate::options::IndexSpec;
use crate::queue::OperationIntent;

/// Static metadata of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    /// Collection name.
    pub name: String,
    /// In-line key path, if any.
    pub key_path: Option<KeyPath>,
    /// Whether keys are generated.
    pub auto_increment: bool,
    /// Indexes defined on the collection.
    pub index_names: Vec<String>,
}

/// Static metadata of an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Owning collection.
    pub collection: String,
    /// Projection the index orders by.
    pub key_path: Option<KeyPath>,
    /// Whether index keys must be unique.
    pub unique: bool,
    /// Whether array keys produce one entry per element.
    pub multi_entry: bool,
}

// ---------------------------------------------------------------------------
// Shared reads
// ---------------------------------------------------------------------------

/// Read operations shared by [`Collection`] and [`Index`].
///
/// Every read is queued read-only. A batch made only of reads runs in a
/// read-only transaction.
pub trait ReadAccess {
    /// Queue `issue` against this collection or index.
    fn read<T, F>(&self, issue: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SourcePort) -> Request<T> + Send + 'static;

    /// First value selected by `query`.
    fn get(&self, query: impl Into<Query>) -> Pending<Option<Value>> {
        let query = query.into();
        self.read(move |source| source.get(&query))
    }

    /// Primary key of the first record selected by `query`.
    fn get_key(&self, query: impl Into<Query>) -> Pending<Option<Key>> {
        let query = query.into();
        self.read(move |source| source.get_key(&query))
    }

    /// Values selected by `query`, at most `limit` of them.
    fn get_all(&self, query: impl Into<Query>, limit: Option<u32>) -> Pending<Vec<Value>> {
        let query = query.into();
        self.read(move |source| source.get_all(&query, limit))
    }

    /// Primary keys selected by `query`, at most `limit` of them.
    fn get_all_keys(&self, query: impl Into<Query>, limit: Option<u32>) -> Pending<Vec<Key>> {
        let query = query.into();
        self.read(move |source| source.get_all_keys(&query, limit))
    }

    /// Number of records selected by `query`.
    fn count(&self, query: impl Into<Query>) -> Pending<u64> {
        let query = query.into();
        self.read(move |source| source.count(&query))
    }

    /// Walk the records selected by `query`.
    fn open_cursor(
        &self,
        query: impl Into<Query>,
        direction: Direction,
    ) -> CursorSequence<CursorEntry> {
        let query = query.into();
        CursorSequence::new(self.read(move |source| source.open_cursor(&query, direction)))
    }

    /// Walk the keys selected by `query`.
    fn open_key_cursor(
        &self,
        query: impl Into<Query>,
        direction: Direction,
    ) -> CursorSequence<KeyEntry> {
        let query = query.into();
        CursorSequence::new(self.read(move |source| source.open_key_cursor(&query, direction)))
    }
}

fn serialize<T: Serialize>(value: &T) -> StashResult<Value> {
    serde_json::to_value(value).map_err(|e| StashError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Handle to a named collection.
#[derive(Clone)]
pub struct Collection {
    coordinator: Arc<Coordinator>,
    name: String,
}

impl Collection {
    pub(crate) fn new(coordinator: Arc<Coordinator>, name: String) -> Self {
        Self { coordinator, name }
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn queue<T, F>(&self, mode: TransactionMode, issue: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CollectionPort) -> Request<T> + Send + 'static,
    {
        self.coordinator.ensure_declared(&self.name);
        let name = self.name.clone();
        let (intent, pending) = OperationIntent::new(self.name.clone(), mode, move |scope| {
            Ok(issue(scope.collection(&name)?.as_ref()))
        });
        self.coordinator.enqueue(intent);
        pending.with_trigger(self.coordinator.trigger())
    }

    /// Insert `value`; the key comes from the key path or the generator.
    ///
    /// Fails with [`StashError::RequestFailed`] if the key is taken.
    pub fn add(&self, value: Value) -> Pending<Key> {
        self.queue(TransactionMode::ReadWrite, move |collection| {
            collection.add(value, None)
        })
    }

    /// Insert `value` under an explicit out-of-line `key`.
    pub fn add_with_key(&self, value: Value, key: impl Into<Key>) -> Pending<Key> {
        let key = key.into();
        self.queue(TransactionMode::ReadWrite, move |collection| {
            collection.add(value, Some(key))
        })
    }

    /// Insert or replace `value`; the key comes from the key path or the
    /// generator.
    pub fn put(&self, value: Value) -> Pending<Key> {
        self.queue(TransactionMode::ReadWrite, move |collection| {
            collection.put(value, None)
        })
    }

    /// Insert or replace `value` under an explicit out-of-line `key`.
    pub fn put_with_key(&self, value: Value, key: impl Into<Key>) -> Pending<Key> {
        let key = key.into();
        self.queue(TransactionMode::ReadWrite, move |collection| {
            collection.put(value, Some(key))
        })
    }

    /// Serialize and insert `value`.
    pub fn add_json<T: Serialize>(&self, key: Option<Key>, value: &T) -> Pending<Key> {
        match serialize(value) {
            Ok(value) => self.queue(TransactionMode::ReadWrite, move |collection| {
                collection.add(value, key)
            }),
            Err(err) => Pending::failed(err),
        }
    }

    /// Serialize and upsert `value`.
    pub fn put_json<T: Serialize>(&self, key: Option<Key>, value: &T) -> Pending<Key> {
        match serialize(value) {
            Ok(value) => self.queue(TransactionMode::ReadWrite, move |collection| {
                collection.put(value, key)
            }),
            Err(err) => Pending::failed(err),
        }
    }

    /// Read and deserialize the first value selected by `query`.
    ///
    /// The read is queued when this method is called, not when the
    /// returned future is first polled.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        query: impl Into<Query>,
    ) -> impl Future<Output = StashResult<Option<T>>> + Send + 'static {
        let pending = self.get(query);
        async move {
            pending
                .await?
                .map(|value| {
                    serde_json::from_value(value)
                        .map_err(|e| StashError::Serialization(e.to_string()))
                })
                .transpose()
        }
    }

    /// Delete every record selected by `query`.
    pub fn delete(&self, query: impl Into<Query>) -> Pending<()> {
        let query = query.into();
        self.queue(TransactionMode::ReadWrite, move |collection| {
            collection.delete(&query)
        })
    }

    /// Delete every record.
    pub fn clear(&self) -> Pending<()> {
        self.queue(TransactionMode::ReadWrite, |collection| collection.clear())
    }

    /// Key path, key generator and indexes, as the engine reports them.
    pub fn metadata(&self) -> Pending<CollectionInfo> {
        self.queue(TransactionMode::ReadOnly, |collection| {
            Request::ready(Ok(CollectionInfo {
                name: collection.name().to_owned(),
                key_path: collection.key_path(),
                auto_increment: collection.auto_increment(),
                index_names: collection.index_names(),
            }))
        })
    }

    /// Handle to an existing index. Does not declare anything.
    #[must_use]
    pub fn index(&self, name: impl Into<String>) -> Index {
        Index {
            coordinator: Arc::clone(&self.coordinator),
            collection: self.name.clone(),
            name: name.into(),
        }
    }

    /// Declare an index on this collection.
    ///
    /// Existing records are indexed during the upgrade that creates it.
    pub fn create_index(&self, spec: IndexSpec) -> Index {
        self.coordinator.ensure_declared(&self.name);
        let index = self.index(spec.name.clone());
        self.coordinator
            .declare(SchemaChange::create_index(&self.name, spec));
        index
    }

    /// Declare removal of an index. Removing a missing index is a no-op.
    pub fn delete_index(&self, name: &str) {
        self.coordinator
            .declare(SchemaChange::delete_index(&self.name, name));
    }
}

impl ReadAccess for Collection {
    fn read<T, F>(&self, issue: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SourcePort) -> Request<T> + Send + 'static,
    {
        self.queue(TransactionMode::ReadOnly, move |collection| issue(collection))
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("database", &self.coordinator.name())
            .field("name", &self.name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Handle to a secondary index.
#[derive(Clone)]
pub struct Index {
    coordinator: Arc<Coordinator>,
    collection: String,
    name: String,
}

impl Index {
    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn queue<T, F>(&self, issue: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn IndexPort) -> Request<T> + Send + 'static,
    {
        self.coordinator.ensure_declared(&self.collection);
        let collection = self.collection.clone();
        let name = self.name.clone();
        let (intent, pending) =
            OperationIntent::new(self.collection.clone(), TransactionMode::ReadOnly, move |scope| {
                Ok(issue(scope.index(&collection, &name)?.as_ref()))
            });
        self.coordinator.enqueue(intent);
        pending.with_trigger(self.coordinator.trigger())
    }

    /// Key path and flags, as the engine reports them.
    pub fn metadata(&self) -> Pending<IndexInfo> {
        let collection = self.collection.clone();
        self.queue(move |index| {
            Request::ready(Ok(IndexInfo {
                name: index.name().to_owned(),
                collection,
                key_path: index.key_path(),
                unique: index.unique(),
                multi_entry: index.multi_entry(),
            }))
        })
    }
}

impl ReadAccess for Index {
    fn read<T, F>(&self, issue: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SourcePort) -> Request<T> + Send + 'static,
    {
        self.queue(move |index| issue(index))
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("database", &self.coordinator.name())
            .field("collection", &self.collection)
            .field("name", &self.name)
            .finish()
    }
}
