//! Storage engine port.
//!
//! The coordinator never talks to a concrete engine. It drives any
//! implementation of [`StorageEngine`] through four layers of objects:
//!
//! | Object | Obtained from | Purpose |
//! |--------|---------------|---------|
//! | [`SessionPort`] | [`StorageEngine::open`] | A connection at one schema version |
//! | [`SchemaContext`] | the upgrade callback | Structural changes during a version bump |
//! | [`TransactionPort`] | [`SessionPort::transaction`] | Atomic unit of reads and writes |
//! | [`CollectionPort`] / [`IndexPort`] | [`TransactionPort::collection`] | Request primitives |
//!
//! Request primitives return a [`Request`]: a one-shot completion slot the
//! engine settles later. Requests are issued synchronously, so everything a
//! batch issues lands in one transaction in issue order.
//!
//! # Collaborator guarantees
//!
//! Engines serialize sessions by database name: a version upgrade does not
//! start while another session on the same database is open, and waits
//! (without timing out) until they close. Several client handles for the
//! same name therefore converge on one on-disk database without a
//! process-wide registry.

pub mod memory;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{EngineError, EngineResult};
use crate::key::{Direction, Key, KeyPath, Query};
use crate::options::{CollectionOptions, IndexSpec};

pub use memory::MemoryEngine;

// ---------------------------------------------------------------------------
// Modes and events
// ---------------------------------------------------------------------------

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// Reads only.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

impl TransactionMode {
    /// Whether writes are rejected.
    #[must_use]
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

impl std::fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("readonly"),
            Self::ReadWrite => f.write_str("readwrite"),
        }
    }
}

/// Versions involved in a schema upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeEvent {
    /// Version stored before the upgrade.
    pub old_version: u64,
    /// Version being installed.
    pub new_version: u64,
}

/// Callback invoked at most once while a session upgrades its database.
pub type UpgradeCallback<'a> =
    dyn FnMut(&mut dyn SchemaContext, UpgradeEvent) -> EngineResult<()> + Send + 'a;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A versioned storage engine.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Open a session on `name`.
    ///
    /// Without a `version` the session opens at the stored version. When
    /// `version` exceeds the stored version the engine runs `upgrade`
    /// exactly once before returning; the upgrade is discarded if the
    /// callback fails.
    async fn open(
        &self,
        name: &str,
        version: Option<u64>,
        upgrade: Option<&mut UpgradeCallback<'_>>,
    ) -> EngineResult<Box<dyn SessionPort>>;

    /// Delete the database `name` and everything in it.
    async fn delete_database(&self, name: &str) -> EngineResult<()>;
}

/// A live connection to one database at one version.
#[async_trait]
pub trait SessionPort: Send + Sync {
    /// Database name.
    fn name(&self) -> &str;

    /// Schema version this session opened at.
    fn version(&self) -> u64;

    /// Collections present at this session's version.
    fn collection_names(&self) -> Vec<String>;

    /// Begin a transaction scoped to `collections`.
    async fn transaction(
        &self,
        collections: &[String],
        mode: TransactionMode,
    ) -> EngineResult<Box<dyn TransactionPort>>;

    /// Close the session. Dropping it has the same effect.
    fn close(self: Box<Self>);
}

/// Structural mutations available during a version upgrade.
pub trait SchemaContext: Send {
    /// Collections currently defined.
    fn collection_names(&self) -> Vec<String>;

    /// Create a collection.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::Constraint`] if it already exists.
    fn create_collection(&mut self, name: &str, options: &CollectionOptions) -> EngineResult<()>;

    /// Delete a collection and its indexes.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::NotFound`] if it does not exist.
    fn delete_collection(&mut self, name: &str) -> EngineResult<()>;

    /// Indexes defined on `collection`.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::NotFound`] if the collection does not exist.
    fn index_names(&self, collection: &str) -> EngineResult<Vec<String>>;

    /// Create an index on `collection`, indexing existing records.
    ///
    /// # Errors
    ///
    /// Fails if the collection is missing, the index exists, or existing
    /// records violate a unique index.
    fn create_index(&mut self, collection: &str, spec: &IndexSpec) -> EngineResult<()>;

    /// Delete an index.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::NotFound`] if the collection or index is missing.
    fn delete_index(&mut self, collection: &str, name: &str) -> EngineResult<()>;
}

/// An atomic unit of work over a fixed set of collections.
#[async_trait]
pub trait TransactionPort: Send + Sync {
    /// Access mode.
    fn mode(&self) -> TransactionMode;

    /// Collections the transaction may touch.
    fn scope(&self) -> Vec<String>;

    /// Accessor for a collection in scope.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::NotFound`] for names outside the scope.
    fn collection(&self, name: &str) -> EngineResult<Box<dyn CollectionPort>>;

    /// Abort the transaction, discarding every effect it has staged.
    fn abort(&self, reason: EngineError);

    /// Stop accepting requests and wait for completion.
    ///
    /// Resolves once every issued request has settled. Returns the abort
    /// cause if the transaction did not commit.
    async fn commit(self: Box<Self>) -> EngineResult<()>;
}

/// Read operations shared by collections and indexes.
pub trait SourcePort: Send + Sync {
    /// Collection or index name.
    fn name(&self) -> &str;

    /// Key path, if keys are in-line (always set for indexes).
    fn key_path(&self) -> Option<KeyPath>;

    /// First value selected by `query`.
    fn get(&self, query: &Query) -> Request<Option<Value>>;

    /// Primary key of the first record selected by `query`.
    fn get_key(&self, query: &Query) -> Request<Option<Key>>;

    /// Values selected by `query`, in key order.
    fn get_all(&self, query: &Query, limit: Option<u32>) -> Request<Vec<Value>>;

    /// Primary keys selected by `query`, in key order.
    fn get_all_keys(&self, query: &Query, limit: Option<u32>) -> Request<Vec<Key>>;

    /// Number of records selected by `query`.
    fn count(&self, query: &Query) -> Request<u64>;

    /// Cursor over records selected by `query`.
    fn open_cursor(&self, query: &Query, direction: Direction) -> Request<Box<dyn CursorPort>>;

    /// Cursor over keys selected by `query`, without values.
    fn open_key_cursor(&self, query: &Query, direction: Direction) -> Request<Box<dyn CursorPort>>;
}

/// Write-capable accessor, available for collections only.
pub trait CollectionPort: SourcePort {
    /// Whether the collection generates keys.
    fn auto_increment(&self) -> bool;

    /// Indexes defined on the collection.
    fn index_names(&self) -> Vec<String>;

    /// Accessor for one of the collection's indexes.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::NotFound`] if the index does not exist.
    fn index(&self, name: &str) -> EngineResult<Box<dyn IndexPort>>;

    /// Insert a record; fails if the key is taken.
    fn add(&self, value: Value, key: Option<Key>) -> Request<Key>;

    /// Insert or replace a record.
    fn put(&self, value: Value, key: Option<Key>) -> Request<Key>;

    /// Delete every record selected by `query`.
    fn delete(&self, query: &Query) -> Request<()>;

    /// Delete every record.
    fn clear(&self) -> Request<()>;
}

/// Index accessor.
pub trait IndexPort: SourcePort {
    /// Whether index keys must be unique.
    fn unique(&self) -> bool;

    /// Whether array keys produce one entry per element.
    fn multi_entry(&self) -> bool;
}

/// One position of a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRecord {
    /// Key at this position (the index key for index cursors).
    pub key: Key,
    /// Primary key of the record.
    pub primary_key: Key,
    /// Record value; `None` for key cursors.
    pub value: Option<Value>,
}

/// Forward-only cursor.
#[async_trait]
pub trait CursorPort: Send {
    /// Move `count` positions forward and return the record there.
    ///
    /// The first call with `count = 1` yields the first record. Returns
    /// `None` once the range is exhausted.
    async fn advance(&mut self, count: u32) -> EngineResult<Option<CursorRecord>>;
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Error recorded by a transaction, shared with every request it issued.
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot(Arc<Mutex<Option<EngineError>>>);

impl ErrorSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `error` unless an error is already recorded.
    pub fn set(&self, error: EngineError) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// The recorded error, if any.
    #[must_use]
    pub fn get(&self) -> Option<EngineError> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// An engine request whose result arrives later.
///
/// Awaiting a request (see [`crate::adapter`]) yields its result, or the
/// owning transaction's error if the engine dropped the request unsettled.
pub struct Request<T> {
    pub(crate) receiver: oneshot::Receiver<EngineResult<T>>,
    pub(crate) transaction_error: ErrorSlot,
}

/// The engine side of a [`Request`].
pub struct Responder<T> {
    sender: oneshot::Sender<EngineResult<T>>,
}

impl<T> Request<T> {
    /// Create a pending request bound to a transaction's error slot.
    #[must_use]
    pub fn channel(transaction_error: &ErrorSlot) -> (Responder<T>, Self) {
        let (sender, receiver) = oneshot::channel();
        (
            Responder { sender },
            Self {
                receiver,
                transaction_error: transaction_error.clone(),
            },
        )
    }

    /// A request that has already settled.
    #[must_use]
    pub fn ready(result: EngineResult<T>) -> Self {
        let (responder, request) = Self::channel(&ErrorSlot::new());
        responder.respond(result);
        request
    }
}

impl<T> Responder<T> {
    /// Settle the request. A request nobody awaits is silently dropped.
    pub fn respond(self, result: EngineResult<T>) {
        let _ = self.sender.send(result);
    }
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}

impl<T> std::fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}
