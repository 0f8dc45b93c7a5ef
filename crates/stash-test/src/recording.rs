//! A storage engine wrapper that records what the coordinator asks of it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use stash_db::engine::{
    CollectionPort, MemoryEngine, SchemaContext, SessionPort, StorageEngine, TransactionMode,
    TransactionPort, UpgradeCallback, UpgradeEvent,
};
use stash_db::{EngineError, EngineResult};

/// One interaction with the wrapped engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A session opened.
    Open {
        /// Database name.
        database: String,
        /// Version the caller asked for.
        requested: Option<u64>,
        /// Version the session opened at.
        version: u64,
    },
    /// An open failed.
    OpenFailed {
        /// Database name.
        database: String,
        /// Reported error.
        error: EngineError,
    },
    /// The upgrade callback ran.
    Upgrade {
        /// Database name.
        database: String,
        /// Version before the upgrade.
        old_version: u64,
        /// Version after the upgrade.
        new_version: u64,
    },
    /// A transaction began.
    Transaction(TransactionRecord),
    /// A transaction finished.
    Completed {
        /// Database name.
        database: String,
        /// `Err` carries the abort cause.
        outcome: Result<(), EngineError>,
    },
    /// A session closed.
    Close {
        /// Database name.
        database: String,
    },
    /// A database was deleted.
    Delete {
        /// Database name.
        database: String,
    },
}

/// Scope and mode of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Database name.
    pub database: String,
    /// Collections the transaction was opened over, in request order.
    pub collections: Vec<String>,
    /// Access mode.
    pub mode: TransactionMode,
}

#[derive(Debug, Default)]
struct Shared {
    events: Mutex<Vec<EngineEvent>>,
    failures: Mutex<VecDeque<EngineError>>,
}

impl Shared {
    fn push(&self, event: EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Wraps any [`StorageEngine`], recording sessions, upgrades and
/// transactions, and optionally failing upcoming opens.
#[derive(Debug)]
pub struct RecordingEngine<E = MemoryEngine> {
    inner: Arc<E>,
    shared: Arc<Shared>,
}

impl RecordingEngine<MemoryEngine> {
    /// Record a fresh [`MemoryEngine`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::wrap(Arc::new(MemoryEngine::new()))
    }
}

impl<E: StorageEngine> RecordingEngine<E> {
    /// Record calls made to `inner`.
    #[must_use]
    pub fn wrap(inner: Arc<E>) -> Self {
        Self {
            inner,
            shared: Arc::new(Shared::default()),
        }
    }

    /// The wrapped engine.
    #[must_use]
    pub fn inner(&self) -> &Arc<E> {
        &self.inner
    }

    /// Every event so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget every recorded event.
    pub fn clear(&self) {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Transactions begun so far.
    #[must_use]
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::Transaction(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    /// Upgrades run so far, as `(old, new)` version pairs.
    #[must_use]
    pub fn upgrades(&self) -> Vec<(u64, u64)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::Upgrade {
                    old_version,
                    new_version,
                    ..
                } => Some((old_version, new_version)),
                _ => None,
            })
            .collect()
    }

    /// Number of successful opens.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, EngineEvent::Open { .. }))
            .count()
    }

    /// Fail the next open with `error`. Calls queue up.
    pub fn fail_next_open(&self, error: EngineError) {
        self.shared
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    fn take_failure(&self) -> Option<EngineError> {
        self.shared
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

#[async_trait]
impl<E: StorageEngine + 'static> StorageEngine for RecordingEngine<E> {
    async fn open(
        &self,
        name: &str,
        version: Option<u64>,
        upgrade: Option<&mut UpgradeCallback<'_>>,
    ) -> EngineResult<Box<dyn SessionPort>> {
        if let Some(error) = self.take_failure() {
            self.shared.push(EngineEvent::OpenFailed {
                database: name.to_owned(),
                error: error.clone(),
            });
            return Err(error);
        }

        let opened = match upgrade {
            Some(callback) => {
                let shared = Arc::clone(&self.shared);
                let database = name.to_owned();
                let mut recording = move |schema: &mut dyn SchemaContext,
                                          event: UpgradeEvent|
                      -> EngineResult<()> {
                    shared.push(EngineEvent::Upgrade {
                        database: database.clone(),
                        old_version: event.old_version,
                        new_version: event.new_version,
                    });
                    callback(schema, event)
                };
                let recording: &mut UpgradeCallback<'_> = &mut recording;
                self.inner.open(name, version, Some(recording)).await
            },
            None => self.inner.open(name, version, None).await,
        };

        match opened {
            Ok(session) => {
                self.shared.push(EngineEvent::Open {
                    database: name.to_owned(),
                    requested: version,
                    version: session.version(),
                });
                Ok(Box::new(RecordingSession {
                    inner: session,
                    shared: Arc::clone(&self.shared),
                }))
            },
            Err(error) => {
                self.shared.push(EngineEvent::OpenFailed {
                    database: name.to_owned(),
                    error: error.clone(),
                });
                Err(error)
            },
        }
    }

    async fn delete_database(&self, name: &str) -> EngineResult<()> {
        self.inner.delete_database(name).await?;
        self.shared.push(EngineEvent::Delete {
            database: name.to_owned(),
        });
        Ok(())
    }
}

struct RecordingSession {
    inner: Box<dyn SessionPort>,
    shared: Arc<Shared>,
}

#[async_trait]
impl SessionPort for RecordingSession {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn version(&self) -> u64 {
        self.inner.version()
    }

    fn collection_names(&self) -> Vec<String> {
        self.inner.collection_names()
    }

    async fn transaction(
        &self,
        collections: &[String],
        mode: TransactionMode,
    ) -> EngineResult<Box<dyn TransactionPort>> {
        let transaction = self.inner.transaction(collections, mode).await?;
        self.shared
            .push(EngineEvent::Transaction(TransactionRecord {
                database: self.inner.name().to_owned(),
                collections: collections.to_vec(),
                mode,
            }));
        Ok(Box::new(RecordingTransaction {
            database: self.inner.name().to_owned(),
            inner: transaction,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn close(self: Box<Self>) {
        let database = self.inner.name().to_owned();
        self.inner.close();
        self.shared.push(EngineEvent::Close { database });
    }
}

struct RecordingTransaction {
    database: String,
    inner: Box<dyn TransactionPort>,
    shared: Arc<Shared>,
}

#[async_trait]
impl TransactionPort for RecordingTransaction {
    fn mode(&self) -> TransactionMode {
        self.inner.mode()
    }

    fn scope(&self) -> Vec<String> {
        self.inner.scope()
    }

    fn collection(&self, name: &str) -> EngineResult<Box<dyn CollectionPort>> {
        self.inner.collection(name)
    }

    fn abort(&self, reason: EngineError) {
        self.inner.abort(reason);
    }

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        let Self {
            database,
            inner,
            shared,
        } = *self;
        let outcome = inner.commit().await;
        shared.push(EngineEvent::Completed {
            database,
            outcome: outcome.clone(),
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_open_and_close() {
        let engine = RecordingEngine::in_memory();
        let session = engine.open("db", None, None).await.unwrap();
        session.close();

        assert_eq!(
            engine.events(),
            vec![
                EngineEvent::Open {
                    database: "db".into(),
                    requested: None,
                    version: 1,
                },
                EngineEvent::Close {
                    database: "db".into(),
                },
            ]
        );
        assert!(engine.upgrades().is_empty());
    }

    #[tokio::test]
    async fn test_records_callback_upgrades() {
        let engine = RecordingEngine::in_memory();
        let mut upgrade = |schema: &mut dyn SchemaContext, _: UpgradeEvent| -> EngineResult<()> {
            schema.create_collection("kv", &stash_db::CollectionOptions::new())
        };
        let callback: &mut UpgradeCallback<'_> = &mut upgrade;
        engine
            .open("db", Some(3), Some(callback))
            .await
            .unwrap()
            .close();
        assert_eq!(engine.upgrades(), vec![(0, 3)]);
        assert_eq!(engine.opens(), 1);
    }

    #[tokio::test]
    async fn test_records_transactions() {
        let engine = RecordingEngine::in_memory();
        let mut upgrade = |schema: &mut dyn SchemaContext, _: UpgradeEvent| -> EngineResult<()> {
            schema.create_collection("kv", &stash_db::CollectionOptions::new())
        };
        let callback: &mut UpgradeCallback<'_> = &mut upgrade;
        let session = engine.open("db", Some(1), Some(callback)).await.unwrap();
        let transaction = session
            .transaction(&["kv".to_owned()], TransactionMode::ReadOnly)
            .await
            .unwrap();
        transaction.commit().await.unwrap();
        session.close();

        assert_eq!(
            engine.transactions(),
            vec![TransactionRecord {
                database: "db".into(),
                collections: vec!["kv".into()],
                mode: TransactionMode::ReadOnly,
            }]
        );
        assert!(engine.events().contains(&EngineEvent::Completed {
            database: "db".into(),
            outcome: Ok(()),
        }));
    }

    #[tokio::test]
    async fn test_injected_open_failure() {
        let engine = RecordingEngine::in_memory();
        engine.fail_next_open(EngineError::Internal("disk on fire".into()));

        let first = engine.open("db", None, None).await;
        assert!(matches!(first, Err(EngineError::Internal(_))));
        assert!(engine.open("db", None, None).await.is_ok());
        assert_eq!(engine.opens(), 1);

        engine.clear();
        assert!(engine.events().is_empty());
    }
}
