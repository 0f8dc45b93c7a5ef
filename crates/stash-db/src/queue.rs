//! Operation queue.
//!
//! Reads and writes are queued as closures and run later, in submission
//! order, against a single transaction shared by the whole batch.

use tokio::sync::oneshot;

use crate::adapter::Pending;
use crate::engine::{CollectionPort, IndexPort, Request, TransactionMode, TransactionPort};
use crate::error::{StashError, StashResult};

/// Runs a queued operation, or rejects it when given an error.
///
/// Returning an error means the operation failed while issuing its request
/// and the shared transaction must be aborted.
type Operation =
    Box<dyn FnOnce(Result<&TransactionScope<'_>, StashError>) -> StashResult<()> + Send>;

/// A live transaction, restricted to the collections a batch declared.
pub(crate) struct TransactionScope<'a> {
    transaction: &'a dyn TransactionPort,
    allowed: Vec<String>,
}

impl<'a> TransactionScope<'a> {
    pub(crate) fn new(transaction: &'a dyn TransactionPort, allowed: Vec<String>) -> Self {
        Self {
            transaction,
            allowed,
        }
    }

    /// Accessor for `name`.
    ///
    /// Referencing a collection the batch never declared is a programming
    /// error and fails with [`StashError::Usage`].
    pub(crate) fn collection(&self, name: &str) -> StashResult<Box<dyn CollectionPort>> {
        if !self.allowed.iter().any(|allowed| allowed == name) {
            return Err(StashError::Usage(format!(
                "collection {name} is outside the transaction scope {:?}",
                self.allowed
            )));
        }
        self.transaction
            .collection(name)
            .map_err(StashError::RequestFailed)
    }

    /// Accessor for index `name` of `collection`.
    pub(crate) fn index(&self, collection: &str, name: &str) -> StashResult<Box<dyn IndexPort>> {
        self.collection(collection)?
            .index(name)
            .map_err(StashError::RequestFailed)
    }
}

/// A queued read or write.
pub(crate) struct OperationIntent {
    collection: String,
    mode: TransactionMode,
    operation: Operation,
}

impl OperationIntent {
    /// Queue-ready intent plus the future its result will arrive on.
    ///
    /// `issue` runs inside the commit pass and must only issue requests;
    /// it may not wait on anything.
    pub(crate) fn new<T, F>(
        collection: impl Into<String>,
        mode: TransactionMode,
        issue: F,
    ) -> (Self, Pending<T>)
    where
        T: Send + 'static,
        F: FnOnce(&TransactionScope<'_>) -> StashResult<Request<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let operation: Operation = Box::new(move |scope| match scope {
            Ok(scope) => match issue(scope) {
                Ok(request) => {
                    let _ = sender.send(Ok(request));
                    Ok(())
                },
                Err(err) => {
                    let _ = sender.send(Err(err.clone()));
                    Err(err)
                },
            },
            Err(err) => {
                let _ = sender.send(Err(err));
                Ok(())
            },
        });
        let intent = Self {
            collection: collection.into(),
            mode,
            operation,
        };
        (intent, Pending::new(receiver))
    }

    pub(crate) fn collection(&self) -> &str {
        &self.collection
    }

    pub(crate) fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Issue the operation's request against `scope`.
    pub(crate) fn run(self, scope: &TransactionScope<'_>) -> StashResult<()> {
        (self.operation)(Ok(scope))
    }

    /// Settle the operation's future with `err` without running it.
    pub(crate) fn reject(self, err: StashError) {
        let _ = (self.operation)(Err(err));
    }
}

impl std::fmt::Debug for OperationIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationIntent")
            .field("collection", &self.collection)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Ordered list of pending operations.
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    intents: Vec<OperationIntent>,
}

impl OperationQueue {
    pub(crate) fn enqueue(&mut self, intent: OperationIntent) {
        self.intents.push(intent);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.intents.len()
    }

    /// Remove every pending operation, returning them as a batch.
    pub(crate) fn drain(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Read-only iff every queued operation is read-only.
    pub(crate) fn implied_mode(&self) -> TransactionMode {
        if self
            .intents
            .iter()
            .all(|intent| intent.mode().is_read_only())
        {
            TransactionMode::ReadOnly
        } else {
            TransactionMode::ReadWrite
        }
    }

    /// Distinct collections touched, in first-seen order.
    pub(crate) fn implied_collections(&self) -> Vec<String> {
        let mut collections: Vec<String> = Vec::new();
        for intent in &self.intents {
            if !collections.iter().any(|seen| seen == intent.collection()) {
                collections.push(intent.collection().to_owned());
            }
        }
        collections
    }

    pub(crate) fn into_intents(self) -> Vec<OperationIntent> {
        self.intents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorSlot;
    use crate::error::EngineError;

    fn noop(collection: &str, mode: TransactionMode) -> OperationIntent {
        OperationIntent::new(collection, mode, |_| Ok(Request::ready(Ok(())))).0
    }

    #[test]
    fn test_implied_mode() {
        let mut queue = OperationQueue::default();
        queue.enqueue(noop("a", TransactionMode::ReadOnly));
        queue.enqueue(noop("b", TransactionMode::ReadOnly));
        assert_eq!(queue.implied_mode(), TransactionMode::ReadOnly);

        queue.enqueue(noop("a", TransactionMode::ReadWrite));
        assert_eq!(queue.implied_mode(), TransactionMode::ReadWrite);
    }

    #[test]
    fn test_implied_collections_first_seen_order() {
        let mut queue = OperationQueue::default();
        for name in ["b", "a", "b", "c", "a"] {
            queue.enqueue(noop(name, TransactionMode::ReadOnly));
        }
        assert_eq!(queue.implied_collections(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_drain_empties_queue() {
        let mut queue = OperationQueue::default();
        queue.enqueue(noop("a", TransactionMode::ReadOnly));
        queue.enqueue(noop("a", TransactionMode::ReadWrite));
        let batch = queue.drain();
        assert!(queue.is_empty());
        assert_eq!(batch.len(), 2);
        let modes: Vec<_> = batch
            .into_intents()
            .iter()
            .map(OperationIntent::mode)
            .collect();
        assert_eq!(
            modes,
            vec![TransactionMode::ReadOnly, TransactionMode::ReadWrite]
        );
    }

    #[tokio::test]
    async fn test_reject_settles_future() {
        let (intent, pending) =
            OperationIntent::new("a", TransactionMode::ReadOnly, |_| Ok(Request::ready(Ok(1))));
        intent.reject(StashError::Engine(EngineError::Internal("open failed".into())));
        assert_eq!(
            pending.await.unwrap_err(),
            StashError::Engine(EngineError::Internal("open failed".into()))
        );
    }

    #[tokio::test]
    async fn test_issue_error_settles_future_and_reports() {
        struct NoTransaction;

        #[async_trait::async_trait]
        impl TransactionPort for NoTransaction {
            fn mode(&self) -> TransactionMode {
                TransactionMode::ReadOnly
            }
            fn scope(&self) -> Vec<String> {
                Vec::new()
            }
            fn collection(&self, name: &str) -> crate::error::EngineResult<Box<dyn CollectionPort>> {
                Err(EngineError::NotFound(name.to_owned()))
            }
            fn abort(&self, _: EngineError) {}
            async fn commit(self: Box<Self>) -> crate::error::EngineResult<()> {
                Ok(())
            }
        }

        let transaction = NoTransaction;
        let scope = TransactionScope::new(&transaction, vec!["a".to_owned()]);

        let (outside, outside_result) = OperationIntent::new("b", TransactionMode::ReadOnly, |scope| {
            scope.collection("b")?;
            Ok(Request::ready(Ok(())))
        });
        assert!(matches!(outside.run(&scope), Err(StashError::Usage(_))));
        assert!(matches!(outside_result.await, Err(StashError::Usage(_))));

        let (inside, inside_result) = OperationIntent::new("a", TransactionMode::ReadOnly, |scope| {
            scope.collection("a")?;
            Ok(Request::ready(Ok(())))
        });
        assert!(inside.run(&scope).is_err());
        assert!(matches!(
            inside_result.await,
            Err(StashError::RequestFailed(EngineError::NotFound(_)))
        ));

        let (fine, fine_result) = OperationIntent::new("a", TransactionMode::ReadOnly, |_| {
            let (responder, request) = Request::channel(&ErrorSlot::new());
            responder.respond(Ok(7));
            Ok(request)
        });
        fine.run(&scope).unwrap();
        assert_eq!(fine_result.await.unwrap(), 7);
    }
}
