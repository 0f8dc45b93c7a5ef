//! Adapts engine requests and cursors to futures and streams.
//!
//! A [`Request`] resolves to its own result. When the engine drops a request
//! without settling it, the owning transaction's error is reported instead,
//! and failing that a generic "request failed" error.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::engine::{CursorPort, CursorRecord, ErrorSlot, Request};
use crate::error::{EngineError, EngineResult, StashError, StashResult};
use crate::key::Key;

fn settle<T>(
    outcome: Result<EngineResult<T>, oneshot::error::RecvError>,
    transaction_error: &ErrorSlot,
) -> StashResult<T> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err @ EngineError::Aborted(_))) => Err(StashError::TransactionAborted(err)),
        Ok(Err(err)) => Err(StashError::RequestFailed(err)),
        Err(_) => Err(match transaction_error.get() {
            Some(err) => StashError::TransactionAborted(err),
            None => StashError::RequestFailed(EngineError::Internal("request failed".into())),
        }),
    }
}

impl<T> Future for Request<T> {
    type Output = StashResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = ready!(Pin::new(&mut this.receiver).poll(cx));
        Poll::Ready(settle(outcome, &this.transaction_error))
    }
}

// ---------------------------------------------------------------------------
// Pending
// ---------------------------------------------------------------------------

/// Fires its callback once: on [`fire`](Self::fire) or on drop.
///
/// Lets the database know its caller has stopped issuing work, by awaiting
/// or by discarding a future.
#[derive(Default)]
pub(crate) struct FlushTrigger(Option<Box<dyn FnOnce() + Send + Sync>>);

impl FlushTrigger {
    pub(crate) fn new(callback: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(callback)))
    }

    pub(crate) fn fire(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

impl Drop for FlushTrigger {
    fn drop(&mut self) {
        self.fire();
    }
}

/// The result of a queued collection or index operation.
///
/// The operation is queued when the method returns, whether or not this
/// future is awaited. Dropping it discards the result, not the operation.
pub struct Pending<T> {
    state: PendingState<T>,
    trigger: FlushTrigger,
}

enum PendingState<T> {
    /// Waiting for the commit pass to issue the engine request.
    Issuing(oneshot::Receiver<StashResult<Request<T>>>),
    /// Waiting for the engine to settle the request.
    Requested(Request<T>),
}

impl<T> Pending<T> {
    pub(crate) fn new(issued: oneshot::Receiver<StashResult<Request<T>>>) -> Self {
        Self {
            state: PendingState::Issuing(issued),
            trigger: FlushTrigger::default(),
        }
    }

    /// Fire `trigger` when this future is first polled or dropped.
    pub(crate) fn with_trigger(mut self, trigger: FlushTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// A future bound to a request that has already been issued.
    pub(crate) fn issued(request: Request<T>) -> Self {
        Self {
            state: PendingState::Requested(request),
            trigger: FlushTrigger::default(),
        }
    }

    /// A future that fails with `err`.
    pub(crate) fn failed(err: StashError) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(err));
        Self::new(receiver)
    }
}

impl<T> Future for Pending<T> {
    type Output = StashResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.trigger.fire();
        loop {
            match &mut this.state {
                PendingState::Issuing(receiver) => match ready!(Pin::new(receiver).poll(cx)) {
                    Ok(Ok(request)) => this.state = PendingState::Requested(request),
                    Ok(Err(err)) => return Poll::Ready(Err(err)),
                    Err(_) => {
                        return Poll::Ready(Err(StashError::RequestFailed(EngineError::Internal(
                            "request dropped before it was issued".into(),
                        ))));
                    },
                },
                PendingState::Requested(request) => return Pin::new(request).poll(cx),
            }
        }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            PendingState::Issuing(_) => "issuing",
            PendingState::Requested(_) => "requested",
        };
        f.debug_struct("Pending").field("state", &state).finish()
    }
}

// ---------------------------------------------------------------------------
// Cursor sequences
// ---------------------------------------------------------------------------

/// A record yielded by a value cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorEntry {
    /// Key at this position (the index key for index cursors).
    pub key: Key,
    /// Primary key of the record.
    pub primary_key: Key,
    /// The stored value.
    pub value: Value,
}

impl CursorEntry {
    /// Deserialize the value into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`StashError::Serialization`] if the value does not fit `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> StashResult<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| StashError::Serialization(e.to_string()))
    }
}

/// A key yielded by a key cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// Key at this position (the index key for index cursors).
    pub key: Key,
    /// Primary key of the record.
    pub primary_key: Key,
}

/// Items a [`CursorSequence`] can yield.
pub trait CursorItem: Sized + Send + 'static {
    /// Convert an engine cursor record.
    ///
    /// # Errors
    ///
    /// Fails if the record lacks a part this item needs.
    fn from_record(record: CursorRecord) -> StashResult<Self>;
}

impl CursorItem for CursorEntry {
    fn from_record(record: CursorRecord) -> StashResult<Self> {
        let value = record.value.ok_or_else(|| {
            StashError::RequestFailed(EngineError::Internal("cursor record has no value".into()))
        })?;
        Ok(Self {
            key: record.key,
            primary_key: record.primary_key,
            value,
        })
    }
}

impl CursorItem for KeyEntry {
    fn from_record(record: CursorRecord) -> StashResult<Self> {
        Ok(Self {
            key: record.key,
            primary_key: record.primary_key,
        })
    }
}

enum CursorState {
    Opening(Pending<Box<dyn CursorPort>>),
    Open(Box<dyn CursorPort>),
    Finished,
}

/// A lazy, forward-only walk over a range scan.
///
/// Each pull advances the underlying cursor. The sequence ends for good
/// when the range is exhausted or an error is yielded. Dropping it early
/// abandons the scan; that is not an error.
pub struct CursorSequence<T> {
    state: CursorState,
    _item: PhantomData<fn() -> T>,
}

impl<T: CursorItem> CursorSequence<T> {
    pub(crate) fn new(opening: Pending<Box<dyn CursorPort>>) -> Self {
        Self {
            state: CursorState::Opening(opening),
            _item: PhantomData,
        }
    }

    /// The next item, or `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<StashResult<T>> {
        self.advance(1).await
    }

    /// Skip `count - 1` items and return the one after them.
    pub async fn advance(&mut self, count: u32) -> Option<StashResult<T>> {
        if let CursorState::Opening(opening) = &mut self.state {
            match opening.await {
                Ok(cursor) => self.state = CursorState::Open(cursor),
                Err(err) => {
                    self.state = CursorState::Finished;
                    return Some(Err(err));
                },
            }
        }
        let CursorState::Open(cursor) = &mut self.state else {
            return None;
        };

        match cursor.advance(count).await {
            Ok(Some(record)) => Some(T::from_record(record)),
            Ok(None) => {
                self.state = CursorState::Finished;
                None
            },
            Err(err) => {
                self.state = CursorState::Finished;
                Some(Err(StashError::RequestFailed(err)))
            },
        }
    }

    /// Convert into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = StashResult<T>> + Send {
        futures::stream::unfold(self, |mut sequence| async move {
            let item = sequence.next().await?;
            Some((item, sequence))
        })
    }
}

impl<T> std::fmt::Debug for CursorSequence<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            CursorState::Opening(_) => "opening",
            CursorState::Open(_) => "open",
            CursorState::Finished => "finished",
        };
        f.debug_struct("CursorSequence")
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;

    struct VecCursor(std::vec::IntoIter<CursorRecord>);

    #[async_trait]
    impl CursorPort for VecCursor {
        async fn advance(&mut self, count: u32) -> EngineResult<Option<CursorRecord>> {
            Ok(self.0.nth(usize::try_from(count.saturating_sub(1)).unwrap()))
        }
    }

    fn records(n: i64) -> Vec<CursorRecord> {
        (1..=n)
            .map(|i| CursorRecord {
                key: Key::Int(i),
                primary_key: Key::Int(i),
                value: Some(json!(i.saturating_mul(10))),
            })
            .collect()
    }

    fn sequence<T: CursorItem>(n: i64) -> CursorSequence<T> {
        let cursor: Box<dyn CursorPort> = Box::new(VecCursor(records(n).into_iter()));
        CursorSequence::new(Pending::issued(Request::ready(Ok(cursor))))
    }

    #[tokio::test]
    async fn test_request_resolves_with_result() {
        let request = Request::ready(Ok(5));
        assert_eq!(request.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_request_error_mapping() {
        let failed: Request<()> = Request::ready(Err(EngineError::Constraint("dup".into())));
        assert_eq!(
            failed.await.unwrap_err(),
            StashError::RequestFailed(EngineError::Constraint("dup".into()))
        );

        let aborted: Request<()> = Request::ready(Err(EngineError::Aborted("x".into())));
        assert!(matches!(
            aborted.await.unwrap_err(),
            StashError::TransactionAborted(_)
        ));
    }

    #[tokio::test]
    async fn test_dropped_request_falls_back_to_transaction_error() {
        let slot = ErrorSlot::new();
        let (responder, request) = Request::<u8>::channel(&slot);
        slot.set(EngineError::Aborted("tx failed".into()));
        drop(responder);
        assert_eq!(
            request.await.unwrap_err(),
            StashError::TransactionAborted(EngineError::Aborted("tx failed".into()))
        );

        let (responder, request) = Request::<u8>::channel(&ErrorSlot::new());
        drop(responder);
        assert_eq!(
            request.await.unwrap_err(),
            StashError::RequestFailed(EngineError::Internal("request failed".into()))
        );
    }

    #[tokio::test]
    async fn test_pending_waits_for_issue() {
        let (sender, receiver) = oneshot::channel();
        let pending = Pending::new(receiver);
        let waiter = tokio::spawn(pending);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        sender.send(Ok(Request::ready(Ok("done")))).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_pending_failures() {
        let failed: Pending<()> = Pending::failed(StashError::Usage("bad".into()));
        assert_eq!(failed.await.unwrap_err(), StashError::Usage("bad".into()));

        let (sender, receiver) = oneshot::channel::<StashResult<Request<()>>>();
        drop(sender);
        assert!(matches!(
            Pending::new(receiver).await.unwrap_err(),
            StashError::RequestFailed(EngineError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_trigger_fires_once_on_poll_or_drop() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = |fired: &Arc<AtomicUsize>| {
            let fired = Arc::clone(fired);
            FlushTrigger::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        let polled = Pending::issued(Request::ready(Ok(1))).with_trigger(counter(&fired));
        assert_eq!(polled.await.unwrap(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let dropped = Pending::issued(Request::ready(Ok(2))).with_trigger(counter(&fired));
        drop(dropped);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cursor_sequence_yields_in_order_then_ends() {
        let mut seq: CursorSequence<CursorEntry> = sequence(2);
        let first = seq.next().await.unwrap().unwrap();
        assert_eq!(first.key, Key::Int(1));
        assert_eq!(first.value_as::<i64>().unwrap(), 10);
        let second = seq.next().await.unwrap().unwrap();
        assert_eq!(second.value, json!(20));
        assert!(seq.next().await.is_none());
        assert!(seq.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cursor_sequence_advance_skips() {
        let mut seq: CursorSequence<KeyEntry> = sequence(5);
        assert_eq!(seq.advance(3).await.unwrap().unwrap().key, Key::Int(3));
        assert_eq!(seq.next().await.unwrap().unwrap().key, Key::Int(4));
    }

    #[tokio::test]
    async fn test_cursor_sequence_open_failure_ends_sequence() {
        let mut seq: CursorSequence<KeyEntry> = CursorSequence::new(Pending::failed(
            StashError::TransactionAborted(EngineError::Aborted("gone".into())),
        ));
        assert!(seq.next().await.unwrap().is_err());
        assert!(seq.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cursor_stream_collects() {
        let keys: Vec<Key> = sequence::<KeyEntry>(3)
            .into_stream()
            .map(|entry| entry.unwrap().key)
            .collect()
            .await;
        assert_eq!(keys, vec![Key::Int(1), Key::Int(2), Key::Int(3)]);
    }

    #[tokio::test]
    async fn test_early_drop_is_not_an_error() {
        let mut seq: CursorSequence<CursorEntry> = sequence(2);
        assert!(seq.next().await.unwrap().is_ok());
        drop(seq);
    }
}
