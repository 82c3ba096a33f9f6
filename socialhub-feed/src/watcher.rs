//! Cancellable subscription to a remote ordered collection.
//!
//! ```text
//! DocumentStore ──stream──► ChangeStream::next() ──► WatchEvent
//!                                ▲
//!                 CancelHandle ──┘ (cancel: stops delivery at once)
//! ```
//!
//! A stream is lazy and non-restartable. It ends after an error event or
//! after `cancel()`. Stale batches (sequence not newer than the last one
//! delivered) are dropped.

use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::document::{Direction, OrderBy, WatchEvent};
use crate::error::SubscriptionError;
use crate::ports::DocumentStore;

struct CancelState {
    collection: String,
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancels one subscription. Cloneable; cancelling twice is a no-op.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Stop delivery. Takes effect before this call returns: no event is
    /// yielded afterwards, even one already buffered.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::SeqCst) {
            log::info!("subscription to {} cancelled", self.state.collection);
            self.state.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// The event side of a subscription.
pub struct ChangeStream {
    inner: BoxStream<'static, WatchEvent>,
    state: Arc<CancelState>,
    last_sequence: Option<u64>,
    finished: bool,
}

impl ChangeStream {
    fn new(collection: &str, inner: BoxStream<'static, WatchEvent>) -> (Self, CancelHandle) {
        let state = Arc::new(CancelState {
            collection: collection.to_string(),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let handle = CancelHandle {
            state: state.clone(),
        };
        let stream = Self {
            inner,
            state,
            last_sequence: None,
            finished: false,
        };
        (stream, handle)
    }

    pub fn collection(&self) -> &str {
        &self.state.collection
    }

    pub fn is_finished(&self) -> bool {
        self.finished || self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Next event, or `None` once cancelled or ended.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            if self.finished {
                return None;
            }
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel
            // cannot slip between the check and the wait.
            notified.as_mut().enable();
            if self.state.cancelled.load(Ordering::SeqCst) {
                self.finished = true;
                return None;
            }

            let event = tokio::select! {
                biased;
                _ = &mut notified => None,
                event = self.inner.next() => event,
            };
            if self.state.cancelled.load(Ordering::SeqCst) {
                self.finished = true;
                return None;
            }

            match event {
                None => {
                    self.finished = true;
                    log::info!("subscription to {} closed by the remote", self.state.collection);
                    return None;
                }
                Some(WatchEvent::Error(error)) => {
                    self.finished = true;
                    log::warn!("subscription to {} failed: {error}", self.state.collection);
                    return Some(WatchEvent::Error(error));
                }
                Some(WatchEvent::Batch(batch)) => {
                    if let Some(last) = self.last_sequence {
                        if batch.sequence <= last {
                            log::warn!(
                                "dropping stale batch {} on {} (last delivered {last})",
                                batch.sequence,
                                self.state.collection
                            );
                            continue;
                        }
                    }
                    self.last_sequence = Some(batch.sequence);
                    return Some(WatchEvent::Batch(batch));
                }
            }
        }
    }

    /// Adapt into a `Stream` for combinator use.
    pub fn into_stream(self) -> BoxStream<'static, WatchEvent> {
        stream::unfold(self, |mut changes| async move {
            let event = changes.next().await?;
            Some((event, changes))
        })
        .boxed()
    }
}

/// Opens subscriptions against a [`DocumentStore`].
pub struct RemoteCollectionWatcher {
    store: Arc<dyn DocumentStore>,
}

impl RemoteCollectionWatcher {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Subscribe to `collection` ordered by `order_key`. A refused
    /// subscription is reported as the stream's only event.
    pub async fn subscribe(
        &self,
        collection: &str,
        order_key: &str,
        direction: Direction,
    ) -> (ChangeStream, CancelHandle) {
        let order_by = OrderBy::new(order_key, direction);
        let inner = match self.store.subscribe_collection(collection, &order_by).await {
            Ok(inner) => {
                log::info!("subscribed to {collection} ordered by {order_key} {direction:?}");
                inner
            }
            Err(source) => {
                let error = SubscriptionError::Remote {
                    collection: collection.to_string(),
                    source,
                };
                stream::once(async move { WatchEvent::Error(error) }).boxed()
            }
        };
        ChangeStream::new(collection, inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Change, ChangeBatch, Document};
    use crate::error::RemoteError;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    fn batch(sequence: u64, id: &str) -> WatchEvent {
        WatchEvent::Batch(ChangeBatch::new(
            sequence,
            vec![Change::Added(Document::new(id, json!({ "authorId": "u1" })))],
        ))
    }

    fn from_events(events: Vec<WatchEvent>) -> (ChangeStream, CancelHandle) {
        ChangeStream::new("posts", stream::iter(events).boxed())
    }

    #[tokio::test]
    async fn test_drops_stale_batches() {
        let (mut changes, _cancel) = from_events(vec![batch(1, "a"), batch(3, "b"), batch(2, "c"), batch(4, "d")]);
        let mut sequences = Vec::new();
        while let Some(WatchEvent::Batch(b)) = changes.next().await {
            sequences.push(b.sequence);
        }
        assert_eq!(sequences, vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let error = SubscriptionError::Interrupted("network".into());
        let (mut changes, _cancel) =
            from_events(vec![batch(1, "a"), WatchEvent::Error(error.clone()), batch(2, "b")]);
        assert!(matches!(changes.next().await, Some(WatchEvent::Batch(_))));
        assert_eq!(changes.next().await, Some(WatchEvent::Error(error)));
        assert_eq!(changes.next().await, None);
        assert!(changes.is_finished());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_immediate() {
        let (mut changes, cancel) = from_events(vec![batch(1, "a"), batch(2, "b")]);
        cancel.cancel();
        cancel.cancel();
        assert!(cancel.is_cancelled());
        assert_eq!(changes.next().await, None);
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_next() {
        let (mut changes, cancel) = ChangeStream::new("posts", stream::pending::<WatchEvent>().boxed());
        let waiter = tokio::spawn(async move { changes.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_refused_subscription_surfaces_as_event() {
        let store = crate::backend::MemoryDocumentStore::default();
        store.fail_subscriptions(true);
        let watcher = RemoteCollectionWatcher::new(Arc::new(store));

        let (mut changes, _cancel) = watcher.subscribe("posts", "timestamp", Direction::Descending).await;
        match changes.next().await {
            Some(WatchEvent::Error(SubscriptionError::Remote { collection, source })) => {
                assert_eq!(collection, "posts");
                assert!(matches!(source, RemoteError::Unavailable(_)));
            }
            other => panic!("expected subscription error, got {other:?}"),
        }
        assert_eq!(changes.next().await, None);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let (changes, _cancel) = from_events(vec![batch(1, "a"), batch(2, "b")]);
        let events: Vec<WatchEvent> = changes.into_stream().collect().await;
        assert_eq!(events.len(), 2);
    }
}
