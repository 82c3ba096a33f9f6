//! In-memory document store with realtime subscriptions.
//!
//! Every applied write advances a server sequence, resolves server
//! timestamps from a strictly increasing clock and publishes a
//! single-change [`ChangeBatch`] on the collection's channel. Faults can
//! be injected per document, per collection or for subscriptions.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use crate::backend::broadcast::ChannelRegistry;
use crate::document::{
    Change, ChangeBatch, Direction, Document, FieldWrites, Fields, OrderBy, WatchEvent,
};
use crate::error::{RemoteError, SubscriptionError};
use crate::model::Timestamp;
use crate::ports::DocumentStore;

/// Kind of an applied write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Set,
    Update,
    Delete,
}

/// One applied write, recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub collection: String,
    pub id: String,
    pub sequence: u64,
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Events buffered per subscriber before it lags
    pub channel_capacity: usize,
    /// Largest id list accepted by `get_batch`
    pub max_batch_size: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            max_batch_size: 10,
        }
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    failing_reads: HashSet<(String, String)>,
    failing_writes: HashSet<(String, String)>,
    failing_collections: HashSet<String>,
    fail_subscriptions: bool,
    write_latency: Option<Duration>,
}

/// Server clock: a write sequence plus strictly increasing millis.
struct ServerClock {
    sequence: AtomicU64,
    last_millis: AtomicI64,
}

impl ServerClock {
    fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            last_millis: AtomicI64::new(0),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn next_timestamp(&self) -> Timestamp {
        let now = Timestamp::now().as_millis();
        let previous = self
            .last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        Timestamp::from_millis(now.max(previous + 1))
    }
}

/// In-memory [`DocumentStore`].
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Fields>>>,
    channels: ChannelRegistry,
    clock: ServerClock,
    faults: Mutex<FaultPlan>,
    write_log: Mutex<Vec<WriteRecord>>,
    config: MemoryStoreConfig,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryDocumentStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            channels: ChannelRegistry::new(config.channel_capacity),
            clock: ServerClock::new(),
            faults: Mutex::new(FaultPlan::default()),
            write_log: Mutex::new(Vec::new()),
            config,
        }
    }

    // ─── Fault injection ─────────────────────────────────────────

    /// Reads touching this document fail with `Unavailable`.
    pub fn fail_reads_of(&self, collection: &str, id: &str) {
        lock(&self.faults)
            .failing_reads
            .insert((collection.to_string(), id.to_string()));
    }

    /// Writes to this document fail with `Unavailable`.
    pub fn fail_writes_to(&self, collection: &str, id: &str) {
        lock(&self.faults)
            .failing_writes
            .insert((collection.to_string(), id.to_string()));
    }

    /// Every write to the collection fails with `PermissionDenied`.
    pub fn fail_collection_writes(&self, collection: &str) {
        lock(&self.faults)
            .failing_collections
            .insert(collection.to_string());
    }

    pub fn fail_subscriptions(&self, fail: bool) {
        lock(&self.faults).fail_subscriptions = fail;
    }

    /// Delay every write before it is applied.
    pub fn set_write_latency(&self, latency: Option<Duration>) {
        lock(&self.faults).write_latency = latency;
    }

    pub fn clear_faults(&self) {
        *lock(&self.faults) = FaultPlan::default();
    }

    /// Break every live subscription of `collection`.
    pub async fn interrupt_subscriptions(&self, collection: &str, reason: &str) -> usize {
        let event = WatchEvent::Error(SubscriptionError::Interrupted(reason.to_string()));
        self.channels.publish(collection, event).await
    }

    // ─── Inspection ──────────────────────────────────────────────

    pub fn write_log(&self) -> Vec<WriteRecord> {
        lock(&self.write_log).clone()
    }

    pub fn writes_to(&self, collection: &str) -> Vec<WriteRecord> {
        lock(&self.write_log)
            .iter()
            .filter(|w| w.collection == collection)
            .cloned()
            .collect()
    }

    pub fn clear_write_log(&self) {
        lock(&self.write_log).clear();
    }

    pub async fn document(&self, collection: &str, id: &str) -> Option<Document> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document {
                id: id.to_string(),
                fields: fields.clone(),
            })
    }

    pub async fn document_count(&self, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(collection).map_or(0, BTreeMap::len)
    }

    pub async fn subscriber_count(&self, collection: &str) -> usize {
        self.channels
            .get(collection)
            .await
            .map_or(0, |c| c.subscriber_count())
    }

    pub fn sequence(&self) -> u64 {
        self.clock.current_sequence()
    }

    // ─── Internals ───────────────────────────────────────────────

    fn check_write(&self, collection: &str, id: &str) -> Result<Option<Duration>, RemoteError> {
        let faults = lock(&self.faults);
        if faults.failing_collections.contains(collection) {
            return Err(RemoteError::PermissionDenied(format!(
                "writes to {collection} are rejected"
            )));
        }
        if faults
            .failing_writes
            .contains(&(collection.to_string(), id.to_string()))
        {
            return Err(RemoteError::Unavailable(format!(
                "write to {collection}/{id} failed"
            )));
        }
        Ok(faults.write_latency)
    }

    fn check_reads(&self, collection: &str, ids: &[String]) -> Result<(), RemoteError> {
        let faults = lock(&self.faults);
        if let Some(id) = ids
            .iter()
            .find(|id| faults.failing_reads.contains(&(collection.to_string(), (*id).clone())))
        {
            return Err(RemoteError::Unavailable(format!(
                "read of {collection}/{id} failed"
            )));
        }
        Ok(())
    }

    async fn apply(&self, op: WriteOp, collection: &str, id: &str, writes: Option<FieldWrites>) -> Result<(), RemoteError> {
        if let Some(latency) = self.check_write(collection, id)? {
            tokio::time::sleep(latency).await;
        }

        // Publishing under the write lock keeps batches in sequence order
        // and lets subscribe() snapshot without missing a write.
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();

        let change = match op {
            WriteOp::Set => {
                let mut fields = Fields::new();
                if let Some(writes) = &writes {
                    writes.apply_to(&mut fields, self.clock.next_timestamp());
                }
                let existed = docs.insert(id.to_string(), fields.clone()).is_some();
                let doc = Document {
                    id: id.to_string(),
                    fields,
                };
                if existed {
                    Change::Modified(doc)
                } else {
                    Change::Added(doc)
                }
            }
            WriteOp::Update => {
                let fields = docs.get_mut(id).ok_or_else(|| RemoteError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
                if let Some(writes) = &writes {
                    writes.apply_to(fields, self.clock.next_timestamp());
                }
                Change::Modified(Document {
                    id: id.to_string(),
                    fields: fields.clone(),
                })
            }
            WriteOp::Delete => {
                if docs.remove(id).is_none() {
                    return Ok(());
                }
                Change::Removed(id.to_string())
            }
        };

        let sequence = self.clock.next_sequence();
        lock(&self.write_log).push(WriteRecord {
            op,
            collection: collection.to_string(),
            id: id.to_string(),
            sequence,
        });
        let delivered = self
            .channels
            .publish(collection, WatchEvent::Batch(ChangeBatch::new(sequence, vec![change])))
            .await;
        log::debug!("{op:?} {collection}/{id} seq={sequence} delivered to {delivered}");
        Ok(())
    }
}

fn order_value(fields: &Fields, field: &str) -> i64 {
    fields.get(field).and_then(Value::as_i64).unwrap_or(i64::MIN)
}

/// Turn a broadcast receiver into a stream that ends after the first
/// error event, on lag, or when the channel closes.
fn receiver_stream(rx: broadcast::Receiver<WatchEvent>) -> BoxStream<'static, WatchEvent> {
    stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        match rx.recv().await {
            Ok(event) => {
                let broken = matches!(event, WatchEvent::Error(_));
                Some((event, if broken { None } else { Some(rx) }))
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                Some((WatchEvent::Error(SubscriptionError::Lagged(n)), None))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
    .boxed()
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn subscribe_collection(
        &self,
        collection: &str,
        order_by: &OrderBy,
    ) -> Result<BoxStream<'static, WatchEvent>, RemoteError> {
        let refused = lock(&self.faults).fail_subscriptions;
        if refused {
            return Err(RemoteError::Unavailable(format!(
                "cannot subscribe to {collection}"
            )));
        }

        let collections = self.collections.read().await;
        let rx = self.channels.get_or_create(collection).await.subscribe();

        let mut docs: Vec<Document> = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        docs.sort_by_key(|d| order_value(&d.fields, &order_by.field));
        if order_by.direction == Direction::Descending {
            docs.reverse();
        }
        let initial = ChangeBatch::new(
            self.clock.current_sequence(),
            docs.into_iter().map(Change::Added).collect(),
        );
        drop(collections);

        log::info!("subscription opened on {collection} ({} documents)", initial.len());
        Ok(stream::once(async move { WatchEvent::Batch(initial) })
            .chain(receiver_stream(rx))
            .boxed())
    }

    async fn get_batch(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, RemoteError> {
        if ids.len() > self.config.max_batch_size {
            return Err(RemoteError::InvalidArgument(format!(
                "batch of {} exceeds limit {}",
                ids.len(),
                self.config.max_batch_size
            )));
        }
        self.check_reads(collection, ids)?;

        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| {
                docs.get(id).map(|fields| Document {
                    id: id.clone(),
                    fields: fields.clone(),
                })
            })
            .collect())
    }

    async fn write_document(&self, collection: &str, id: &str, writes: FieldWrites) -> Result<(), RemoteError> {
        self.apply(WriteOp::Set, collection, id, Some(writes)).await
    }

    async fn update_document(&self, collection: &str, id: &str, writes: FieldWrites) -> Result<(), RemoteError> {
        self.apply(WriteOp::Update, collection, id, Some(writes)).await
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.apply(WriteOp::Delete, collection, id, None).await
    }

    async fn query_ids(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<String>, RemoteError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| fields.get(field) == Some(value))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    async fn next(stream: &mut BoxStream<'static, WatchEvent>) -> WatchEvent {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream stalled")
            .expect("stream ended")
    }

    fn by_timestamp() -> OrderBy {
        OrderBy::new("timestamp", Direction::Descending)
    }

    #[tokio::test]
    async fn test_write_then_get_batch() {
        let store = MemoryDocumentStore::default();
        store
            .write_document("users", "u1", FieldWrites::new().set("displayName", "Ada"))
            .await
            .unwrap();

        let docs = store
            .get_batch("users", &["u1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get("displayName"), Some(&json!("Ada")));
    }

    #[tokio::test]
    async fn test_get_batch_rejects_oversized() {
        let store = MemoryDocumentStore::default();
        let ids: Vec<String> = (0..11).map(|i| i.to_string()).collect();
        let err = store.get_batch("users", &ids).await.unwrap_err();
        assert!(matches!(err, RemoteError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let store = MemoryDocumentStore::default();
        let err = store.increment_field("posts", "nope", "likes", 1).await.unwrap_err();
        assert_eq!(
            err,
            RemoteError::NotFound {
                collection: "posts".into(),
                id: "nope".into()
            }
        );
        assert!(store.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_initial_then_live() {
        let store = MemoryDocumentStore::default();
        store
            .write_document("posts", "p1", FieldWrites::new().server_timestamp("timestamp"))
            .await
            .unwrap();
        store
            .write_document("posts", "p2", FieldWrites::new().server_timestamp("timestamp"))
            .await
            .unwrap();

        let mut stream = store.subscribe_collection("posts", &by_timestamp()).await.unwrap();
        let WatchEvent::Batch(initial) = next(&mut stream).await else {
            panic!("expected initial batch");
        };
        let ids: Vec<&str> = initial.changes.iter().map(Change::document_id).collect();
        assert_eq!(ids, vec!["p2", "p1"]);
        assert_eq!(initial.sequence, 2);

        store.increment_field("posts", "p1", "likes", 1).await.unwrap();
        let WatchEvent::Batch(live) = next(&mut stream).await else {
            panic!("expected live batch");
        };
        assert_eq!(live.sequence, 3);
        assert!(matches!(&live.changes[0], Change::Modified(doc) if doc.get("likes") == Some(&json!(1))));

        store.delete_document("posts", "p2").await.unwrap();
        let WatchEvent::Batch(removed) = next(&mut stream).await else {
            panic!("expected removal batch");
        };
        assert_eq!(removed.changes, vec![Change::Removed("p2".into())]);
    }

    #[tokio::test]
    async fn test_server_timestamps_strictly_increase() {
        let store = MemoryDocumentStore::default();
        for id in ["a", "b", "c"] {
            store
                .write_document("posts", id, FieldWrites::new().server_timestamp("timestamp"))
                .await
                .unwrap();
        }
        let mut stamps = Vec::new();
        for id in ["a", "b", "c"] {
            let doc = store.document("posts", id).await.unwrap();
            stamps.push(doc.get("timestamp").and_then(Value::as_i64).unwrap());
        }
        assert!(stamps[0] < stamps[1] && stamps[1] < stamps[2]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_silent() {
        let store = MemoryDocumentStore::default();
        store.delete_document("posts", "ghost").await.unwrap();
        assert!(store.write_log().is_empty());
        assert_eq!(store.sequence(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryDocumentStore::default();
        store.fail_writes_to("likes", "p1_u1");
        store.fail_reads_of("users", "u2");
        store.fail_collection_writes("follows");

        assert!(matches!(
            store.write_document("likes", "p1_u1", FieldWrites::new()).await,
            Err(RemoteError::Unavailable(_))
        ));
        assert!(matches!(
            store.write_document("follows", "x", FieldWrites::new()).await,
            Err(RemoteError::PermissionDenied(_))
        ));
        assert!(store
            .get_batch("users", &["u1".to_string(), "u2".to_string()])
            .await
            .is_err());

        store.clear_faults();
        assert!(store.write_document("likes", "p1_u1", FieldWrites::new()).await.is_ok());
        assert_eq!(store.writes_to("likes").len(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_ends_stream() {
        let store = MemoryDocumentStore::default();
        let mut stream = store.subscribe_collection("posts", &by_timestamp()).await.unwrap();
        let _initial = next(&mut stream).await;

        assert_eq!(store.interrupt_subscriptions("posts", "maintenance").await, 1);
        assert_eq!(
            next(&mut stream).await,
            WatchEvent::Error(SubscriptionError::Interrupted("maintenance".into()))
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failing_subscription() {
        let store = MemoryDocumentStore::default();
        store.fail_subscriptions(true);
        assert!(store.subscribe_collection("posts", &by_timestamp()).await.is_err());
    }

    #[tokio::test]
    async fn test_query_ids() {
        let store = MemoryDocumentStore::default();
        for (id, post) in [("p1_u1", "p1"), ("p1_u2", "p1"), ("p2_u1", "p2")] {
            store
                .write_document("likes", id, FieldWrites::new().set("postId", post))
                .await
                .unwrap();
        }
        let mut ids = store.query_ids("likes", "postId", &json!("p1")).await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["p1_u1", "p1_u2"]);
    }
}
