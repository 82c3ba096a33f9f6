//! One signed-in viewer's live feed.
//!
//! `FeedSession` wires the pipeline together:
//!
//! ```text
//! RemoteCollectionWatcher ──ChangeBatch──► decode ──► EnrichmentResolver
//!                                                           │
//!        OptimisticMutator ──speculative──►  LocalFeedStore ◄┘ merge
//!                                                 │
//!                                          FeedEvent::Updated
//! ```
//!
//! A background task takes one batch at a time and finishes merging it
//! before it reads the next. The task ends when the stream errors, when
//! the session is stopped, or when the viewer signs out.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::FeedConfig;
use crate::document::{Change, ChangeBatch, Direction, WatchEvent};
use crate::enrich::EnrichmentResolver;
use crate::error::{MutationError, SessionError, SubscriptionError};
use crate::model::{CommentId, EntryId, RawEntry, UserId, Viewer};
use crate::mutator::{MutationOutcome, OptimisticMutator, PostDraft};
use crate::ports::{AuthProvider, DocumentStore, ObjectStorage};
use crate::store::{FeedSnapshot, LocalFeedStore, SharedFeedStore};
use crate::watcher::{CancelHandle, ChangeStream, RemoteCollectionWatcher};

/// The external collaborators a session runs against.
#[derive(Clone)]
pub struct FeedBackend {
    pub auth: Arc<dyn AuthProvider>,
    pub documents: Arc<dyn DocumentStore>,
    pub objects: Arc<dyn ObjectStorage>,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    /// Stopped by the caller.
    Stopped,
    /// The subscription broke; call `resubscribe` to continue.
    Failed,
    SignedOut,
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A batch was merged; `version` is the store version afterwards.
    Updated { version: u64, sequence: u64 },
    SubscriptionFailed(SubscriptionError),
    SignedOut,
    /// The background task finished.
    Ended,
}

/// State shared with the background task.
#[derive(Clone)]
struct Pipeline {
    store: SharedFeedStore,
    resolver: Arc<EnrichmentResolver>,
    viewer: Viewer,
    state: Arc<RwLock<SessionState>>,
    event_tx: mpsc::Sender<FeedEvent>,
}

impl Pipeline {
    fn emit(&self, event: FeedEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::debug!("event channel full, dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    /// Decode, enrich and merge one batch. Returns the store version.
    async fn apply_batch(&self, batch: ChangeBatch) -> u64 {
        let mut added = Vec::new();
        let mut modified = Vec::new();
        let mut removed = Vec::new();
        for change in batch.changes {
            match change {
                Change::Added(doc) => match RawEntry::from_document(&doc) {
                    Ok(raw) => added.push(raw),
                    Err(e) => log::warn!("skipping record: {e}"),
                },
                Change::Modified(doc) => match RawEntry::from_document(&doc) {
                    Ok(raw) => modified.push(raw),
                    Err(e) => log::warn!("skipping record: {e}"),
                },
                Change::Removed(id) => removed.push(EntryId::new(id)),
            }
        }

        // One enrichment call so both halves share the lookups.
        let split = added.len();
        added.extend(modified);
        let mark = self.store.read().await.enrichment_mark();
        let mut enriched = self.resolver.enrich(&added, &self.viewer.id).await;
        let modified = enriched.split_off(split);

        let mut store = self.store.write().await;
        store.merge_enriched(enriched, modified, &removed, mark);
        store.version()
    }

    async fn run(self, mut changes: ChangeStream, cancel: CancelHandle, mut auth_rx: watch::Receiver<Option<Viewer>>) {
        let mut auth_open = true;
        loop {
            tokio::select! {
                event = changes.next() => match event {
                    Some(WatchEvent::Batch(batch)) => {
                        let sequence = batch.sequence;
                        let version = self.apply_batch(batch).await;
                        self.emit(FeedEvent::Updated { version, sequence });
                    }
                    Some(WatchEvent::Error(error)) => {
                        self.set_state(SessionState::Failed).await;
                        self.emit(FeedEvent::SubscriptionFailed(error));
                        break;
                    }
                    None => break,
                },
                changed = auth_rx.changed(), if auth_open => {
                    if changed.is_err() {
                        auth_open = false;
                        continue;
                    }
                    let current = auth_rx.borrow_and_update().as_ref().map(|v| v.id.clone());
                    if current.as_ref() != Some(&self.viewer.id) {
                        log::info!("viewer {} signed out, stopping feed", self.viewer.id);
                        cancel.cancel();
                        self.store.write().await.clear();
                        self.resolver.clear_cache().await;
                        self.set_state(SessionState::SignedOut).await;
                        self.emit(FeedEvent::SignedOut);
                        break;
                    }
                }
            }
        }
        self.emit(FeedEvent::Ended);
    }
}

/// A live, viewer-relative feed.
pub struct FeedSession {
    config: FeedConfig,
    backend: FeedBackend,
    watcher: RemoteCollectionWatcher,
    mutator: OptimisticMutator,
    pipeline: Pipeline,
    cancel: Option<CancelHandle>,
    task: Option<JoinHandle<()>>,
    event_rx: Option<mpsc::Receiver<FeedEvent>>,
}

impl FeedSession {
    /// Validate `config`, require a signed-in viewer and subscribe.
    pub async fn start(config: FeedConfig, backend: FeedBackend) -> Result<Self, SessionError> {
        config.validate()?;
        let viewer = backend
            .auth
            .current_viewer()
            .ok_or(SessionError::NotAuthenticated)?;

        let store = LocalFeedStore::shared(config.store());
        let resolver = Arc::new(EnrichmentResolver::new(
            backend.documents.clone(),
            config.enrichment(),
        ));
        let mutator = OptimisticMutator::new(
            store.clone(),
            backend.documents.clone(),
            backend.objects.clone(),
            resolver.clone(),
            config.mutator(),
        );
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);

        let mut session = Self {
            watcher: RemoteCollectionWatcher::new(backend.documents.clone()),
            pipeline: Pipeline {
                store,
                resolver,
                viewer,
                state: Arc::new(RwLock::new(SessionState::Running)),
                event_tx,
            },
            config,
            backend,
            mutator,
            cancel: None,
            task: None,
            event_rx: Some(event_rx),
        };
        session.subscribe().await;
        log::info!("feed session started for {}", session.pipeline.viewer.id);
        Ok(session)
    }

    async fn subscribe(&mut self) {
        let (changes, cancel) = self
            .watcher
            .subscribe(
                &self.config.collections.posts,
                &self.config.order_key,
                Direction::Descending,
            )
            .await;
        let auth_rx = self.backend.auth.on_auth_change();
        self.pipeline.set_state(SessionState::Running).await;
        self.task = Some(tokio::spawn(self.pipeline.clone().run(changes, cancel.clone(), auth_rx)));
        self.cancel = Some(cancel);
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<FeedEvent>> {
        self.event_rx.take()
    }

    /// Stop the subscription. Merged state is kept. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("feed task ended abnormally: {e}");
            }
        }
        let mut state = self.pipeline.state.write().await;
        if *state == SessionState::Running {
            *state = SessionState::Stopped;
        }
    }

    /// Replace the subscription with a fresh one feeding the same store.
    pub async fn resubscribe(&mut self) -> Result<(), SessionError> {
        let current = self.backend.auth.current_viewer();
        if current.as_ref().map(|v| &v.id) != Some(&self.pipeline.viewer.id) {
            return Err(SessionError::NotAuthenticated);
        }
        self.stop().await;
        log::info!("resubscribing feed for {}", self.pipeline.viewer.id);
        self.subscribe().await;
        Ok(())
    }

    pub async fn state(&self) -> SessionState {
        *self.pipeline.state.read().await
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        self.pipeline.store.read().await.snapshot()
    }

    pub fn store(&self) -> &SharedFeedStore {
        &self.pipeline.store
    }

    pub fn mutator(&self) -> &OptimisticMutator {
        &self.mutator
    }

    pub fn resolver(&self) -> &Arc<EnrichmentResolver> {
        &self.pipeline.resolver
    }

    pub fn viewer(&self) -> &Viewer {
        &self.pipeline.viewer
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    // ─── Mutations as the session's viewer ───────────────────────

    pub async fn toggle_like(&self, entry_id: &EntryId) -> Result<MutationOutcome, MutationError> {
        self.mutator.toggle_like(entry_id, self.viewer()).await
    }

    pub async fn add_comment(&self, entry_id: &EntryId, text: &str) -> Result<CommentId, MutationError> {
        self.mutator.add_comment(entry_id, self.viewer(), text).await
    }

    pub async fn toggle_follow(&self, author_id: &UserId) -> Result<MutationOutcome, MutationError> {
        self.mutator.toggle_follow(author_id, self.viewer()).await
    }

    pub async fn delete_entry(&self, entry_id: &EntryId) -> Result<MutationOutcome, MutationError> {
        self.mutator.delete_entry(entry_id, self.viewer()).await
    }

    pub async fn create_entry(&self, draft: PostDraft) -> Result<EntryId, MutationError> {
        self.mutator.create_entry(self.viewer(), draft).await
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryAuth, MemoryDocumentStore, MemoryObjectStorage};
    use crate::document::{fields, FieldWrites};
    use tokio::time::{timeout, Duration};

    fn backend(auth: MemoryAuth) -> (FeedBackend, Arc<MemoryDocumentStore>) {
        let documents = Arc::new(MemoryDocumentStore::default());
        let backend = FeedBackend {
            auth: Arc::new(auth),
            documents: documents.clone(),
            objects: Arc::new(MemoryObjectStorage::new()),
        };
        (backend, documents)
    }

    async fn next_event(rx: &mut mpsc::Receiver<FeedEvent>) -> FeedEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event in time")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_start_requires_viewer() {
        let (backend, _) = backend(MemoryAuth::new());
        let result = FeedSession::start(FeedConfig::for_testing(), backend).await;
        assert!(matches!(result, Err(SessionError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let (backend, _) = backend(MemoryAuth::signed_in(Viewer::new("me", "Me")));
        let config = FeedConfig {
            lookup_chunk_size: 0,
            ..FeedConfig::for_testing()
        };
        let result = FeedSession::start(config, backend).await;
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_initial_batch_is_merged() {
        let (backend, documents) = backend(MemoryAuth::signed_in(Viewer::new("me", "Me")));
        documents
            .write_document(
                "posts",
                "p1",
                FieldWrites::new()
                    .set(fields::AUTHOR_ID, "u1")
                    .set(fields::CONTENT, "hi")
                    .server_timestamp(fields::TIMESTAMP),
            )
            .await
            .unwrap();

        let mut session = FeedSession::start(FeedConfig::for_testing(), backend).await.unwrap();
        let mut events = session.take_event_rx().unwrap();
        assert!(session.take_event_rx().is_none());

        assert!(matches!(next_event(&mut events).await, FeedEvent::Updated { .. }));
        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.entries()[0].body, "hi");
        assert_eq!(snapshot.entries()[0].author_name, "Unknown");

        session.stop().await;
        session.stop().await;
        assert_eq!(session.state().await, SessionState::Stopped);
        assert_eq!(session.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_stops_session() {
        let (backend, documents) = backend(MemoryAuth::signed_in(Viewer::new("me", "Me")));
        let mut session = FeedSession::start(FeedConfig::for_testing(), backend).await.unwrap();
        let mut events = session.take_event_rx().unwrap();
        let _initial = next_event(&mut events).await;

        documents.interrupt_subscriptions("posts", "offline").await;
        assert_eq!(
            next_event(&mut events).await,
            FeedEvent::SubscriptionFailed(SubscriptionError::Interrupted("offline".into()))
        );
        assert_eq!(next_event(&mut events).await, FeedEvent::Ended);
        assert_eq!(session.state().await, SessionState::Failed);

        session.resubscribe().await.unwrap();
        assert!(matches!(next_event(&mut events).await, FeedEvent::Updated { .. }));
        assert_eq!(session.state().await, SessionState::Running);
    }
}
