//! Optimistic mutations: apply locally, write remotely, reconcile.
//!
//! Every operation checks its preconditions before touching anything,
//! then applies a [`SpeculativeEdit`] to the shared store, then issues
//! the remote write. A failed write rolls the local edit back and is
//! returned as [`MutationError::WriteFailed`].
//!
//! Like and follow toggles coalesce. The first toggle of a burst leads:
//! it waits out the coalescing window, writes the net state (nothing
//! when the toggles cancelled out) and keeps writing follow-ups while
//! toggles arrive during a write. Later toggles in the burst return
//! [`MutationOutcome::Coalesced`] at once.

use serde_json::Value;
use std::sync::Arc;

use crate::config::MutatorConfig;
use crate::document::{fields, follow_document_id, like_document_id, FieldWrites};
use crate::enrich::EnrichmentResolver;
use crate::error::{MutationError, PreconditionViolation, RemoteError};
use crate::model::{Comment, CommentId, EntryId, FeedEntry, MediaRef, Timestamp, UserId, Viewer};
use crate::ports::{DocumentStore, ObjectStorage, StorageRef};
use crate::store::{FieldSnapshot, MutationKind, PendingKey, SharedFeedStore, SpeculativeEdit};

/// How a mutation call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The remote write (or writes) succeeded.
    Committed,
    /// Folded into a toggle already in progress; its leader writes.
    Coalesced,
    /// The burst cancelled out; nothing was written.
    Cancelled,
}

/// Media attached to a new post.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Input of [`OptimisticMutator::create_entry`].
#[derive(Debug, Clone, Default)]
pub struct PostDraft {
    pub body: String,
    pub media: Option<MediaUpload>,
}

impl PostDraft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            media: None,
        }
    }

    pub fn with_media(mut self, file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.media = Some(MediaUpload {
            file_name: file_name.into(),
            bytes,
        });
        self
    }
}

#[derive(Debug, Clone)]
enum ToggleTarget {
    Like { entry_id: EntryId, viewer_id: UserId },
    Follow { author_id: UserId, viewer_id: UserId },
}

/// Issues optimistic mutations against the shared store. Cheap to clone.
#[derive(Clone)]
pub struct OptimisticMutator {
    store: SharedFeedStore,
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStorage>,
    resolver: Arc<EnrichmentResolver>,
    config: Arc<MutatorConfig>,
}

impl OptimisticMutator {
    pub fn new(
        store: SharedFeedStore,
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStorage>,
        resolver: Arc<EnrichmentResolver>,
        config: MutatorConfig,
    ) -> Self {
        Self {
            store,
            documents,
            objects,
            resolver,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &SharedFeedStore {
        &self.store
    }

    // ─── Likes ───────────────────────────────────────────────────

    /// Toggle the viewer's like on a loaded entry.
    pub async fn toggle_like(&self, entry_id: &EntryId, viewer: &Viewer) -> Result<MutationOutcome, MutationError> {
        let speculation = self
            .store
            .write()
            .await
            .apply_speculative(SpeculativeEdit::ToggleLike(entry_id.clone()))?;
        if speculation.coalesced {
            return Ok(MutationOutcome::Coalesced);
        }
        let target = ToggleTarget::Like {
            entry_id: entry_id.clone(),
            viewer_id: viewer.id.clone(),
        };
        self.lead_toggle(speculation.key, target).await
    }

    async fn write_like(&self, entry_id: &EntryId, viewer_id: &UserId, liked: bool) -> Result<(), RemoteError> {
        let collections = &self.config.collections;
        let like_id = like_document_id(entry_id, viewer_id);
        self.set_relation(&collections.likes, &like_id, liked, || {
            FieldWrites::new()
                .set(fields::POST_ID, entry_id.as_str())
                .set(fields::USER_ID, viewer_id.as_str())
                .server_timestamp(fields::TIMESTAMP)
        })
        .await?;

        let delta = if liked { 1 } else { -1 };
        if let Err(e) = self
            .documents
            .increment_field(&collections.posts, entry_id.as_str(), fields::LIKES, delta)
            .await
        {
            // Undo the like record so it stays consistent with the counter.
            let undo = self
                .set_relation(&collections.likes, &like_id, !liked, || {
                    FieldWrites::new()
                        .set(fields::POST_ID, entry_id.as_str())
                        .set(fields::USER_ID, viewer_id.as_str())
                        .server_timestamp(fields::TIMESTAMP)
                })
                .await;
            if let Err(undo_err) = undo {
                log::warn!("could not revert like record {like_id}: {undo_err}");
            }
            return Err(e);
        }
        Ok(())
    }

    // ─── Follows ─────────────────────────────────────────────────

    /// Toggle whether the viewer follows `author_id`. Every loaded entry
    /// by that author flips at once.
    pub async fn toggle_follow(&self, author_id: &UserId, viewer: &Viewer) -> Result<MutationOutcome, MutationError> {
        if *author_id == viewer.id {
            return Err(PreconditionViolation::SelfFollow.into());
        }
        let fallback_following = self.resolver.follow_state(author_id).await.unwrap_or(false);

        let speculation = self
            .store
            .write()
            .await
            .apply_speculative(SpeculativeEdit::ToggleFollow {
                author_id: author_id.clone(),
                fallback_following,
            })?;
        if speculation.coalesced {
            return Ok(MutationOutcome::Coalesced);
        }
        let target = ToggleTarget::Follow {
            author_id: author_id.clone(),
            viewer_id: viewer.id.clone(),
        };
        self.lead_toggle(speculation.key, target).await
    }

    async fn write_follow(&self, author_id: &UserId, viewer_id: &UserId, following: bool) -> Result<(), RemoteError> {
        let follow_id = follow_document_id(viewer_id, author_id);
        self.set_relation(&self.config.collections.follows, &follow_id, following, || {
            FieldWrites::new()
                .set(fields::FOLLOWER_ID, viewer_id.as_str())
                .set(fields::FOLLOWING_ID, author_id.as_str())
                .server_timestamp(fields::TIMESTAMP)
        })
        .await
    }

    // ─── Toggle leadership ───────────────────────────────────────

    async fn lead_toggle(&self, key: PendingKey, target: ToggleTarget) -> Result<MutationOutcome, MutationError> {
        tokio::time::sleep(self.config.coalesce_window).await;

        let first = self.store.write().await.begin_toggle_write(&key);
        let Some(mut state) = first else {
            return Ok(MutationOutcome::Cancelled);
        };

        loop {
            let written = match &target {
                ToggleTarget::Like { entry_id, viewer_id } => self.write_like(entry_id, viewer_id, state).await,
                ToggleTarget::Follow { author_id, viewer_id } => {
                    self.write_follow(author_id, viewer_id, state).await
                }
            };

            if let Err(source) = written {
                self.store.write().await.fail_toggle_write(&key);
                log::warn!("{key} failed, rolled back: {source}");
                return Err(MutationError::write_failed(key.kind, source));
            }

            if let ToggleTarget::Follow { author_id, .. } = &target {
                self.resolver.record_follow(author_id, state).await;
            }
            let follow_up = self.store.write().await.confirm_toggle_write(&key);
            match follow_up {
                Some(next) => state = next,
                None => return Ok(MutationOutcome::Committed),
            }
        }
    }

    /// Create (`present`) or delete a relation record.
    async fn set_relation(
        &self,
        collection: &str,
        id: &str,
        present: bool,
        record: impl FnOnce() -> FieldWrites,
    ) -> Result<(), RemoteError> {
        if present {
            self.documents.write_document(collection, id, record()).await
        } else {
            self.documents.delete_document(collection, id).await
        }
    }

    // ─── Comments ────────────────────────────────────────────────

    /// Append a comment. Returns the temporary id shown until the server
    /// copy arrives. On failure the comment is removed again and the text
    /// is handed back as the error's draft.
    pub async fn add_comment(&self, entry_id: &EntryId, viewer: &Viewer, text: &str) -> Result<CommentId, MutationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(PreconditionViolation::EmptyComment.into());
        }

        let local = Comment::local(viewer, trimmed);
        let speculation = self
            .store
            .write()
            .await
            .apply_speculative(SpeculativeEdit::AddComment {
                entry_id: entry_id.clone(),
                comment: local.clone(),
            })?;

        let stored = Comment {
            id: CommentId::generate(),
            ..local.clone()
        };
        let result = match serde_json::to_value(&stored) {
            Ok(value) => {
                let writes = FieldWrites::new()
                    .array_union(fields::COMMENTS, vec![value])
                    .increment(fields::COMMENTS_COUNT, 1);
                self.documents
                    .update_document(&self.config.collections.posts, entry_id.as_str(), writes)
                    .await
            }
            Err(e) => Err(RemoteError::InvalidArgument(e.to_string())),
        };

        match result {
            Ok(()) => {
                if self.store.write().await.await_echo(&speculation.key) {
                    self.expire_later(speculation.key);
                }
                Ok(local.id)
            }
            Err(source) => {
                self.store
                    .write()
                    .await
                    .rollback(&speculation.key, &speculation.previous);
                log::warn!("{} failed, rolled back: {source}", speculation.key);
                Err(MutationError::WriteFailed {
                    kind: MutationKind::CommentAdd,
                    source,
                    draft: Some(text.to_string()),
                })
            }
        }
    }

    /// Stop waiting for a comment echo after the confirm timeout.
    fn expire_later(&self, key: PendingKey) {
        let store = self.store.clone();
        let timeout = self.config.comment_confirm_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if store.write().await.expire_comment(&key) {
                log::info!("{key}: no echo within {timeout:?}, keeping local copy");
            }
        });
    }

    // ─── Delete ──────────────────────────────────────────────────

    /// Delete an entry the viewer wrote. Media and like records are
    /// cleaned up best-effort after the entry itself is gone.
    pub async fn delete_entry(&self, entry_id: &EntryId, viewer: &Viewer) -> Result<MutationOutcome, MutationError> {
        let speculation = {
            let mut store = self.store.write().await;
            let entry = store
                .get(entry_id)
                .ok_or_else(|| PreconditionViolation::UnknownEntry(entry_id.clone()))?;
            if entry.author_id != viewer.id {
                return Err(PreconditionViolation::NotAuthor {
                    entry_id: entry_id.clone(),
                    viewer_id: viewer.id.clone(),
                }
                .into());
            }
            store.apply_speculative(SpeculativeEdit::Delete(entry_id.clone()))?
        };

        let deleted = self
            .documents
            .delete_document(&self.config.collections.posts, entry_id.as_str())
            .await;
        match deleted {
            Ok(()) => {
                self.store.write().await.resolve(&speculation.key);
                if let FieldSnapshot::Entry(entry) = &speculation.previous {
                    self.clean_up_after(entry).await;
                }
                Ok(MutationOutcome::Committed)
            }
            Err(source) => {
                self.store
                    .write()
                    .await
                    .rollback(&speculation.key, &speculation.previous);
                log::warn!("{} failed, entry restored: {source}", speculation.key);
                Err(MutationError::write_failed(MutationKind::Delete, source))
            }
        }
    }

    async fn clean_up_after(&self, entry: &FeedEntry) {
        if let Some(path) = entry.media.as_ref().and_then(|m| m.path.clone()) {
            if let Err(e) = self.objects.delete(&StorageRef(path.clone())).await {
                log::warn!("cleanup: media {path} of {} not deleted: {e}", entry.id);
            }
        }

        let likes = &self.config.collections.likes;
        let like_ids = match self
            .documents
            .query_ids(likes, fields::POST_ID, &Value::from(entry.id.as_str()))
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("cleanup: likes of {} not listed: {e}", entry.id);
                return;
            }
        };
        for like_id in like_ids {
            if let Err(e) = self.documents.delete_document(likes, &like_id).await {
                log::warn!("cleanup: like {like_id} not deleted: {e}");
            }
        }
    }

    // ─── Create ──────────────────────────────────────────────────

    /// Publish a new entry. The id is generated here so the server copy
    /// replaces the local placeholder in place.
    pub async fn create_entry(&self, viewer: &Viewer, draft: PostDraft) -> Result<EntryId, MutationError> {
        let body = draft.body.trim().to_string();
        if body.is_empty() && draft.media.is_none() {
            return Err(PreconditionViolation::EmptyPost.into());
        }

        let id = EntryId::generate();
        let media = match draft.media {
            Some(upload) => Some(self.upload_media(&id, upload).await?),
            None => None,
        };

        let placeholder = FeedEntry {
            id: id.clone(),
            author_id: viewer.id.clone(),
            author_name: viewer.display_name.clone(),
            author_avatar: viewer.avatar_url.clone(),
            body: body.clone(),
            media: media.clone(),
            like_count: 0,
            liked_by_viewer: false,
            comments: Vec::new(),
            created_at: Timestamp::now(),
            confirmed: false,
            is_following_author: false,
        };
        let speculation = self
            .store
            .write()
            .await
            .apply_speculative(SpeculativeEdit::Create(placeholder))?;

        let mut writes = FieldWrites::new()
            .set(fields::AUTHOR_ID, viewer.id.as_str())
            .set(fields::AUTHOR, viewer.display_name.as_str())
            .set(fields::CONTENT, body)
            .set(fields::LIKES, 0)
            .set(fields::COMMENTS_COUNT, 0)
            .set(fields::COMMENTS, Value::Array(Vec::new()))
            .server_timestamp(fields::TIMESTAMP);
        if let Some(avatar) = &viewer.avatar_url {
            writes = writes.set(fields::AVATAR, avatar.as_str());
        }
        if let Some(media) = &media {
            writes = writes.set(fields::IMAGE_URL, media.url.as_str());
            if let Some(path) = &media.path {
                writes = writes.set(fields::IMAGE_PATH, path.as_str());
            }
        }

        match self
            .documents
            .write_document(&self.config.collections.posts, id.as_str(), writes)
            .await
        {
            Ok(()) => Ok(id),
            Err(source) => {
                self.store
                    .write()
                    .await
                    .rollback(&speculation.key, &speculation.previous);
                log::warn!("{} failed, placeholder removed: {source}", speculation.key);
                if let Some(path) = media.and_then(|m| m.path) {
                    if let Err(e) = self.objects.delete(&StorageRef(path.clone())).await {
                        log::warn!("cleanup: media {path} not deleted: {e}");
                    }
                }
                Err(MutationError::write_failed(MutationKind::Create, source))
            }
        }
    }

    async fn upload_media(&self, id: &EntryId, upload: MediaUpload) -> Result<MediaRef, MutationError> {
        let path = format!("{}/{id}-{}", self.config.media_path_prefix, upload.file_name);
        let reference = self
            .objects
            .upload(&path, upload.bytes)
            .await
            .map_err(|e| MutationError::write_failed(MutationKind::Create, e))?;

        match self.objects.get_url(&reference).await {
            Ok(url) => Ok(MediaRef {
                path: Some(path),
                url,
            }),
            Err(e) => {
                if let Err(cleanup) = self.objects.delete(&reference).await {
                    log::warn!("cleanup: media {path} not deleted: {cleanup}");
                }
                Err(MutationError::write_failed(MutationKind::Create, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryDocumentStore, MemoryObjectStorage};
    use crate::config::FeedConfig;
    use crate::model::Timestamp;
    use crate::store::LocalFeedStore;
    use serde_json::json;

    struct Fixture {
        documents: Arc<MemoryDocumentStore>,
        objects: Arc<MemoryObjectStorage>,
        mutator: OptimisticMutator,
        viewer: Viewer,
    }

    fn fixture() -> Fixture {
        let config = FeedConfig::for_testing();
        let documents = Arc::new(MemoryDocumentStore::default());
        let objects = Arc::new(MemoryObjectStorage::new());
        let resolver = Arc::new(EnrichmentResolver::new(documents.clone(), config.enrichment()));
        let store = LocalFeedStore::shared(config.store());
        let mutator = OptimisticMutator::new(store, documents.clone(), objects.clone(), resolver, config.mutator());
        Fixture {
            documents,
            objects,
            mutator,
            viewer: Viewer::new("me", "Me"),
        }
    }

    fn entry(id: &str, author: &str, likes: u64) -> FeedEntry {
        FeedEntry {
            id: EntryId::new(id),
            author_id: UserId::new(author),
            author_name: author.to_string(),
            author_avatar: None,
            body: String::new(),
            media: None,
            like_count: likes,
            liked_by_viewer: false,
            comments: Vec::new(),
            created_at: Timestamp::from_millis(100),
            confirmed: true,
            is_following_author: false,
        }
    }

    impl Fixture {
        /// Store `entry` remotely and load it locally.
        async fn seed(&self, entry: FeedEntry) {
            self.documents
                .write_document(
                    "posts",
                    entry.id.as_str(),
                    FieldWrites::new()
                        .set(fields::AUTHOR_ID, entry.author_id.as_str())
                        .set(fields::LIKES, entry.like_count)
                        .set(fields::TIMESTAMP, entry.created_at.as_millis()),
                )
                .await
                .unwrap();
            self.mutator.store().write().await.upsert(entry);
            self.documents.clear_write_log();
        }

        async fn local(&self, id: &str) -> Option<FeedEntry> {
            self.mutator.store().read().await.get(&EntryId::new(id)).cloned()
        }
    }

    #[tokio::test]
    async fn test_like_writes_record_and_counter() {
        let f = fixture();
        f.seed(entry("p1", "u1", 5)).await;

        let outcome = f.mutator.toggle_like(&EntryId::new("p1"), &f.viewer).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Committed);

        assert!(f.documents.document("likes", "p1_me").await.is_some());
        let post = f.documents.document("posts", "p1").await.unwrap();
        assert_eq!(post.get(fields::LIKES), Some(&json!(6)));
        let local = f.local("p1").await.unwrap();
        assert_eq!((local.like_count, local.liked_by_viewer), (6, true));
    }

    #[tokio::test]
    async fn test_three_rapid_toggles_write_once() {
        let f = fixture();
        f.seed(entry("p1", "u1", 0)).await;
        let id = EntryId::new("p1");

        let (a, b, c) = tokio::join!(
            f.mutator.toggle_like(&id, &f.viewer),
            f.mutator.toggle_like(&id, &f.viewer),
            f.mutator.toggle_like(&id, &f.viewer),
        );
        assert_eq!(a.unwrap(), MutationOutcome::Committed);
        assert_eq!(b.unwrap(), MutationOutcome::Coalesced);
        assert_eq!(c.unwrap(), MutationOutcome::Coalesced);
        assert_eq!(f.documents.writes_to("likes").len(), 1);
        assert!(f.local("p1").await.unwrap().liked_by_viewer);
    }

    #[tokio::test]
    async fn test_two_rapid_toggles_write_nothing() {
        let f = fixture();
        f.seed(entry("p1", "u1", 2)).await;
        let id = EntryId::new("p1");

        let (a, b) = tokio::join!(
            f.mutator.toggle_like(&id, &f.viewer),
            f.mutator.toggle_like(&id, &f.viewer),
        );
        assert_eq!(a.unwrap(), MutationOutcome::Cancelled);
        assert_eq!(b.unwrap(), MutationOutcome::Coalesced);
        assert!(f.documents.write_log().is_empty());
        assert_eq!(f.local("p1").await.unwrap().like_count, 2);
    }

    #[tokio::test]
    async fn test_failed_like_rolls_back() {
        let f = fixture();
        f.seed(entry("p1", "u1", 5)).await;
        f.documents.fail_writes_to("likes", "p1_me");

        let err = f.mutator.toggle_like(&EntryId::new("p1"), &f.viewer).await.unwrap_err();
        assert!(matches!(err, MutationError::WriteFailed { kind: MutationKind::LikeToggle, .. }));
        let local = f.local("p1").await.unwrap();
        assert_eq!((local.like_count, local.liked_by_viewer), (5, false));
    }

    #[tokio::test]
    async fn test_failed_counter_reverts_like_record() {
        let f = fixture();
        // Loaded locally but missing remotely: the counter update fails.
        f.mutator.store().write().await.upsert(entry("p1", "u1", 0));

        assert!(f.mutator.toggle_like(&EntryId::new("p1"), &f.viewer).await.is_err());
        assert!(f.documents.document("likes", "p1_me").await.is_none());
    }

    #[tokio::test]
    async fn test_like_unknown_entry_is_precondition() {
        let f = fixture();
        let err = f.mutator.toggle_like(&EntryId::new("nope"), &f.viewer).await.unwrap_err();
        assert!(matches!(
            err,
            MutationError::Precondition(PreconditionViolation::UnknownEntry(_))
        ));
    }

    #[tokio::test]
    async fn test_comment_rejects_blank_text() {
        let f = fixture();
        f.seed(entry("p1", "u1", 0)).await;
        let err = f
            .mutator
            .add_comment(&EntryId::new("p1"), &f.viewer, "   ")
            .await
            .unwrap_err();
        assert_eq!(err, MutationError::Precondition(PreconditionViolation::EmptyComment));
        assert!(f.local("p1").await.unwrap().comments.is_empty());
        assert!(f.documents.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_comment_written_and_shown() {
        let f = fixture();
        f.seed(entry("p1", "u1", 0)).await;

        let temp = f
            .mutator
            .add_comment(&EntryId::new("p1"), &f.viewer, "  hello ")
            .await
            .unwrap();
        assert!(temp.is_temporary());

        let local = f.local("p1").await.unwrap();
        assert_eq!(local.comments.len(), 1);
        assert_eq!(local.comments[0].text, "hello");

        let post = f.documents.document("posts", "p1").await.unwrap();
        assert_eq!(post.get(fields::COMMENTS_COUNT), Some(&json!(1)));
        let stored = &post.get(fields::COMMENTS).unwrap()[0];
        assert_eq!(stored["text"], json!("hello"));
        assert_eq!(stored["authorId"], json!("me"));
        assert_ne!(stored["id"], json!(temp.as_str()));
    }

    #[tokio::test]
    async fn test_comment_echo_timeout_keeps_local_copy() {
        let f = fixture();
        f.seed(entry("p1", "u1", 0)).await;
        let id = EntryId::new("p1");
        let temp = f.mutator.add_comment(&id, &f.viewer, "hi").await.unwrap();

        let key = PendingKey::comment(&id, &temp);
        assert_eq!(
            f.mutator.store().read().await.pending_state(&key),
            Some(crate::store::PendingPhase::AwaitingEcho)
        );
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert_eq!(
            f.mutator.store().read().await.pending_state(&key),
            Some(crate::store::PendingPhase::Kept)
        );
        assert_eq!(f.local("p1").await.unwrap().comments[0].id, temp);
    }

    #[tokio::test]
    async fn test_failed_comment_returns_draft() {
        let f = fixture();
        f.seed(entry("p1", "u1", 0)).await;
        f.documents.fail_writes_to("posts", "p1");

        let err = f
            .mutator
            .add_comment(&EntryId::new("p1"), &f.viewer, "keep me")
            .await
            .unwrap_err();
        assert_eq!(err.draft(), Some("keep me"));
        assert!(f.local("p1").await.unwrap().comments.is_empty());
    }

    #[tokio::test]
    async fn test_self_follow_rejected() {
        let f = fixture();
        let err = f
            .mutator
            .toggle_follow(&UserId::new("me"), &f.viewer)
            .await
            .unwrap_err();
        assert_eq!(err, MutationError::Precondition(PreconditionViolation::SelfFollow));
    }

    #[tokio::test]
    async fn test_follow_writes_relation() {
        let f = fixture();
        f.seed(entry("p1", "u1", 0)).await;
        f.seed(entry("p2", "u1", 0)).await;

        let outcome = f.mutator.toggle_follow(&UserId::new("u1"), &f.viewer).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Committed);
        let record = f.documents.document("follows", "me_u1").await.unwrap();
        assert_eq!(record.get(fields::FOLLOWING_ID), Some(&json!("u1")));
        assert!(f.local("p1").await.unwrap().is_following_author);
        assert!(f.local("p2").await.unwrap().is_following_author);

        f.mutator.toggle_follow(&UserId::new("u1"), &f.viewer).await.unwrap();
        assert!(f.documents.document("follows", "me_u1").await.is_none());
        assert!(!f.local("p1").await.unwrap().is_following_author);
    }

    #[tokio::test]
    async fn test_delete_requires_authorship() {
        let f = fixture();
        f.seed(entry("p1", "u1", 0)).await;
        let err = f.mutator.delete_entry(&EntryId::new("p1"), &f.viewer).await.unwrap_err();
        assert!(matches!(
            err,
            MutationError::Precondition(PreconditionViolation::NotAuthor { .. })
        ));
        assert!(f.local("p1").await.is_some());
    }

    #[tokio::test]
    async fn test_delete_cleans_up_likes_and_media() {
        let f = fixture();
        let mut own = entry("p1", "me", 0);
        own.media = Some(MediaRef {
            path: Some("post_images/p1-a.jpg".into()),
            url: "memory://post_images/p1-a.jpg".into(),
        });
        f.objects.upload("post_images/p1-a.jpg", vec![1]).await.unwrap();
        f.seed(own).await;
        for liker in ["u1", "u2"] {
            f.documents
                .write_document(
                    "likes",
                    &format!("p1_{liker}"),
                    FieldWrites::new().set(fields::POST_ID, "p1"),
                )
                .await
                .unwrap();
        }

        let outcome = f.mutator.delete_entry(&EntryId::new("p1"), &f.viewer).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Committed);
        assert!(f.local("p1").await.is_none());
        assert!(f.documents.document("posts", "p1").await.is_none());
        assert_eq!(f.documents.document_count("likes").await, 0);
        assert!(!f.objects.contains("post_images/p1-a.jpg").await);
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_not_surfaced() {
        let f = fixture();
        f.seed(entry("p1", "me", 0)).await;
        f.documents
            .write_document("likes", "p1_u1", FieldWrites::new().set(fields::POST_ID, "p1"))
            .await
            .unwrap();
        f.documents.fail_collection_writes("likes");

        let outcome = f.mutator.delete_entry(&EntryId::new("p1"), &f.viewer).await;
        assert_eq!(outcome.unwrap(), MutationOutcome::Committed);
        assert!(f.local("p1").await.is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_empty_draft() {
        let f = fixture();
        let err = f
            .mutator
            .create_entry(&f.viewer, PostDraft::text("  "))
            .await
            .unwrap_err();
        assert_eq!(err, MutationError::Precondition(PreconditionViolation::EmptyPost));
        assert!(f.mutator.store().read().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_with_media() {
        let f = fixture();
        let id = f
            .mutator
            .create_entry(&f.viewer, PostDraft::text("look").with_media("a.jpg", vec![7, 7]))
            .await
            .unwrap();

        let path = format!("post_images/{id}-a.jpg");
        assert!(f.objects.contains(&path).await);
        let doc = f.documents.document("posts", id.as_str()).await.unwrap();
        assert_eq!(doc.get(fields::CONTENT), Some(&json!("look")));
        assert_eq!(doc.get(fields::IMAGE_PATH), Some(&json!(path)));
        assert!(doc.get(fields::TIMESTAMP).and_then(Value::as_i64).is_some());

        let local = f.local(id.as_str()).await.unwrap();
        assert!(!local.confirmed);
        assert_eq!(local.author_name, "Me");
    }

    #[tokio::test]
    async fn test_failed_create_removes_placeholder_and_media() {
        let f = fixture();
        f.documents.fail_collection_writes("posts");

        let err = f
            .mutator
            .create_entry(&f.viewer, PostDraft::text("doomed").with_media("b.png", vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::WriteFailed { kind: MutationKind::Create, .. }));
        assert!(f.mutator.store().read().await.is_empty());
        assert_eq!(f.objects.object_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_upload_aborts_before_local_change() {
        let f = fixture();
        f.objects.fail_uploads(true);
        let result = f
            .mutator
            .create_entry(&f.viewer, PostDraft::text("pic").with_media("c.png", vec![1]))
            .await;
        assert!(result.is_err());
        assert!(f.mutator.store().read().await.is_empty());
        assert!(f.documents.write_log().is_empty());
    }
}
