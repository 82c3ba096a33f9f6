//! Scripted walk through a feed session against the in-memory backend.
//!
//! `Scenario` owns the backend handles alongside the session so it can
//! play the other users' remote writes and inject failures.

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use socialhub_feed::backend::{MemoryAuth, MemoryDocumentStore, MemoryObjectStorage};
use socialhub_feed::document::fields;
use socialhub_feed::{
    DocumentStore, EntryId, FeedBackend, FeedConfig, FeedEvent, FeedSession, FieldWrites,
    PostDraft, SessionError, UserId, Viewer,
};

pub struct Scenario {
    auth: Arc<MemoryAuth>,
    documents: Arc<MemoryDocumentStore>,
    session: FeedSession,
}

impl Scenario {
    /// Seed two other users and their posts, then sign in as `me`.
    pub async fn start(config: FeedConfig) -> Result<Self, SessionError> {
        let documents = Arc::new(MemoryDocumentStore::default());
        let auth = Arc::new(MemoryAuth::signed_in(Viewer::new("me", "Demo Viewer")));

        for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("me", "Demo Viewer")] {
            seed(&documents, "users", id, FieldWrites::new().set(fields::DISPLAY_NAME, name)).await;
        }
        for (id, author, content) in [
            ("welcome", "alice", "Welcome to the feed"),
            ("lunch", "bob", "Anyone up for lunch?"),
            ("again", "alice", "Second post from Alice"),
        ] {
            seed(
                &documents,
                "posts",
                id,
                FieldWrites::new()
                    .set(fields::AUTHOR_ID, author)
                    .set(fields::CONTENT, content)
                    .set(fields::LIKES, 0)
                    .server_timestamp(fields::TIMESTAMP),
            )
            .await;
        }

        let backend = FeedBackend {
            auth: auth.clone(),
            documents: documents.clone(),
            objects: Arc::new(MemoryObjectStorage::new()),
        };
        let mut session = FeedSession::start(config, backend).await?;
        if let Some(mut events) = session.take_event_rx() {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        FeedEvent::Updated { version, sequence } => {
                            log::debug!("feed updated to v{version} (seq {sequence})")
                        }
                        other => info!("feed event: {other:?}"),
                    }
                }
            });
        }

        Ok(Self {
            auth,
            documents,
            session,
        })
    }

    /// Run every step, logging the feed after each.
    pub async fn run(mut self) {
        self.settle().await;
        self.show("initial feed").await;

        match self
            .session
            .create_entry(PostDraft::text("Hello from the demo").with_media("hello.png", vec![0x89, 0x50]))
            .await
        {
            Ok(id) => info!("created entry {id}"),
            Err(e) => warn!("create failed: {e}"),
        }
        self.settle().await;
        self.show("after posting").await;

        // Three quick taps on the same entry end up as one like write.
        let lunch = EntryId::new("lunch");
        let (a, b, c) = tokio::join!(
            self.session.toggle_like(&lunch),
            self.session.toggle_like(&lunch),
            self.session.toggle_like(&lunch),
        );
        info!("rapid likes: {:?}", [a, b, c].map(|r| r.map_err(|e| e.to_string())));
        info!("like writes issued: {}", self.documents.writes_to("likes").len());

        match self.session.add_comment(&lunch, "Count me in").await {
            Ok(temp) => info!("comment shown as {temp} until confirmed"),
            Err(e) => warn!("comment failed: {e}"),
        }
        if let Err(e) = self.session.toggle_follow(&UserId::new("alice")).await {
            warn!("follow failed: {e}");
        }
        self.settle().await;
        self.show("after like, comment and follow").await;

        // A rejected write rolls the speculative like back.
        self.documents.fail_writes_to("likes", "welcome_me");
        match self.session.toggle_like(&EntryId::new("welcome")).await {
            Ok(outcome) => info!("unexpected success: {outcome:?}"),
            Err(e) => warn!("like rolled back: {e}"),
        }
        self.documents.clear_faults();
        self.show("after failed like").await;

        let own: Vec<EntryId> = self
            .session
            .snapshot()
            .await
            .iter()
            .filter(|e| e.author_id == self.session.viewer().id)
            .map(|e| e.id.clone())
            .collect();
        for id in own {
            match self.session.delete_entry(&id).await {
                Ok(_) => info!("deleted {id}"),
                Err(e) => warn!("delete of {id} failed: {e}"),
            }
        }
        self.settle().await;
        self.show("after deleting own entries").await;

        self.auth.sign_out();
        self.settle().await;
        info!(
            "signed out: state={:?}, {} entries left",
            self.session.state().await,
            self.session.snapshot().await.len()
        );
        self.session.stop().await;
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    async fn show(&self, label: &str) {
        let snapshot = self.session.snapshot().await;
        info!("── {label}: {} entries (v{})", snapshot.len(), snapshot.version());
        for entry in snapshot.iter() {
            info!(
                "  [{}] {}: {:?} likes={}{} comments={}{}{}",
                entry.id,
                entry.author_name,
                entry.body,
                entry.like_count,
                if entry.liked_by_viewer { " (liked)" } else { "" },
                entry.comment_count(),
                if entry.is_following_author { " following" } else { "" },
                if entry.confirmed { "" } else { " pending" },
            );
        }
    }
}

async fn seed(documents: &MemoryDocumentStore, collection: &str, id: &str, writes: FieldWrites) {
    if let Err(e) = documents.write_document(collection, id, writes).await {
        log::error!("seeding {collection}/{id} failed: {e}");
    }
}

