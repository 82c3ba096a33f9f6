//! # socialhub-feed — realtime social feed with optimistic mutations
//!
//! Keeps a viewer-relative, ordered feed in sync with a remote document
//! store while the viewer likes, comments, follows, posts and deletes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  ChangeBatch   ┌────────────────────┐
//! │ RemoteCollection │ ─────────────► │ EnrichmentResolver │
//! │ Watcher          │                │ (authors, likes,   │
//! └────────▲─────────┘                │  follows; chunked) │
//!          │ echo                     └─────────┬──────────┘
//!          │                                    │ FeedEntry
//! ┌────────┴─────────┐   writes      ┌──────────▼─────────┐
//! │ DocumentStore    │ ◄──────────── │ OptimisticMutator  │
//! │ (remote)         │               └──────────┬─────────┘
//! └──────────────────┘                speculative│  merge
//!                                     ┌──────────▼─────────┐
//!                                     │ LocalFeedStore     │ ──► FeedSnapshot
//!                                     │ (pending, ordered) │
//!                                     └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`watcher`] — cancellable subscription to a remote collection
//! - [`enrich`] — batched author/like/follow lookups with fallbacks
//! - [`store`] — ordered local feed, pending mutations, coalescing
//! - [`mutator`] — like, comment, follow, delete and create operations
//! - [`session`] — the whole pipeline for one signed-in viewer
//! - [`ports`] — collaborator contracts; [`backend`] implements them in memory
//! - [`config`] — `FeedConfig`, loadable from JSON

pub mod backend;
pub mod config;
pub mod document;
pub mod enrich;
pub mod error;
pub mod model;
pub mod mutator;
pub mod ports;
pub mod session;
pub mod store;
pub mod watcher;

// Re-exports for convenience
pub use config::{CollectionNames, EnrichmentConfig, FeedConfig, MutatorConfig, StoreConfig};
pub use document::{Change, ChangeBatch, Direction, Document, FieldValue, FieldWrites, OrderBy, WatchEvent};
pub use enrich::EnrichmentResolver;
pub use error::{
    ConfigError, DocumentError, MutationError, PreconditionViolation, RemoteError, SessionError,
    SubscriptionError,
};
pub use model::{
    AuxiliaryUserInfo, Comment, CommentId, EntryId, FeedEntry, MediaRef, RawEntry, Timestamp, UserId,
    Viewer,
};
pub use mutator::{MediaUpload, MutationOutcome, OptimisticMutator, PostDraft};
pub use ports::{AuthProvider, DocumentStore, ObjectStorage, StorageRef};
pub use session::{FeedBackend, FeedEvent, FeedSession, SessionState};
pub use store::{
    FeedSnapshot, FieldSnapshot, LocalFeedStore, MergeSummary, MutationKind, MutationTarget,
    PendingKey, PendingPhase, SharedFeedStore, Speculation, SpeculativeEdit,
};
pub use watcher::{CancelHandle, ChangeStream, RemoteCollectionWatcher};
