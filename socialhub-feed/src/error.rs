//! Error taxonomy for the feed core.
//!
//! Nothing here is fatal: every failure is scoped to one subscription,
//! one entry or one mutation.

use thiserror::Error;

use crate::model::{EntryId, UserId};
use crate::store::MutationKind;

/// Failure reported by a remote collaborator (document store, object
/// storage).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote service unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// The realtime stream is broken. Delivered as the last stream event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription to {collection} failed: {source}")]
    Remote {
        collection: String,
        #[source]
        source: RemoteError,
    },
    #[error("subscription interrupted: {0}")]
    Interrupted(String),
    #[error("subscriber lagged behind by {0} batches")]
    Lagged(u64),
}

/// A mutation was invoked with an invalid precondition. Rejected before
/// any local or remote effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionViolation {
    #[error("comment text is empty")]
    EmptyComment,
    #[error("post has neither text nor media")]
    EmptyPost,
    #[error("cannot follow yourself")]
    SelfFollow,
    #[error("{viewer_id} is not the author of {entry_id}")]
    NotAuthor { entry_id: EntryId, viewer_id: UserId },
    #[error("entry {0} is not loaded")]
    UnknownEntry(EntryId),
    #[error("entry {0} already exists")]
    DuplicateEntry(EntryId),
}

/// Outcome of a failed optimistic mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("precondition violated: {0}")]
    Precondition(#[from] PreconditionViolation),
    /// The remote write was rejected and the local change rolled back.
    /// `draft` hands user input (comment text) back for a retry.
    #[error("{kind} write failed: {source}")]
    WriteFailed {
        kind: MutationKind,
        #[source]
        source: RemoteError,
        draft: Option<String>,
    },
}

impl MutationError {
    pub(crate) fn write_failed(kind: MutationKind, source: RemoteError) -> Self {
        Self::WriteFailed {
            kind,
            source,
            draft: None,
        }
    }

    /// Input to restore into the editor, if any.
    pub fn draft(&self) -> Option<&str> {
        match self {
            Self::WriteFailed { draft, .. } => draft.as_deref(),
            Self::Precondition(_) => None,
        }
    }
}

/// A stored document does not match its typed record.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("malformed document {id}: {source}")]
    Malformed {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no authenticated viewer")]
    NotAuthenticated,
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MutationError::WriteFailed {
            kind: MutationKind::CommentAdd,
            source: RemoteError::Unavailable("offline".into()),
            draft: Some("hello".into()),
        };
        assert_eq!(err.to_string(), "comment-add write failed: remote service unavailable: offline");
        assert_eq!(err.draft(), Some("hello"));

        let err: MutationError = PreconditionViolation::SelfFollow.into();
        assert_eq!(err.to_string(), "precondition violated: cannot follow yourself");
        assert_eq!(err.draft(), None);
    }

    #[test]
    fn test_subscription_error_source_chain() {
        use std::error::Error as _;
        let err = SubscriptionError::Remote {
            collection: "posts".into(),
            source: RemoteError::PermissionDenied("rules".into()),
        };
        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "subscription to posts failed: permission denied: rules"
        );
    }
}
