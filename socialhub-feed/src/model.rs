//! Typed records for the feed: entries, comments, authors and viewers.
//!
//! `RawEntry` is what the remote store holds; `FeedEntry` is the fully
//! denormalized, viewer-relative record the UI renders.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::document::Document;
use crate::error::DocumentError;

/// Prefix marking comment identifiers that were generated locally and
/// have not been confirmed by the remote store.
const TEMP_COMMENT_PREFIX: &str = "local-";

/// Stable identifier of a feed entry (remote document id).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Client-generated identifier for an entry that is not yet stored.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a user account (author or viewer).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a comment within its parent entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(String);

impl CommentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier for a comment persisted to the remote store.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Identifier for a speculative comment shown before confirmation.
    pub fn temporary() -> Self {
        Self(format!("{TEMP_COMMENT_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_COMMENT_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Local wall clock.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Absolute distance between two instants in milliseconds.
    pub fn distance_millis(self, other: Timestamp) -> u64 {
        self.0.abs_diff(other.0)
    }
}

/// The signed-in user on whose behalf the feed is rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Viewer {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

/// A comment, owned by its parent entry. Append-only, ascending time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub author_id: UserId,
    /// Resolved at write time, never updated afterwards.
    #[serde(rename = "author")]
    pub author_name: String,
    pub text: String,
    pub timestamp: Timestamp,
}

impl Comment {
    /// A speculative comment with a temporary identifier and local time.
    pub fn local(viewer: &Viewer, text: impl Into<String>) -> Self {
        Self {
            id: CommentId::temporary(),
            author_id: viewer.id.clone(),
            author_name: viewer.display_name.clone(),
            text: text.into(),
            timestamp: Timestamp::now(),
        }
    }

    /// Same author and text, written within `window_millis` of each other.
    pub fn matches(&self, other: &Comment, window_millis: u64) -> bool {
        self.author_id == other.author_id
            && self.text == other.text
            && self.timestamp.distance_millis(other.timestamp) <= window_millis
    }
}

/// Reference to an uploaded media object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Storage path, used for cleanup.
    pub path: Option<String>,
    /// Download URL, used for rendering.
    pub url: String,
}

/// A post as stored remotely, before enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEntry {
    #[serde(skip)]
    pub id: EntryId,
    pub author_id: UserId,
    /// Author name denormalized onto the post when it was written.
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub comments_count: i64,
    #[serde(default)]
    pub comments: Vec<Comment>,
    /// Server-assigned creation time; absent while the write is pending.
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl RawEntry {
    /// Decode a post document.
    pub fn from_document(doc: &Document) -> Result<Self, DocumentError> {
        let mut raw: RawEntry = doc.decode()?;
        raw.id = EntryId::new(doc.id.clone());
        Ok(raw)
    }

    pub fn media(&self) -> Option<MediaRef> {
        self.image_url.as_ref().map(|url| MediaRef {
            path: self.image_path.clone(),
            url: url.clone(),
        })
    }
}

/// Per-author data needed to render an entry, cached by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxiliaryUserInfo {
    pub display_name: String,
    pub avatar_url: Option<String>,
    /// Whether the current viewer follows this author.
    pub is_following: bool,
}

/// Ordering key: newest first, ties broken by identifier descending.
pub type SortKey = (Reverse<Timestamp>, Reverse<EntryId>);

/// A fully denormalized, viewer-relative entry ready for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedEntry {
    pub id: EntryId,
    pub author_id: UserId,
    pub author_name: String,
    pub author_avatar: Option<String>,
    pub body: String,
    pub media: Option<MediaRef>,
    pub like_count: u64,
    pub liked_by_viewer: bool,
    pub comments: Vec<Comment>,
    pub created_at: Timestamp,
    /// `false` while `created_at` is a local placeholder.
    pub confirmed: bool,
    pub is_following_author: bool,
}

impl FeedEntry {
    pub fn sort_key(&self) -> SortKey {
        (Reverse(self.created_at), Reverse(self.id.clone()))
    }

    pub fn comment_count(&self) -> usize {
        self.comments.len()
    }

    /// Flip the viewer's like, keeping the count non-negative.
    pub(crate) fn toggle_like(&mut self) {
        if self.liked_by_viewer {
            self.liked_by_viewer = false;
            self.like_count = self.like_count.saturating_sub(1);
        } else {
            self.liked_by_viewer = true;
            self.like_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_temporary_comment_ids() {
        assert!(CommentId::temporary().is_temporary());
        assert!(!CommentId::generate().is_temporary());
        assert_ne!(CommentId::temporary(), CommentId::temporary());
    }

    #[test]
    fn test_comment_match_window() {
        let viewer = Viewer::new("u1", "Ada");
        let mut a = Comment::local(&viewer, "hello");
        a.timestamp = Timestamp::from_millis(10_000);
        let mut b = a.clone();
        b.id = CommentId::generate();
        b.timestamp = Timestamp::from_millis(12_000);

        assert!(a.matches(&b, 5_000));
        assert!(!a.matches(&b, 1_000));

        b.text = "hello!".into();
        assert!(!a.matches(&b, 5_000));
    }

    #[test]
    fn test_raw_entry_decodes_stored_field_names() {
        let doc = Document::new(
            "p1",
            json!({
                "authorId": "u1",
                "author": "Ada",
                "content": "first post",
                "imageUrl": "https://cdn/x.jpg",
                "imagePath": "post_images/x.jpg",
                "likes": 3,
                "commentsCount": 1,
                "comments": [
                    {"id": "c1", "authorId": "u2", "author": "Bob", "text": "hi", "timestamp": 5}
                ],
                "timestamp": 1000
            }),
        );

        let raw = RawEntry::from_document(&doc).unwrap();
        assert_eq!(raw.id, EntryId::new("p1"));
        assert_eq!(raw.author_id, UserId::new("u1"));
        assert_eq!(raw.content, "first post");
        assert_eq!(raw.likes, 3);
        assert_eq!(raw.comments.len(), 1);
        assert_eq!(raw.comments[0].author_name, "Bob");
        assert_eq!(raw.timestamp, Some(Timestamp::from_millis(1000)));
        assert_eq!(raw.media().unwrap().path.as_deref(), Some("post_images/x.jpg"));
    }

    #[test]
    fn test_raw_entry_defaults_missing_fields() {
        let doc = Document::new("p2", json!({ "authorId": "u1" }));
        let raw = RawEntry::from_document(&doc).unwrap();
        assert_eq!(raw.likes, 0);
        assert!(raw.comments.is_empty());
        assert!(raw.timestamp.is_none());
        assert!(raw.media().is_none());
    }

    #[test]
    fn test_raw_entry_rejects_missing_author() {
        let doc = Document::new("p3", json!({ "content": "orphan" }));
        assert!(RawEntry::from_document(&doc).is_err());
    }

    #[test]
    fn test_toggle_like_never_negative() {
        let mut entry = FeedEntry {
            id: EntryId::new("e"),
            author_id: UserId::new("a"),
            author_name: "A".into(),
            author_avatar: None,
            body: String::new(),
            media: None,
            like_count: 0,
            liked_by_viewer: true,
            comments: Vec::new(),
            created_at: Timestamp::from_millis(1),
            confirmed: true,
            is_following_author: false,
        };
        entry.toggle_like();
        assert_eq!(entry.like_count, 0);
        assert!(!entry.liked_by_viewer);
        entry.toggle_like();
        assert_eq!(entry.like_count, 1);
        assert!(entry.liked_by_viewer);
    }

    #[test]
    fn test_sort_key_orders_newest_first() {
        let mk = |id: &str, ts: i64| (Reverse(Timestamp::from_millis(ts)), Reverse(EntryId::new(id)));
        assert!(mk("a", 20) < mk("b", 10));
        assert!(mk("b", 10) < mk("a", 10));
    }
}
