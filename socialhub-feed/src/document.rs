//! Document shapes exchanged with the remote document store.
//!
//! ```text
//! ┌──────────────┐  subscribe_collection   ┌───────────────────────────┐
//! │ DocumentStore│ ──────────────────────► │ WatchEvent::Batch         │
//! │  (remote)    │                         │   ChangeBatch {           │
//! └──────────────┘                         │     sequence,             │
//!        ▲                                 │     [Added | Modified |   │
//!        │ FieldWrites                     │      Removed]             │
//!        │ (Set / ServerTimestamp /        │   }                       │
//!        │  Increment / ArrayUnion)        │ WatchEvent::Error(reason) │
//!        │                                 └───────────────────────────┘
//! ```
//!
//! No wire format is defined here: documents are plain JSON field maps
//! and the field names in [`fields`] are the compatibility contract with
//! data already stored.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{DocumentError, SubscriptionError};
use crate::model::{EntryId, Timestamp, UserId};

/// Field names used by stored documents.
pub mod fields {
    // posts
    pub const AUTHOR_ID: &str = "authorId";
    pub const AUTHOR: &str = "author";
    pub const AVATAR: &str = "avatar";
    pub const CONTENT: &str = "content";
    pub const IMAGE_URL: &str = "imageUrl";
    pub const IMAGE_PATH: &str = "imagePath";
    pub const LIKES: &str = "likes";
    pub const COMMENTS_COUNT: &str = "commentsCount";
    pub const COMMENTS: &str = "comments";
    pub const TIMESTAMP: &str = "timestamp";
    // users
    pub const DISPLAY_NAME: &str = "displayName";
    pub const AVATAR_URL: &str = "avatarUrl";
    // likes
    pub const POST_ID: &str = "postId";
    pub const USER_ID: &str = "userId";
    // follows
    pub const FOLLOWER_ID: &str = "followerId";
    pub const FOLLOWING_ID: &str = "followingId";
}

/// The fields of a stored document.
pub type Fields = Map<String, Value>;

/// A stored document: identifier plus fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    /// Build a document from a JSON object. Non-object values yield an
    /// empty field set.
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Decode the fields into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DocumentError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|source| {
            DocumentError::Malformed {
                id: self.id.clone(),
                source,
            }
        })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// A per-field write transform.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Replace the field.
    Set(Value),
    /// Store the server's clock at commit time.
    ServerTimestamp,
    /// Add to a numeric field (missing counts as zero).
    Increment(i64),
    /// Append values not already present in an array field.
    ArrayUnion(Vec<Value>),
    /// Remove the field.
    Delete,
}

/// An ordered set of field transforms for one document write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldWrites(BTreeMap<String, FieldValue>);

impl FieldWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), FieldValue::Set(value.into()));
        self
    }

    pub fn server_timestamp(mut self, field: &str) -> Self {
        self.0.insert(field.to_string(), FieldValue::ServerTimestamp);
        self
    }

    pub fn increment(mut self, field: &str, delta: i64) -> Self {
        self.0.insert(field.to_string(), FieldValue::Increment(delta));
        self
    }

    pub fn array_union(mut self, field: &str, values: Vec<Value>) -> Self {
        self.0.insert(field.to_string(), FieldValue::ArrayUnion(values));
        self
    }

    pub fn delete(mut self, field: &str) -> Self {
        self.0.insert(field.to_string(), FieldValue::Delete);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Apply every transform to `target`, resolving server timestamps to
    /// `server_time`.
    pub fn apply_to(&self, target: &mut Fields, server_time: Timestamp) {
        for (field, value) in &self.0 {
            match value {
                FieldValue::Set(v) => {
                    target.insert(field.clone(), v.clone());
                }
                FieldValue::ServerTimestamp => {
                    target.insert(field.clone(), Value::from(server_time.as_millis()));
                }
                FieldValue::Increment(delta) => {
                    let current = target.get(field).and_then(Value::as_i64).unwrap_or(0);
                    target.insert(field.clone(), Value::from(current.saturating_add(*delta)));
                }
                FieldValue::ArrayUnion(values) => {
                    let mut array = match target.remove(field) {
                        Some(Value::Array(existing)) => existing,
                        _ => Vec::new(),
                    };
                    for v in values {
                        if !array.contains(v) {
                            array.push(v.clone());
                        }
                    }
                    target.insert(field.clone(), Value::Array(array));
                }
                FieldValue::Delete => {
                    target.remove(field);
                }
            }
        }
    }
}

/// Sort direction for a collection subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Ordering requested for a collection subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }
}

/// One record notification inside a [`ChangeBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Added(Document),
    Modified(Document),
    Removed(String),
}

impl Change {
    pub fn document_id(&self) -> &str {
        match self {
            Change::Added(doc) | Change::Modified(doc) => &doc.id,
            Change::Removed(id) => id,
        }
    }
}

/// Changes delivered together. `sequence` is the server clock of the
/// write that caused them; batches arrive in increasing sequence order.
/// Records within a batch have no defined order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub sequence: u64,
    pub changes: Vec<Change>,
}

impl ChangeBatch {
    pub fn new(sequence: u64, changes: Vec<Change>) -> Self {
        Self { sequence, changes }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// An item of a collection subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Batch(ChangeBatch),
    /// The stream is broken; nothing follows. No automatic retry.
    Error(SubscriptionError),
}

/// Document id of the like record for `(entry, viewer)`.
pub fn like_document_id(entry_id: &EntryId, viewer_id: &UserId) -> String {
    format!("{entry_id}_{viewer_id}")
}

/// Document id of the follow record for `(viewer, author)`.
pub fn follow_document_id(viewer_id: &UserId, author_id: &UserId) -> String {
    format!("{viewer_id}_{author_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_writes_apply() {
        let mut target = Fields::new();
        target.insert("likes".into(), json!(2));
        target.insert("stale".into(), json!(true));

        FieldWrites::new()
            .set("content", "hello")
            .increment("likes", 3)
            .increment("commentsCount", 1)
            .server_timestamp("timestamp")
            .delete("stale")
            .apply_to(&mut target, Timestamp::from_millis(777));

        assert_eq!(target["content"], json!("hello"));
        assert_eq!(target["likes"], json!(5));
        assert_eq!(target["commentsCount"], json!(1));
        assert_eq!(target["timestamp"], json!(777));
        assert!(!target.contains_key("stale"));
    }

    #[test]
    fn test_array_union_skips_present_values() {
        let mut target = Fields::new();
        let writes = FieldWrites::new().array_union("comments", vec![json!({"id": "c1"})]);
        writes.apply_to(&mut target, Timestamp::default());
        writes.apply_to(&mut target, Timestamp::default());
        assert_eq!(target["comments"], json!([{"id": "c1"}]));
    }

    #[test]
    fn test_relation_document_ids() {
        let entry = EntryId::new("p1");
        let viewer = UserId::new("u1");
        let author = UserId::new("u2");
        assert_eq!(like_document_id(&entry, &viewer), "p1_u1");
        assert_eq!(follow_document_id(&viewer, &author), "u1_u2");
    }

    #[test]
    fn test_document_from_non_object() {
        let doc = Document::new("x", json!(42));
        assert!(doc.fields.is_empty());
        assert_eq!(Change::Removed("x".into()).document_id(), "x");
    }
}
