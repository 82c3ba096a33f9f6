//! Contracts of the external collaborators consumed by the core:
//! authentication, the remote document store and object storage.
//!
//! The core only ever holds these as `Arc<dyn …>`; [`crate::backend`]
//! provides in-memory implementations.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tokio::sync::watch;

use crate::document::{Document, FieldWrites, OrderBy, WatchEvent};
use crate::error::RemoteError;
use crate::model::Viewer;

/// Reference to a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageRef(pub String);

impl StorageRef {
    pub fn path(&self) -> &str {
        &self.0
    }
}

/// Authentication provider.
pub trait AuthProvider: Send + Sync {
    fn current_viewer(&self) -> Option<Viewer>;

    /// Observe sign-in/sign-out. Dropping the receiver unsubscribes.
    fn on_auth_change(&self) -> watch::Receiver<Option<Viewer>>;
}

/// Remote document store with realtime collection subscriptions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Subscribe to every change of a collection. The stream starts with
    /// a batch holding the current contents as `Added` records.
    async fn subscribe_collection(
        &self,
        collection: &str,
        order_by: &OrderBy,
    ) -> Result<BoxStream<'static, WatchEvent>, RemoteError>;

    /// Fetch documents by id. Ids that do not exist are absent from the
    /// result. Implementations may reject oversized batches.
    async fn get_batch(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, RemoteError>;

    /// Create or overwrite a document.
    async fn write_document(&self, collection: &str, id: &str, writes: FieldWrites) -> Result<(), RemoteError>;

    /// Patch an existing document; `NotFound` if it does not exist.
    async fn update_document(&self, collection: &str, id: &str, writes: FieldWrites) -> Result<(), RemoteError>;

    /// Delete a document. Deleting a missing document succeeds.
    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    /// Ids of documents whose `field` equals `value`.
    async fn query_ids(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<String>, RemoteError>;

    async fn increment_field(&self, collection: &str, id: &str, field: &str, delta: i64) -> Result<(), RemoteError> {
        self.update_document(collection, id, FieldWrites::new().increment(field, delta))
            .await
    }

    async fn array_union(&self, collection: &str, id: &str, field: &str, values: Vec<Value>) -> Result<(), RemoteError> {
        self.update_document(collection, id, FieldWrites::new().array_union(field, values))
            .await
    }
}

/// Blob storage for post media.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<StorageRef, RemoteError>;

    async fn get_url(&self, reference: &StorageRef) -> Result<String, RemoteError>;

    async fn delete(&self, reference: &StorageRef) -> Result<(), RemoteError>;
}
