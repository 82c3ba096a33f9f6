//! In-memory object storage for post media.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::error::RemoteError;
use crate::ports::{ObjectStorage, StorageRef};

const URL_SCHEME: &str = "memory://";

/// Path → bytes map. URLs are `memory://{path}`.
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    fail_uploads: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.objects.read().await.contains_key(path)
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<StorageRef, RemoteError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable(format!("upload of {path} failed")));
        }
        if path.is_empty() {
            return Err(RemoteError::InvalidArgument("empty object path".to_string()));
        }
        log::debug!("stored {} bytes at {path}", bytes.len());
        self.objects.write().await.insert(path.to_string(), bytes);
        Ok(StorageRef(path.to_string()))
    }

    async fn get_url(&self, reference: &StorageRef) -> Result<String, RemoteError> {
        if self.objects.read().await.contains_key(reference.path()) {
            Ok(format!("{URL_SCHEME}{}", reference.path()))
        } else {
            Err(RemoteError::NotFound {
                collection: "objects".to_string(),
                id: reference.path().to_string(),
            })
        }
    }

    async fn delete(&self, reference: &StorageRef) -> Result<(), RemoteError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable(format!(
                "delete of {} failed",
                reference.path()
            )));
        }
        self.objects.write().await.remove(reference.path());
        Ok(())
    }
}
