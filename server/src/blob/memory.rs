use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{BlobResult, BlobStore, StoredBlob};

/// Process-local blob store, used when no `BLOB_STORE_URL` is configured
#[derive(Debug)]
pub struct MemoryBlobStore {
    base_url: String,
    blobs: Mutex<HashMap<String, StoredObject>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    kind: String,
    bytes: Vec<u8>,
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content type and bytes of a stored blob
    pub fn get(&self, id: &str) -> Option<(String, Vec<u8>)> {
        self.lock()
            .get(id)
            .map(|object| (object.kind.clone(), object.bytes.clone()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredObject>> {
        // A poisoned map is still structurally valid; every write is a single insert or remove
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new("memory://blobs")
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bytes: Vec<u8>, kind: &str) -> BlobResult<StoredBlob> {
        let id = Uuid::new_v4().to_string();
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), id);

        self.lock().insert(
            id.clone(),
            StoredObject {
                kind: kind.to_string(),
                bytes,
            },
        );

        Ok(StoredBlob { id, url })
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        self.lock().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_delete() {
        let store = MemoryBlobStore::new("http://cdn.test/");

        let blob = store.upload(b"avatar".to_vec(), "image/png").await.unwrap();
        assert!(store.contains(&blob.id));
        assert_eq!(blob.url, format!("http://cdn.test/{}", blob.id));
        assert_eq!(
            store.get(&blob.id),
            Some(("image/png".to_string(), b"avatar".to_vec()))
        );

        store.delete(&blob.id).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_blob_is_a_noop() {
        let store = MemoryBlobStore::default();
        store.delete("never-uploaded").await.unwrap();
        store.delete("never-uploaded").await.unwrap();
        assert!(store.is_empty());
    }
}
