//! Blob store client
//! Uploads and deletes opaque binary objects (avatars, cover images, video files)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod http;
pub mod memory;

pub use http::HttpBlobStore;
pub use memory::MemoryBlobStore;

/// Lifecycle state of an uploaded blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobState {
    /// Uploaded but not yet referenced by a created record
    Pending,
    /// Referenced by a successfully created record
    Committed,
}

/// A blob as returned by the blob store after an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlob {
    pub id: String,
    pub url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob store unreachable: {0}")]
    Transport(String),
    #[error("blob store rejected the request: {0}")]
    Rejected(String),
    #[error("blob store returned an unreadable response: {0}")]
    Decode(String),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Contract of the external blob store
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return a stable id plus a retrieval URL
    ///
    /// `kind` is a content-type hint, e.g. `image/png`
    async fn upload(&self, bytes: Vec<u8>, kind: &str) -> BlobResult<StoredBlob>;

    /// Delete a blob. Deleting an id that does not exist succeeds.
    async fn delete(&self, id: &str) -> BlobResult<()>;
}

/// Best guess at the content type of an upload from its magic bytes
pub fn sniff_kind(bytes: &[u8]) -> &'static str {
    match infer::get(bytes) {
        Some(kind) => kind.mime_type(),
        None => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_kind_detects_png() {
        let png_header = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(sniff_kind(&png_header), "image/png");
    }

    #[test]
    fn test_sniff_kind_falls_back_to_octet_stream() {
        assert_eq!(sniff_kind(b"just some text"), "application/octet-stream");
    }
}
