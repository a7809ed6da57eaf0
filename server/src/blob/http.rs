use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, StatusCode};
use tracing::{debug, info};

use super::{BlobError, BlobResult, BlobStore, StoredBlob};

/// Blob store reached over HTTP
///
/// Speaks a small REST protocol: `POST {base}/upload` with a multipart `file`
/// part returns `{"id", "url"}`, and `DELETE {base}/blobs/{id}` removes a blob.
/// A `404` on delete counts as success.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> BlobResult<Self> {
        let client = reqwest::ClientBuilder::new()
            .timeout(timeout)
            .use_rustls_tls()
            .build()
            .map_err(|e| BlobError::Transport(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, bytes: Vec<u8>, kind: &str) -> BlobResult<StoredBlob> {
        let size = bytes.len();
        let part = multipart::Part::bytes(bytes)
            .file_name("upload")
            .mime_str(kind)
            .map_err(|e| BlobError::Rejected(format!("invalid content type {kind}: {e}")))?;
        let form = multipart::Form::new()
            .text("kind", kind.to_string())
            .part("file", part);

        let url = format!("{}/upload", self.base_url);
        debug!("Uploading {} bytes ({}) to {}", size, kind, url);

        let response = self
            .authorize(self.client.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| BlobError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(BlobError::Rejected(format!("{status} - {error_text}")));
        }

        let blob: StoredBlob = response
            .json()
            .await
            .map_err(|e| BlobError::Decode(e.to_string()))?;

        info!("Uploaded blob {} ({} bytes)", blob.id, size);
        Ok(blob)
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        let url = format!("{}/blobs/{}", self.base_url, id);

        let response = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| BlobError::Transport(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                info!("Deleted blob {}", id);
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!("Blob {} already absent", id);
                Ok(())
            }
            status => {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Failed to read error response".to_string());
                Err(BlobError::Rejected(format!("{status} - {error_text}")))
            }
        }
    }
}
