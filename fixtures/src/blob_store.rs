//! In-process blob service
//!
//! Speaks the protocol the server's HTTP blob client uses:
//! `POST /upload` (multipart `file` part plus an optional `kind` text part)
//! answers `{"id", "url"}`, `DELETE /blobs/:id` removes a blob (404 when it is
//! unknown) and `GET /blobs/:id` returns its bytes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredFile {
    kind: String,
    bytes: Vec<u8>,
}

/// Shared state of the fixture; clone it to inspect or steer a running server
#[derive(Debug, Clone, Default)]
pub struct BlobFixture {
    public_url: Arc<Mutex<String>>,
    files: Arc<Mutex<HashMap<String, StoredFile>>>,
    api_key: Option<String>,
    reject_uploads: Arc<AtomicBool>,
    reject_deletes: Arc<AtomicBool>,
    deletes: Arc<AtomicUsize>,
}

impl BlobFixture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `Authorization: Bearer {key}` on every request
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Answer uploads with a 503 while set
    pub fn reject_uploads(&self, reject: bool) {
        self.reject_uploads.store(reject, Ordering::SeqCst);
    }

    /// Answer deletes with a 503 while set
    pub fn reject_deletes(&self, reject: bool) {
        self.reject_deletes.store(reject, Ordering::SeqCst);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.files.lock().map(|f| f.contains_key(id)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.files.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete requests received, successful or not
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Router serving this fixture at `addr`
    pub fn router(self, addr: SocketAddr) -> Router {
        if let Ok(mut url) = self.public_url.lock() {
            *url = format!("http://{addr}");
        }

        Router::new()
            .route("/upload", post(upload))
            .route("/blobs/:id", get(fetch).delete(remove))
            .with_state(self)
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.api_key else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected)
    }
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn upload(State(fixture): State<BlobFixture>, headers: HeaderMap, mut multipart: Multipart) -> Response {
    if !fixture.authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "missing or wrong api key");
    }
    if fixture.reject_uploads.load(Ordering::SeqCst) {
        return error(StatusCode::SERVICE_UNAVAILABLE, "uploads are disabled");
    }

    let mut bytes = None;
    let mut kind = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return error(StatusCode::BAD_REQUEST, &err.to_string()),
        };

        match field.name() {
            Some("file") => {
                let content_type = field.content_type().map(str::to_owned);
                match field.bytes().await {
                    Ok(data) => {
                        kind = kind.or(content_type);
                        bytes = Some(data.to_vec());
                    }
                    Err(err) => return error(StatusCode::BAD_REQUEST, &err.to_string()),
                }
            }
            Some("kind") => match field.text().await {
                Ok(text) => kind = Some(text),
                Err(err) => return error(StatusCode::BAD_REQUEST, &err.to_string()),
            },
            _ => {}
        }
    }

    let Some(bytes) = bytes else {
        return error(StatusCode::BAD_REQUEST, "missing file part");
    };

    let id = Uuid::new_v4().to_string();
    let base = fixture.public_url.lock().map(|u| u.clone()).unwrap_or_default();
    let url = format!("{base}/blobs/{id}");
    let file = StoredFile {
        kind: kind.unwrap_or_else(|| "application/octet-stream".to_string()),
        bytes,
    };

    info!("Stored blob {} ({} bytes, {})", id, file.bytes.len(), file.kind);
    match fixture.files.lock() {
        Ok(mut files) => {
            files.insert(id.clone(), file);
        }
        Err(_) => return error(StatusCode::INTERNAL_SERVER_ERROR, "state poisoned"),
    }

    (StatusCode::CREATED, Json(json!({ "id": id, "url": url }))).into_response()
}

async fn remove(State(fixture): State<BlobFixture>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    fixture.deletes.fetch_add(1, Ordering::SeqCst);

    if !fixture.authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "missing or wrong api key");
    }
    if fixture.reject_deletes.load(Ordering::SeqCst) {
        return error(StatusCode::SERVICE_UNAVAILABLE, "deletes are disabled");
    }

    let removed = fixture
        .files
        .lock()
        .map(|mut files| files.remove(&id).is_some())
        .unwrap_or(false);

    if removed {
        info!("Deleted blob {}", id);
        StatusCode::NO_CONTENT.into_response()
    } else {
        error(StatusCode::NOT_FOUND, "unknown blob")
    }
}

async fn fetch(State(fixture): State<BlobFixture>, Path(id): Path<String>) -> Response {
    let file = fixture.files.lock().ok().and_then(|files| files.get(&id).cloned());

    match file {
        Some(file) => ([(header::CONTENT_TYPE, file.kind)], file.bytes).into_response(),
        None => error(StatusCode::NOT_FOUND, "unknown blob"),
    }
}
