#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use vidtube::accounts::{Credentials, LoginOutcome, RegisterFields, RegisterUploads};
use vidtube::blob::{memory::MemoryBlobStore, BlobError, BlobResult, BlobStore, StoredBlob};
use vidtube::deadline::Deadlines;
use vidtube::models::{Identity, NewIdentity};
use vidtube::session::ReusePolicy;
use vidtube::state::{AppState, HttpSettings, Stores};
use vidtube::store::{IdentityStore, MemoryStore, StoreError, StoreResult};
use vidtube::tokens::TokenIssuer;

pub const PASSWORD: &str = "correct horse battery";

/// Smallest byte string `infer` recognises as a PNG
pub fn png(tag: u8) -> Vec<u8> {
    vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, tag]
}

/// Blob store double that counts calls and fails on demand
#[derive(Debug, Default)]
pub struct ScriptedBlobStore {
    inner: MemoryBlobStore,
    uploads: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    failing_payloads: Mutex<Vec<Vec<u8>>>,
    fail_deletes: AtomicBool,
    upload_delay: Mutex<Option<Duration>>,
    payload_delays: Mutex<Vec<(Vec<u8>, Duration)>>,
    uploaded: Mutex<Vec<String>>,
}

impl ScriptedBlobStore {
    /// Any upload of exactly these bytes fails
    pub fn fail_upload_of(&self, bytes: &[u8]) {
        self.failing_payloads.lock().unwrap().push(bytes.to_vec());
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn delay_uploads(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = Some(delay);
    }

    /// Uploads of exactly these bytes take `delay` longer
    pub fn delay_upload_of(&self, bytes: &[u8], delay: Duration) {
        self.payload_delays.lock().unwrap().push((bytes.to_vec(), delay));
    }

    pub fn upload_calls(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Ids passed to delete, in call order
    pub fn delete_calls(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Ids of successful uploads, in completion order
    pub fn uploaded_ids(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }

    pub fn stored(&self) -> usize {
        self.inner.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains(id)
    }
}

#[async_trait]
impl BlobStore for ScriptedBlobStore {
    async fn upload(&self, bytes: Vec<u8>, kind: &str) -> BlobResult<StoredBlob> {
        self.uploads.fetch_add(1, Ordering::SeqCst);

        let delay = *self.upload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let extra = self
            .payload_delays
            .lock()
            .unwrap()
            .iter()
            .find(|(payload, _)| *payload == bytes)
            .map(|(_, delay)| *delay);
        if let Some(delay) = extra {
            tokio::time::sleep(delay).await;
        }

        let fails = self.failing_payloads.lock().unwrap().contains(&bytes);
        if fails {
            return Err(BlobError::Rejected("503 - injected upload failure".into()));
        }

        let stored = self.inner.upload(bytes, kind).await?;
        self.uploaded.lock().unwrap().push(stored.id.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        self.deleted.lock().unwrap().push(id.to_string());

        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError::Transport("injected delete failure".into()));
        }

        self.inner.delete(id).await
    }
}

/// Identity store double over `MemoryStore` whose writes can fail or stall
#[derive(Default)]
pub struct FlakyIdentities {
    inner: Arc<MemoryStore>,
    fail_create: AtomicBool,
    stall_before_insert: Mutex<Option<Duration>>,
    stall_after_insert: Mutex<Option<Duration>>,
    hide_existing: AtomicBool,
    break_lookups_after_create: AtomicBool,
    create_attempted: AtomicBool,
    refresh_before_password_write: AtomicBool,
}

impl FlakyIdentities {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Inserts wait `delay` before writing anything
    pub fn stall_before_insert(&self, delay: Duration) {
        *self.stall_before_insert.lock().unwrap() = Some(delay);
    }

    /// Inserts write the record, then wait `delay` before acknowledging
    pub fn stall_after_insert(&self, delay: Duration) {
        *self.stall_after_insert.lock().unwrap() = Some(delay);
    }

    /// Natural key lookups report nothing, as if racing a concurrent insert
    pub fn hide_existing(&self, hide: bool) {
        self.hide_existing.store(hide, Ordering::SeqCst);
    }

    /// Natural key lookups fail once an insert has been attempted
    pub fn break_lookups_after_create(&self, broken: bool) {
        self.break_lookups_after_create.store(broken, Ordering::SeqCst);
    }

    /// Another device refreshes its session right before each password write
    pub fn refresh_before_password_write(&self, refresh: bool) {
        self.refresh_before_password_write.store(refresh, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityStore for FlakyIdentities {
    async fn find_by_natural_key(&self, username: &str, email: &str) -> StoreResult<Option<Identity>> {
        if self.break_lookups_after_create.load(Ordering::SeqCst) && self.create_attempted.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected lookup failure".into()));
        }
        if self.hide_existing.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_by_natural_key(username, email).await
    }

    async fn find_by_login(&self, login: &str) -> StoreResult<Option<Identity>> {
        self.inner.find_by_login(login).await
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Identity>> {
        IdentityStore::find_by_id(self.inner.as_ref(), id).await
    }

    async fn create(&self, new: NewIdentity) -> StoreResult<Identity> {
        self.create_attempted.store(true, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected insert failure".into()));
        }

        let before = *self.stall_before_insert.lock().unwrap();
        if let Some(delay) = before {
            tokio::time::sleep(delay).await;
        }

        let created = IdentityStore::create(self.inner.as_ref(), new).await?;

        let after = *self.stall_after_insert.lock().unwrap();
        if let Some(delay) = after {
            tokio::time::sleep(delay).await;
        }
        Ok(created)
    }

    async fn set_refresh_token(&self, id: Uuid, digest: Option<&str>) -> StoreResult<()> {
        self.inner.set_refresh_token(id, digest).await
    }

    async fn swap_refresh_token(&self, id: Uuid, expected: &str, new: Option<&str>) -> StoreResult<bool> {
        self.inner.swap_refresh_token(id, expected, new).await
    }

    async fn update_password(&self, id: Uuid, expected_hash: &str, password_hash: &str) -> StoreResult<bool> {
        if self.refresh_before_password_write.load(Ordering::SeqCst) {
            self.inner.set_refresh_token(id, Some("other-device")).await?;
        }
        self.inner.update_password(id, expected_hash, password_hash).await
    }
}

/// The application wired over in-memory doubles
pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub identities: Arc<FlakyIdentities>,
    pub blobs: Arc<ScriptedBlobStore>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with(ReusePolicy::default(), Deadlines::default())
    }

    pub fn with_policy(policy: ReusePolicy) -> Self {
        Self::with(policy, Deadlines::default())
    }

    pub fn with_deadlines(deadlines: Deadlines) -> Self {
        Self::with(ReusePolicy::default(), deadlines)
    }

    pub fn with(policy: ReusePolicy, deadlines: Deadlines) -> Self {
        let store = Arc::new(MemoryStore::new());
        let identities = Arc::new(FlakyIdentities::new(store.clone()));
        let blobs = Arc::new(ScriptedBlobStore::default());

        let stores = Stores {
            identities: identities.clone(),
            videos: store.clone(),
            orphans: store.clone(),
        };

        let state = AppState::new(
            stores,
            blobs.clone(),
            issuer(),
            policy,
            deadlines,
            HttpSettings::default(),
        );

        Self {
            state,
            store,
            identities,
            blobs,
        }
    }

    pub async fn register(&self, username: &str) -> Identity {
        self.state
            .accounts
            .register(fields(username), avatar_only(1))
            .await
            .expect("registration succeeds")
    }

    pub async fn login(&self, username: &str) -> LoginOutcome {
        self.state
            .accounts
            .login(Credentials {
                login: username.to_string(),
                password: PASSWORD.to_string(),
            })
            .await
            .expect("login succeeds")
    }
}

/// Poll `check` until it holds, failing the test after a few seconds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition did not hold in time");
}

pub fn issuer() -> TokenIssuer {
    TokenIssuer::hmac(
        b"test-access-secret",
        b"test-refresh-secret",
        chrono::Duration::minutes(15),
        chrono::Duration::days(10),
    )
}

pub fn fields(username: &str) -> RegisterFields {
    RegisterFields {
        fullname: format!("{username} tester"),
        username: username.to_string(),
        email: format!("{username}@example.com"),
        password: PASSWORD.to_string(),
    }
}

pub fn avatar_only(tag: u8) -> RegisterUploads {
    RegisterUploads {
        avatar: Some(png(tag)),
        cover_image: None,
    }
}

pub fn avatar_and_cover(avatar: Vec<u8>, cover: Vec<u8>) -> RegisterUploads {
    RegisterUploads {
        avatar: Some(avatar),
        cover_image: Some(cover),
    }
}
