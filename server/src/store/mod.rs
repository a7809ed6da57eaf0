//! Record store contracts
//!
//! The core never talks to a database directly. It goes through these traits,
//! which promise single-write atomic creation and compare-and-swap updates on the
//! stored refresh token. `PgStore` backs production and `MemoryStore` backs tests
//! and local development.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{Identity, MediaRef, NewIdentity, NewVideo, OrphanedBlob, Video};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Find an identity holding either natural key (username or email)
    async fn find_by_natural_key(&self, username: &str, email: &str) -> StoreResult<Option<Identity>>;

    /// Find an identity by username or by email
    async fn find_by_login(&self, login: &str) -> StoreResult<Option<Identity>>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Identity>>;

    /// Insert the identity in a single atomic write; `Conflict` if a natural key is taken
    async fn create(&self, new: NewIdentity) -> StoreResult<Identity>;

    /// Unconditionally overwrite (or clear) the stored refresh token digest
    async fn set_refresh_token(&self, id: Uuid, digest: Option<&str>) -> StoreResult<()>;

    /// Replace the stored digest with `new` only if it currently equals `expected`
    ///
    /// Returns `false` when the stored value differs, including when it is empty.
    async fn swap_refresh_token(&self, id: Uuid, expected: &str, new: Option<&str>) -> StoreResult<bool>;

    /// Replace the password hash and clear the refresh token, only if the stored
    /// hash is still `expected_hash`
    async fn update_password(&self, id: Uuid, expected_hash: &str, password_hash: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait VideoStore: Send + Sync {
    /// The video `owner_id` published under `title`, if any
    async fn find_by_title(&self, owner_id: Uuid, title: &str) -> StoreResult<Option<Video>>;

    /// Insert the video in a single atomic write; `Conflict` on a duplicate title
    async fn create(&self, new: NewVideo) -> StoreResult<Video>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Video>>;
}

/// Ledger of blobs whose compensating delete failed
#[async_trait]
pub trait OrphanStore: Send + Sync {
    async fn record_orphan(&self, blob: &MediaRef) -> StoreResult<()>;

    /// Oldest orphans first
    async fn list_orphans(&self, limit: usize) -> StoreResult<Vec<OrphanedBlob>>;

    async fn forget_orphan(&self, blob_id: &str) -> StoreResult<()>;

    /// Whether any identity or video still points at `blob_id`
    async fn is_referenced(&self, blob_id: &str) -> StoreResult<bool>;
}
