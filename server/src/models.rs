use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A committed reference from a record to a blob in the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub blob_id: String,
    pub url: String,
}

/// Represents a registered user
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: Uuid,
    /// Lower-cased, unique
    pub username: String,
    /// Lower-cased, unique
    pub email: String,
    pub fullname: String,
    /// Argon2id PHC string
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub avatar: Option<MediaRef>,
    pub cover_image: Option<MediaRef>,
    /// Digest of the one refresh token currently valid for this identity
    #[serde(skip_serializing)]
    pub refresh_token_digest: Option<String>,
    /// Bumped on every write to the record
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to insert an identity in one write
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub username: String,
    pub email: String,
    pub fullname: String,
    pub password_hash: String,
    pub avatar: Option<MediaRef>,
    pub cover_image: Option<MediaRef>,
}

/// A published content item
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub description: String,
    pub video_file: MediaRef,
    pub thumbnail: Option<MediaRef>,
    pub is_published: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVideo {
    pub owner_id: Uuid,
    pub title: String,
    pub description: String,
    pub video_file: MediaRef,
    pub thumbnail: Option<MediaRef>,
}

/// A blob whose compensating delete failed and still needs to be removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedBlob {
    pub blob_id: String,
    pub url: String,
    pub recorded_at: DateTime<Utc>,
}
