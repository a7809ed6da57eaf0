use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use super::{IdentityStore, OrphanStore, StoreError, StoreResult, VideoStore};
use crate::models::{Identity, MediaRef, NewIdentity, NewVideo, OrphanedBlob, Video};

/// Postgres-backed record store
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, then run migrations while holding an advisory lock so that
    /// several instances starting together don't race each other
    #[tracing::instrument(skip_all, err)]
    pub async fn connect(database_url: &str) -> color_eyre::Result<Self> {
        const MIGRATION_LOCK_ID: i64 = 0x71D_7BE_71D_7BE;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&pool)
            .await?;

        sqlx::migrate!("../migrations").run(&pool).await?;

        let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .fetch_one(&pool)
            .await?;

        if unlocked {
            tracing::info!("Migration lock unlocked");
        } else {
            tracing::warn!("Failed to unlock migration lock");
        }

        Ok(Self::new(pool))
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn media_ref(blob_id: Option<String>, url: Option<String>) -> Option<MediaRef> {
    match (blob_id, url) {
        (Some(blob_id), Some(url)) => Some(MediaRef { blob_id, url }),
        _ => None,
    }
}

const IDENTITY_COLUMNS: &str = "id, username, email, fullname, password_hash, \
     avatar_blob_id, avatar_url, cover_blob_id, cover_url, \
     refresh_token_digest, revision, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct IdentityRow {
    id: Uuid,
    username: String,
    email: String,
    fullname: String,
    password_hash: String,
    avatar_blob_id: Option<String>,
    avatar_url: Option<String>,
    cover_blob_id: Option<String>,
    cover_url: Option<String>,
    refresh_token_digest: Option<String>,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<IdentityRow> for Identity {
    fn from(row: IdentityRow) -> Self {
        Identity {
            id: row.id,
            username: row.username,
            email: row.email,
            fullname: row.fullname,
            password_hash: row.password_hash,
            avatar: media_ref(row.avatar_blob_id, row.avatar_url),
            cover_image: media_ref(row.cover_blob_id, row.cover_url),
            refresh_token_digest: row.refresh_token_digest,
            revision: row.revision,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const VIDEO_COLUMNS: &str = "id, owner_id, title, description, video_blob_id, video_url, \
     thumbnail_blob_id, thumbnail_url, is_published, created_at";

#[derive(sqlx::FromRow)]
struct VideoRow {
    id: Uuid,
    owner_id: Uuid,
    title: String,
    description: String,
    video_blob_id: String,
    video_url: String,
    thumbnail_blob_id: Option<String>,
    thumbnail_url: Option<String>,
    is_published: bool,
    created_at: DateTime<Utc>,
}

impl From<VideoRow> for Video {
    fn from(row: VideoRow) -> Self {
        Video {
            id: row.id,
            owner_id: row.owner_id,
            title: row.title,
            description: row.description,
            video_file: MediaRef {
                blob_id: row.video_blob_id,
                url: row.video_url,
            },
            thumbnail: media_ref(row.thumbnail_blob_id, row.thumbnail_url),
            is_published: row.is_published,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl IdentityStore for PgStore {
    async fn find_by_natural_key(&self, username: &str, email: &str) -> StoreResult<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE username = $1 OR email = $2 LIMIT 1");
        let row: Option<IdentityRow> = sqlx::query_as(&sql)
            .bind(username)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(Identity::from))
    }

    async fn find_by_login(&self, login: &str) -> StoreResult<Option<Identity>> {
        self.find_by_natural_key(login, login).await
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let row: Option<IdentityRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(Identity::from))
    }

    async fn create(&self, new: NewIdentity) -> StoreResult<Identity> {
        let sql = format!(
            "INSERT INTO identities (
                id, username, email, fullname, password_hash,
                avatar_blob_id, avatar_url, cover_blob_id, cover_url
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {IDENTITY_COLUMNS}"
        );

        let row: IdentityRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.username)
            .bind(&new.email)
            .bind(&new.fullname)
            .bind(&new.password_hash)
            .bind(new.avatar.as_ref().map(|m| m.blob_id.as_str()))
            .bind(new.avatar.as_ref().map(|m| m.url.as_str()))
            .bind(new.cover_image.as_ref().map(|m| m.blob_id.as_str()))
            .bind(new.cover_image.as_ref().map(|m| m.url.as_str()))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        tracing::info!("Created new identity with ID: {}", row.id);
        Ok(row.into())
    }

    async fn set_refresh_token(&self, id: Uuid, digest: Option<&str>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE identities
            SET refresh_token_digest = $2, revision = revision + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(digest)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("identity {id}")));
        }
        Ok(())
    }

    async fn swap_refresh_token(&self, id: Uuid, expected: &str, new: Option<&str>) -> StoreResult<bool> {
        // The WHERE clause is the compare half of the compare-and-swap
        let result = sqlx::query(
            r#"
            UPDATE identities
            SET refresh_token_digest = $3, revision = revision + 1, updated_at = NOW()
            WHERE id = $1 AND refresh_token_digest = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(new)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_password(&self, id: Uuid, expected_hash: &str, password_hash: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE identities
            SET password_hash = $3, refresh_token_digest = NULL,
                revision = revision + 1, updated_at = NOW()
            WHERE id = $1 AND password_hash = $2
            "#,
        )
        .bind(id)
        .bind(expected_hash)
        .bind(password_hash)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl VideoStore for PgStore {
    async fn find_by_title(&self, owner_id: Uuid, title: &str) -> StoreResult<Option<Video>> {
        let sql = format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE owner_id = $1 AND title = $2");
        let row: Option<VideoRow> = sqlx::query_as(&sql)
            .bind(owner_id)
            .bind(title)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(Video::from))
    }

    async fn create(&self, new: NewVideo) -> StoreResult<Video> {
        let sql = format!(
            "INSERT INTO videos (
                id, owner_id, title, description, video_blob_id, video_url,
                thumbnail_blob_id, thumbnail_url
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {VIDEO_COLUMNS}"
        );

        let row: VideoRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(new.owner_id)
            .bind(&new.title)
            .bind(&new.description)
            .bind(&new.video_file.blob_id)
            .bind(&new.video_file.url)
            .bind(new.thumbnail.as_ref().map(|m| m.blob_id.as_str()))
            .bind(new.thumbnail.as_ref().map(|m| m.url.as_str()))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Video>> {
        let sql = format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = $1");
        let row: Option<VideoRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(Video::from))
    }
}

#[async_trait]
impl OrphanStore for PgStore {
    async fn record_orphan(&self, blob: &MediaRef) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orphaned_blobs (blob_id, url) VALUES ($1, $2)
            ON CONFLICT (blob_id) DO NOTHING
            "#,
        )
        .bind(&blob.blob_id)
        .bind(&blob.url)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn list_orphans(&self, limit: usize) -> StoreResult<Vec<OrphanedBlob>> {
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT blob_id, url, recorded_at FROM orphaned_blobs ORDER BY recorded_at LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|(blob_id, url, recorded_at)| OrphanedBlob {
                blob_id,
                url,
                recorded_at,
            })
            .collect())
    }

    async fn forget_orphan(&self, blob_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM orphaned_blobs WHERE blob_id = $1")
            .bind(blob_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn is_referenced(&self, blob_id: &str) -> StoreResult<bool> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM identities WHERE avatar_blob_id = $1 OR cover_blob_id = $1
            ) OR EXISTS (
                SELECT 1 FROM videos WHERE video_blob_id = $1 OR thumbnail_blob_id = $1
            )
            "#,
        )
        .bind(blob_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }
}
