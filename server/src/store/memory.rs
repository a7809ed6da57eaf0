use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{IdentityStore, OrphanStore, StoreError, StoreResult, VideoStore};
use crate::models::{Identity, MediaRef, NewIdentity, NewVideo, OrphanedBlob, Video};

/// In-process record store
///
/// Every operation runs inside one short critical section, which is what makes
/// `create` atomic and `swap_refresh_token` a true compare-and-swap here.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    identities: HashMap<Uuid, Identity>,
    videos: HashMap<Uuid, Video>,
    orphans: HashMap<String, OrphanedBlob>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity_count(&self) -> usize {
        self.lock().identities.len()
    }

    pub fn video_count(&self) -> usize {
        self.lock().videos.len()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn identity_mut<'a>(tables: &'a mut Tables, id: Uuid) -> StoreResult<&'a mut Identity> {
    tables
        .identities
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(format!("identity {id}")))
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_by_natural_key(&self, username: &str, email: &str) -> StoreResult<Option<Identity>> {
        Ok(self
            .lock()
            .identities
            .values()
            .find(|i| i.username == username || i.email == email)
            .cloned())
    }

    async fn find_by_login(&self, login: &str) -> StoreResult<Option<Identity>> {
        Ok(self
            .lock()
            .identities
            .values()
            .find(|i| i.username == login || i.email == login)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Identity>> {
        Ok(self.lock().identities.get(&id).cloned())
    }

    async fn create(&self, new: NewIdentity) -> StoreResult<Identity> {
        let mut tables = self.lock();

        if tables
            .identities
            .values()
            .any(|i| i.username == new.username || i.email == new.email)
        {
            return Err(StoreError::Conflict(format!(
                "identity with username {} or email {} already exists",
                new.username, new.email
            )));
        }

        let now = Utc::now();
        let identity = Identity {
            id: Uuid::new_v4(),
            username: new.username,
            email: new.email,
            fullname: new.fullname,
            password_hash: new.password_hash,
            avatar: new.avatar,
            cover_image: new.cover_image,
            refresh_token_digest: None,
            revision: 1,
            created_at: now,
            updated_at: now,
        };
        tables.identities.insert(identity.id, identity.clone());

        Ok(identity)
    }

    async fn set_refresh_token(&self, id: Uuid, digest: Option<&str>) -> StoreResult<()> {
        let mut tables = self.lock();
        let identity = identity_mut(&mut tables, id)?;
        identity.refresh_token_digest = digest.map(str::to_string);
        identity.revision += 1;
        identity.updated_at = Utc::now();
        Ok(())
    }

    async fn swap_refresh_token(&self, id: Uuid, expected: &str, new: Option<&str>) -> StoreResult<bool> {
        let mut tables = self.lock();
        let identity = identity_mut(&mut tables, id)?;

        if identity.refresh_token_digest.as_deref() != Some(expected) {
            return Ok(false);
        }

        identity.refresh_token_digest = new.map(str::to_string);
        identity.revision += 1;
        identity.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_password(&self, id: Uuid, expected_hash: &str, password_hash: &str) -> StoreResult<bool> {
        let mut tables = self.lock();
        let identity = identity_mut(&mut tables, id)?;

        if identity.password_hash != expected_hash {
            return Ok(false);
        }

        identity.password_hash = password_hash.to_string();
        identity.refresh_token_digest = None;
        identity.revision += 1;
        identity.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl VideoStore for MemoryStore {
    async fn find_by_title(&self, owner_id: Uuid, title: &str) -> StoreResult<Option<Video>> {
        Ok(self
            .lock()
            .videos
            .values()
            .find(|v| v.owner_id == owner_id && v.title == title)
            .cloned())
    }

    async fn create(&self, new: NewVideo) -> StoreResult<Video> {
        let mut tables = self.lock();

        if tables
            .videos
            .values()
            .any(|v| v.owner_id == new.owner_id && v.title == new.title)
        {
            return Err(StoreError::Conflict(format!(
                "video titled {:?} already exists for this owner",
                new.title
            )));
        }

        let video = Video {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            title: new.title,
            description: new.description,
            video_file: new.video_file,
            thumbnail: new.thumbnail,
            is_published: true,
            created_at: Utc::now(),
        };
        tables.videos.insert(video.id, video.clone());

        Ok(video)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Video>> {
        Ok(self.lock().videos.get(&id).cloned())
    }
}

#[async_trait]
impl OrphanStore for MemoryStore {
    async fn record_orphan(&self, blob: &MediaRef) -> StoreResult<()> {
        self.lock()
            .orphans
            .entry(blob.blob_id.clone())
            .or_insert_with(|| OrphanedBlob {
                blob_id: blob.blob_id.clone(),
                url: blob.url.clone(),
                recorded_at: Utc::now(),
            });
        Ok(())
    }

    async fn list_orphans(&self, limit: usize) -> StoreResult<Vec<OrphanedBlob>> {
        let mut orphans: Vec<OrphanedBlob> = self.lock().orphans.values().cloned().collect();
        orphans.sort_by_key(|o| o.recorded_at);
        orphans.truncate(limit);
        Ok(orphans)
    }

    async fn forget_orphan(&self, blob_id: &str) -> StoreResult<()> {
        self.lock().orphans.remove(blob_id);
        Ok(())
    }

    async fn is_referenced(&self, blob_id: &str) -> StoreResult<bool> {
        let tables = self.lock();
        let holds = |media: &Option<MediaRef>| media.as_ref().is_some_and(|m| m.blob_id == blob_id);

        Ok(tables
            .identities
            .values()
            .any(|i| holds(&i.avatar) || holds(&i.cover_image))
            || tables
                .videos
                .values()
                .any(|v| v.video_file.blob_id == blob_id || holds(&v.thumbnail)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_identity(username: &str, email: &str) -> NewIdentity {
        NewIdentity {
            username: username.to_string(),
            email: email.to_string(),
            fullname: "Test User".to_string(),
            password_hash: "hash".to_string(),
            avatar: None,
            cover_image: None,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_natural_keys() {
        let store = MemoryStore::new();
        IdentityStore::create(&store, new_identity("alice", "alice@example.com"))
            .await
            .unwrap();

        let by_username = IdentityStore::create(&store, new_identity("alice", "other@example.com")).await;
        assert!(matches!(by_username, Err(StoreError::Conflict(_))));

        let by_email = IdentityStore::create(&store, new_identity("bob", "alice@example.com")).await;
        assert!(matches!(by_email, Err(StoreError::Conflict(_))));

        assert_eq!(store.identity_count(), 1);
    }

    #[tokio::test]
    async fn test_swap_only_succeeds_on_matching_value() {
        let store = MemoryStore::new();
        let identity = IdentityStore::create(&store, new_identity("alice", "alice@example.com"))
            .await
            .unwrap();

        // Nothing stored yet, so no expected value can match
        assert!(!store.swap_refresh_token(identity.id, "r0", Some("r1")).await.unwrap());

        store.set_refresh_token(identity.id, Some("r0")).await.unwrap();
        assert!(store.swap_refresh_token(identity.id, "r0", Some("r1")).await.unwrap());
        assert!(!store.swap_refresh_token(identity.id, "r0", Some("r2")).await.unwrap());

        let stored = IdentityStore::find_by_id(&store, identity.id).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token_digest.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_update_password_is_guarded_on_the_old_hash() {
        let store = MemoryStore::new();
        let identity = IdentityStore::create(&store, new_identity("alice", "alice@example.com"))
            .await
            .unwrap();

        // A refresh token write in between does not get in the way
        store.set_refresh_token(identity.id, Some("r0")).await.unwrap();
        assert!(store.update_password(identity.id, "hash", "new-hash").await.unwrap());

        let updated = IdentityStore::find_by_id(&store, identity.id).await.unwrap().unwrap();
        assert_eq!(updated.password_hash, "new-hash");
        assert_eq!(updated.refresh_token_digest, None);
        assert!(updated.revision > identity.revision);

        // The old hash is gone, so a second writer holding it loses
        assert!(!store.update_password(identity.id, "hash", "other-hash").await.unwrap());
    }

    #[tokio::test]
    async fn test_is_referenced_sees_identity_and_video_blobs() {
        let store = MemoryStore::new();
        let mut new = new_identity("alice", "alice@example.com");
        new.avatar = Some(MediaRef {
            blob_id: "avatar-1".to_string(),
            url: "memory://blobs/avatar-1".to_string(),
        });
        let identity = IdentityStore::create(&store, new).await.unwrap();

        VideoStore::create(
            &store,
            NewVideo {
                owner_id: identity.id,
                title: "clip".to_string(),
                description: String::new(),
                video_file: MediaRef {
                    blob_id: "video-1".to_string(),
                    url: "memory://blobs/video-1".to_string(),
                },
                thumbnail: None,
            },
        )
        .await
        .unwrap();

        assert!(store.is_referenced("avatar-1").await.unwrap());
        assert!(store.is_referenced("video-1").await.unwrap());
        assert!(!store.is_referenced("stray").await.unwrap());
        assert!(store.find_by_title(identity.id, "clip").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_identity_is_not_found() {
        let store = MemoryStore::new();
        let result = store.set_refresh_token(Uuid::new_v4(), None).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_orphans_are_deduplicated_and_forgotten() {
        let store = MemoryStore::new();
        let blob = MediaRef {
            blob_id: "b1".to_string(),
            url: "memory://blobs/b1".to_string(),
        };

        store.record_orphan(&blob).await.unwrap();
        store.record_orphan(&blob).await.unwrap();
        assert_eq!(store.list_orphans(10).await.unwrap().len(), 1);

        store.forget_orphan("b1").await.unwrap();
        assert!(store.list_orphans(10).await.unwrap().is_empty());
    }
}
