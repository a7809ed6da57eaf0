use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::accounts::require_field;
use crate::deadline::bounded;
use crate::errors::{AppError, AppResult};
use crate::models::{NewVideo, Video};
use crate::saga::{CreationSaga, CreationTarget, UploadedAssets, Upload};
use crate::store::{StoreResult, VideoStore};

pub const VIDEO_FILE_SLOT: &str = "videoFile";
pub const THUMBNAIL_SLOT: &str = "thumbnail";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoFields {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct VideoUploads {
    pub video_file: Option<Vec<u8>>,
    pub thumbnail: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct VideoDraft {
    pub owner_id: Uuid,
    pub title: String,
    pub description: String,
}

struct VideoTarget<'a> {
    videos: &'a dyn VideoStore,
}

#[async_trait]
impl CreationTarget for VideoTarget<'_> {
    type Payload = VideoDraft;
    type Record = Video;

    fn entity(&self) -> &'static str {
        "video"
    }

    fn natural_key(&self, payload: &VideoDraft) -> String {
        format!("{}/{}", payload.owner_id, payload.title)
    }

    async fn exists(&self, payload: &VideoDraft) -> StoreResult<bool> {
        Ok(self.find_created(payload).await?.is_some())
    }

    async fn create_atomic(&self, payload: VideoDraft, assets: &UploadedAssets) -> AppResult<Video> {
        let video_file = assets
            .get(VIDEO_FILE_SLOT)
            .ok_or_else(|| AppError::validation("video file is required"))?;

        let new = NewVideo {
            owner_id: payload.owner_id,
            title: payload.title,
            description: payload.description,
            video_file,
            thumbnail: assets.get(THUMBNAIL_SLOT),
        };

        Ok(self.videos.create(new).await?)
    }

    async fn find_created(&self, payload: &VideoDraft) -> StoreResult<Option<Video>> {
        self.videos.find_by_title(payload.owner_id, &payload.title).await
    }

    fn referenced_blobs(&self, record: &Video) -> Vec<String> {
        std::iter::once(&record.video_file)
            .chain(record.thumbnail.as_ref())
            .map(|media| media.blob_id.clone())
            .collect()
    }
}

/// Publishing and reading content items
#[derive(Clone)]
pub struct Videos {
    videos: Arc<dyn VideoStore>,
    saga: CreationSaga,
    record_deadline: Duration,
}

impl Videos {
    pub fn new(videos: Arc<dyn VideoStore>, saga: CreationSaga, record_deadline: Duration) -> Self {
        Self {
            videos,
            saga,
            record_deadline,
        }
    }

    /// Publish a video owned by `owner_id`; titles are unique per owner
    #[tracing::instrument(skip_all, fields(owner = %owner_id, title = %fields.title))]
    pub async fn publish(&self, owner_id: Uuid, fields: VideoFields, uploads: VideoUploads) -> AppResult<Video> {
        let title = require_field("title", &fields.title)?;
        let description = fields.description.trim().to_string();

        let video_file = match uploads.video_file {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Err(AppError::validation("video file is required")),
        };

        let mut attachments = vec![Upload::required(VIDEO_FILE_SLOT, video_file)];
        if let Some(thumbnail) = uploads.thumbnail {
            attachments.push(Upload::optional(THUMBNAIL_SLOT, thumbnail));
        }

        let draft = VideoDraft {
            owner_id,
            title,
            description,
        };

        let target = VideoTarget {
            videos: self.videos.as_ref(),
        };
        let created = self.saga.create(&target, draft, attachments).await?;

        info!("Published video {} for identity {}", created.record.id, owner_id);
        Ok(created.record)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Video> {
        bounded(self.record_deadline, "video lookup", self.videos.find_by_id(id))
            .await?
            .ok_or_else(|| AppError::not_found(format!("video {id}")))
    }
}
