use axum::extract::{Multipart, Path, State};
use uuid::Uuid;

use crate::auth::AuthIdentity;
use crate::errors::AppResult;
use crate::models::Video;
use crate::state::AppState;
use crate::videos::{VideoFields, VideoUploads, THUMBNAIL_SLOT, VIDEO_FILE_SLOT};

use super::{ApiResponse, MultipartForm};

pub async fn publish(
    State(state): State<AppState>,
    AuthIdentity(owner): AuthIdentity,
    multipart: Multipart,
) -> AppResult<ApiResponse<Video>> {
    let mut form = MultipartForm::read(multipart).await?;

    let fields = VideoFields {
        title: form.text("title"),
        description: form.text("description"),
    };
    let uploads = VideoUploads {
        video_file: form.take_file(VIDEO_FILE_SLOT),
        thumbnail: form.take_file(THUMBNAIL_SLOT),
    };

    let video = state.videos.publish(owner.id, fields, uploads).await?;
    Ok(ApiResponse::created(video, "Video published successfully"))
}

pub async fn get_video(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<ApiResponse<Video>> {
    let video = state.videos.get(id).await?;
    Ok(ApiResponse::ok(video, "Video fetched successfully"))
}
