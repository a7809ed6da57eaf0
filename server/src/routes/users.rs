use axum::{
    extract::{Multipart, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::accounts::{Credentials, RegisterFields, RegisterUploads, AVATAR_SLOT, COVER_IMAGE_SLOT};
use crate::auth::AuthIdentity;
use crate::errors::AppResult;
use crate::models::Identity;
use crate::state::AppState;
use crate::tokens::TokenPair;

use super::{ApiResponse, MultipartForm};

pub async fn register(State(state): State<AppState>, multipart: Multipart) -> AppResult<ApiResponse<Identity>> {
    let mut form = MultipartForm::read(multipart).await?;

    let fields = RegisterFields {
        fullname: form.text("fullname"),
        username: form.text("username"),
        email: form.text("email"),
        password: form.text("password"),
    };
    let uploads = RegisterUploads {
        avatar: form.take_file(AVATAR_SLOT),
        cover_image: form.take_file(COVER_IMAGE_SLOT),
    };

    let identity = state.accounts.register(fields, uploads).await?;
    Ok(ApiResponse::created(identity, "User registered successfully"))
}

/// Login accepts the username or the email under any of these keys
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    user: Identity,
    #[serde(flatten)]
    tokens: TokenPair,
}

pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> AppResult<ApiResponse<SessionData>> {
    let login = body.login.or(body.username).or(body.email).unwrap_or_default();

    let outcome = state
        .accounts
        .login(Credentials {
            login,
            password: body.password,
        })
        .await?;

    Ok(ApiResponse::ok(
        SessionData {
            user: outcome.identity,
            tokens: outcome.tokens,
        },
        "User logged in successfully",
    ))
}

pub async fn logout(State(state): State<AppState>, AuthIdentity(identity): AuthIdentity) -> AppResult<ApiResponse<()>> {
    state.accounts.logout(identity.id).await?;
    Ok(ApiResponse::ok((), "User logged out"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default)]
    refresh_token: String,
}

pub async fn refresh_token(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> AppResult<ApiResponse<TokenPair>> {
    let tokens = state.accounts.refresh(&body.refresh_token).await?;
    Ok(ApiResponse::ok(tokens, "Access token refreshed"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
    confirm_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    AuthIdentity(identity): AuthIdentity,
    Json(body): Json<ChangePasswordRequest>,
) -> AppResult<ApiResponse<()>> {
    state
        .accounts
        .change_password(
            identity.id,
            &body.old_password,
            &body.new_password,
            &body.confirm_password,
        )
        .await?;
    Ok(ApiResponse::ok((), "Password changed successfully"))
}

pub async fn current_user(AuthIdentity(identity): AuthIdentity) -> ApiResponse<Identity> {
    ApiResponse::ok(identity, "Current user fetched successfully")
}
