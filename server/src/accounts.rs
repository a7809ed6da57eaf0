use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::deadline::bounded;
use crate::errors::{AppError, AppResult};
use crate::models::{Identity, NewIdentity};
use crate::password::{hash_password, verify_password};
use crate::saga::{CreationSaga, CreationTarget, UploadedAssets, Upload};
use crate::session::SessionManager;
use crate::store::{IdentityStore, StoreResult};
use crate::tokens::TokenPair;

pub const AVATAR_SLOT: &str = "avatar";
pub const COVER_IMAGE_SLOT: &str = "coverImage";

/// Text fields of a registration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterFields {
    pub fullname: String,
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Files attached to a registration; the avatar is mandatory
#[derive(Debug, Clone, Default)]
pub struct RegisterUploads {
    pub avatar: Option<Vec<u8>>,
    pub cover_image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    /// Username or email
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub identity: Identity,
    pub tokens: TokenPair,
}

/// Non-blank, trimmed value of a required text field
pub(crate) fn require_field(name: &str, value: &str) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation(format!("{name} is required")));
    }
    Ok(trimmed.to_string())
}

/// Passwords are checked for blankness but kept exactly as typed
fn require_secret(name: &str, value: String) -> AppResult<String> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{name} is required")));
    }
    Ok(value)
}

/// A missing identity behind a credential is an auth failure; anything else passes through
fn unauthorized_if_missing(err: AppError, message: &str) -> AppError {
    match err {
        AppError::NotFound(_) => AppError::unauthorized(message),
        other => other,
    }
}

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is valid"))
}

/// Identity fields ready for insertion, minus the blob references
#[derive(Debug, Clone)]
pub struct IdentityDraft {
    pub username: String,
    pub email: String,
    pub fullname: String,
    pub password_hash: String,
}

/// Saga target that inserts identities
struct IdentityTarget<'a> {
    identities: &'a dyn IdentityStore,
}

#[async_trait]
impl CreationTarget for IdentityTarget<'_> {
    type Payload = IdentityDraft;
    type Record = Identity;

    fn entity(&self) -> &'static str {
        "identity"
    }

    fn natural_key(&self, payload: &IdentityDraft) -> String {
        payload.username.clone()
    }

    async fn exists(&self, payload: &IdentityDraft) -> StoreResult<bool> {
        Ok(self
            .identities
            .find_by_natural_key(&payload.username, &payload.email)
            .await?
            .is_some())
    }

    async fn create_atomic(&self, payload: IdentityDraft, assets: &UploadedAssets) -> AppResult<Identity> {
        let avatar = assets
            .get(AVATAR_SLOT)
            .ok_or_else(|| AppError::validation("avatar file is required"))?;

        let new = NewIdentity {
            username: payload.username,
            email: payload.email,
            fullname: payload.fullname,
            password_hash: payload.password_hash,
            avatar: Some(avatar),
            cover_image: assets.get(COVER_IMAGE_SLOT),
        };

        Ok(self.identities.create(new).await?)
    }

    async fn find_created(&self, payload: &IdentityDraft) -> StoreResult<Option<Identity>> {
        self.identities
            .find_by_natural_key(&payload.username, &payload.email)
            .await
    }

    fn referenced_blobs(&self, record: &Identity) -> Vec<String> {
        [&record.avatar, &record.cover_image]
            .into_iter()
            .flatten()
            .map(|media| media.blob_id.clone())
            .collect()
    }
}

/// Registration, login and the session operations built on top of them
#[derive(Clone)]
pub struct Accounts {
    identities: Arc<dyn IdentityStore>,
    saga: CreationSaga,
    sessions: SessionManager,
    record_deadline: Duration,
}

impl Accounts {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        saga: CreationSaga,
        sessions: SessionManager,
        record_deadline: Duration,
    ) -> Self {
        Self {
            identities,
            saga,
            sessions,
            record_deadline,
        }
    }

    /// Register a new identity with an avatar and an optional cover image
    #[tracing::instrument(skip_all, fields(username = %fields.username))]
    pub async fn register(&self, fields: RegisterFields, uploads: RegisterUploads) -> AppResult<Identity> {
        let fullname = require_field("fullname", &fields.fullname)?;
        let username = require_field("username", &fields.username)?.to_lowercase();
        let email = require_field("email", &fields.email)?.to_lowercase();
        let password = require_secret("password", fields.password)?;

        if !email_pattern().is_match(&email) {
            return Err(AppError::validation("email is not a valid address"));
        }

        let avatar = match uploads.avatar {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Err(AppError::validation("avatar file is required")),
        };

        let mut attachments = vec![Upload::required(AVATAR_SLOT, avatar)];
        if let Some(cover) = uploads.cover_image {
            attachments.push(Upload::optional(COVER_IMAGE_SLOT, cover));
        }

        let draft = IdentityDraft {
            username,
            email,
            fullname,
            password_hash: hash_password(&password).await?,
        };

        let target = IdentityTarget {
            identities: self.identities.as_ref(),
        };
        let created = self.saga.create(&target, draft, attachments).await?;

        info!("Registered identity {}", created.record.id);
        Ok(created.record)
    }

    /// Check credentials and start a fresh session
    #[tracing::instrument(skip_all, fields(login = %credentials.login))]
    pub async fn login(&self, credentials: Credentials) -> AppResult<LoginOutcome> {
        let login = require_field("username or email", &credentials.login)?.to_lowercase();

        let identity = bounded(
            self.record_deadline,
            "identity lookup",
            self.identities.find_by_login(&login),
        )
        .await?
        .ok_or_else(|| AppError::unauthorized("invalid credentials"))?;

        if !verify_password(&credentials.password, &identity.password_hash).await? {
            info!("Wrong password for identity {}", identity.id);
            return Err(AppError::unauthorized("invalid credentials"));
        }

        let tokens = self.sessions.start(identity.id).await?;
        let identity = self.load(identity.id).await?;

        Ok(LoginOutcome { identity, tokens })
    }

    /// Rotate a refresh token
    pub async fn refresh(&self, refresh_token: &str) -> AppResult<TokenPair> {
        let refresh_token = refresh_token.trim();
        if refresh_token.is_empty() {
            return Err(AppError::unauthorized("refresh token is required"));
        }
        self.sessions.rotate(refresh_token).await
    }

    pub async fn logout(&self, identity_id: Uuid) -> AppResult<()> {
        self.sessions.end(identity_id).await
    }

    /// Replace the password and sign out every session
    ///
    /// The write only lands if the stored hash is still the one the old
    /// password was checked against, so a concurrent password change wins and
    /// this one fails as a wrong old password.
    #[tracing::instrument(skip(self, old_password, new_password, confirm_password))]
    pub async fn change_password(
        &self,
        identity_id: Uuid,
        old_password: &str,
        new_password: &str,
        confirm_password: &str,
    ) -> AppResult<()> {
        let new_password = require_secret("new password", new_password.to_string())?;
        if new_password != confirm_password {
            return Err(AppError::validation("new password does not match confirmation"));
        }

        let identity = self
            .load(identity_id)
            .await
            .map_err(|err| unauthorized_if_missing(err, "unknown identity"))?;

        if !verify_password(old_password, &identity.password_hash).await? {
            return Err(AppError::unauthorized("invalid old password"));
        }

        let password_hash = hash_password(&new_password).await?;
        let updated = bounded(
            self.record_deadline,
            "password update",
            self.identities
                .update_password(identity.id, &identity.password_hash, &password_hash),
        )
        .await?;

        if !updated {
            info!("Password of identity {} changed underneath us", identity.id);
            return Err(AppError::unauthorized("invalid old password"));
        }

        info!("Changed password for identity {}", identity.id);
        Ok(())
    }

    /// Resolve the identity behind an access token
    pub async fn current_user(&self, access_token: &str) -> AppResult<Identity> {
        let claims = self.sessions.issuer().verify_access(access_token)?;
        self.load(claims.sub)
            .await
            .map_err(|err| unauthorized_if_missing(err, "identity no longer exists"))
    }

    async fn load(&self, identity_id: Uuid) -> AppResult<Identity> {
        bounded(
            self.record_deadline,
            "identity lookup",
            self.identities.find_by_id(identity_id),
        )
        .await?
        .ok_or_else(|| AppError::not_found(format!("identity {identity_id}")))
    }
}
