//! Refresh token rotation
//!
//! Per identity the session moves `NoSession -> Active(R0) -> Active(R1) -> ... -> Revoked`.
//! Only the digest of the current refresh token is stored. Rotation is a
//! compare-and-swap against that digest, so a refresh token can be exchanged at
//! most once, and two concurrent refreshes with the same token cannot both win.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::deadline::bounded;
use crate::errors::{AppError, AppResult};
use crate::store::IdentityStore;
use crate::tokens::{digest, TokenIssuer, TokenPair};

/// What to do when a structurally valid refresh token no longer matches the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReusePolicy {
    /// Reject the request and also clear the stored token, so whoever holds the
    /// newer token has to log in again
    #[default]
    RevokeSession,
    /// Reject the request only
    Reject,
}

impl FromStr for ReusePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "revoke" | "revoke_session" => Ok(Self::RevokeSession),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown refresh reuse policy: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    identities: Arc<dyn IdentityStore>,
    issuer: Arc<TokenIssuer>,
    reuse_policy: ReusePolicy,
    record_deadline: Duration,
}

impl SessionManager {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        issuer: Arc<TokenIssuer>,
        reuse_policy: ReusePolicy,
        record_deadline: Duration,
    ) -> Self {
        Self {
            identities,
            issuer,
            reuse_policy,
            record_deadline,
        }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Start a session at login or registration
    ///
    /// The fresh refresh token replaces whatever was stored with an unconditional write.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, identity_id: Uuid) -> AppResult<TokenPair> {
        let issued = self.issuer.issue(identity_id)?;

        bounded(
            self.record_deadline,
            "refresh token write",
            self.identities
                .set_refresh_token(identity_id, Some(issued.refresh_digest.as_str())),
        )
        .await?;

        info!("Started session for identity {}", identity_id);
        Ok(issued.pair)
    }

    /// Exchange `presented` for a new pair; the presented token is dead afterwards
    #[tracing::instrument(skip_all)]
    pub async fn rotate(&self, presented: &str) -> AppResult<TokenPair> {
        // Structural validity needs no store access
        let claims = self.issuer.verify_refresh(presented)?;
        let identity_id = claims.sub;

        let identity = bounded(
            self.record_deadline,
            "identity lookup",
            self.identities.find_by_id(identity_id),
        )
        .await?;
        if identity.is_none() {
            return Err(AppError::unauthorized("invalid refresh token"));
        }

        let issued = self.issuer.issue(identity_id)?;
        let swapped = bounded(
            self.record_deadline,
            "refresh token swap",
            self.identities.swap_refresh_token(
                identity_id,
                &digest(presented),
                Some(issued.refresh_digest.as_str()),
            ),
        )
        .await?;

        if swapped {
            info!("Rotated refresh token for identity {}", identity_id);
            return Ok(issued.pair);
        }

        warn!(
            "Refresh token reuse detected for identity {} (policy {:?})",
            identity_id, self.reuse_policy
        );

        if self.reuse_policy == ReusePolicy::RevokeSession {
            // Revocation failing must not turn the rejection into a success
            let revoked = bounded(
                self.record_deadline,
                "session revocation",
                self.identities.set_refresh_token(identity_id, None),
            )
            .await;
            match revoked {
                Ok(()) => info!("Revoked session for identity {} after reuse", identity_id),
                Err(err) => warn!(
                    "Failed to revoke session for identity {} after reuse: {}",
                    identity_id, err
                ),
            }
        }

        Err(AppError::unauthorized("refresh token is expired or already used"))
    }

    /// End the session: no refresh token is valid afterwards
    #[tracing::instrument(skip(self))]
    pub async fn end(&self, identity_id: Uuid) -> AppResult<()> {
        bounded(
            self.record_deadline,
            "refresh token clear",
            self.identities.set_refresh_token(identity_id, None),
        )
        .await?;

        info!("Ended session for identity {}", identity_id);
        Ok(())
    }
}
