//! Token issuance and verification
//!
//! Access tokens are short-lived and checked without touching any store.
//! Refresh tokens are signed too, so their structure and expiry can be checked
//! up front, but they are only honoured while their digest is the one stored on
//! the identity (see [`crate::session`]).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, TimeZone as _, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Default access token lifetime
pub const DEFAULT_ACCESS_TTL_SECS: i64 = 15 * 60;

/// Default refresh token lifetime
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 10 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims carried by both token kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Identity id
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64,
    /// Unique per token, so two tokens issued in the same second still differ
    pub jti: Uuid,
    pub kind: TokenKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("token signature or structure is invalid")]
    InvalidSignature,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Signs and verifies claim sets
pub trait Signer: Send + Sync {
    fn sign(&self, claims: &Claims) -> Result<String, TokenError>;

    fn verify(&self, token: &str) -> Result<Claims, TokenError>;
}

/// HS256 signer with no expiry leeway
pub struct HmacSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl HmacSigner {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl Signer for HmacSigner {
    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::InvalidSignature,
            })
    }
}

/// An access/refresh pair as handed to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// A freshly issued pair together with the digest to store for its refresh token
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub pair: TokenPair,
    pub refresh_digest: String,
}

pub struct TokenIssuer {
    access: Box<dyn Signer>,
    refresh: Box<dyn Signer>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(access: Box<dyn Signer>, refresh: Box<dyn Signer>, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            access,
            refresh,
            access_ttl,
            refresh_ttl,
        }
    }

    /// HS256 issuer with separate secrets for the two token kinds
    pub fn hmac(access_secret: &[u8], refresh_secret: &[u8], access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self::new(
            Box::new(HmacSigner::new(access_secret)),
            Box::new(HmacSigner::new(refresh_secret)),
            access_ttl,
            refresh_ttl,
        )
    }

    /// Mint a new access/refresh pair for `subject`
    pub fn issue(&self, subject: Uuid) -> Result<IssuedTokens, TokenError> {
        let now = Utc::now();

        let access_claims = claims(subject, TokenKind::Access, now, self.access_ttl);
        let refresh_claims = claims(subject, TokenKind::Refresh, now, self.refresh_ttl);

        let access_token = self.access.sign(&access_claims)?;
        let refresh_token = self.refresh.sign(&refresh_claims)?;
        let refresh_digest = digest(&refresh_token);

        Ok(IssuedTokens {
            pair: TokenPair {
                access_token,
                refresh_token,
                access_expires_at: timestamp(access_claims.exp),
                refresh_expires_at: timestamp(refresh_claims.exp),
            },
            refresh_digest,
        })
    }

    /// Check an access token using only the token and the signing key
    pub fn verify_access(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.access.verify(token)?;
        if claims.kind != TokenKind::Access {
            return Err(TokenError::InvalidSignature);
        }
        Ok(claims)
    }

    /// Check a refresh token's signature and expiry; says nothing about whether
    /// it is still the current one
    pub fn verify_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.refresh.verify(token)?;
        if claims.kind != TokenKind::Refresh {
            return Err(TokenError::InvalidSignature);
        }
        Ok(claims)
    }
}

fn claims(subject: Uuid, kind: TokenKind, now: DateTime<Utc>, ttl: Duration) -> Claims {
    Claims {
        sub: subject,
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
        jti: Uuid::new_v4(),
        kind,
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Value stored on the identity in place of the raw refresh token
pub fn digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
