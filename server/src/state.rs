use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{eyre, WrapErr as _};
use tracing::info;

use crate::accounts::Accounts;
use crate::blob::{http::HttpBlobStore, memory::MemoryBlobStore, BlobStore};
use crate::deadline::Deadlines;
use crate::saga::CreationSaga;
use crate::session::{ReusePolicy, SessionManager};
use crate::store::{IdentityStore, MemoryStore, OrphanStore, PgStore, VideoStore};
use crate::tokens::{TokenIssuer, DEFAULT_ACCESS_TTL_SECS, DEFAULT_REFRESH_TTL_SECS};
use crate::videos::Videos;

/// Settings read from the environment at startup
#[derive(Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub blob_store_url: Option<String>,
    pub blob_store_api_key: Option<String>,
    pub access_token_secret: String,
    pub refresh_token_secret: String,
    pub access_token_ttl: chrono::Duration,
    pub refresh_token_ttl: chrono::Duration,
    pub reuse_policy: ReusePolicy,
    pub deadlines: Deadlines,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub port: u16,
    /// `None` allows any origin
    pub cors_origin: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            port: 3000,
            cors_origin: None,
        }
    }
}

impl Config {
    pub fn from_env() -> color_eyre::Result<Self> {
        let access_token_secret = required("ACCESS_TOKEN_SECRET")?;
        let refresh_token_secret = required("REFRESH_TOKEN_SECRET")?;

        let reuse_policy = match optional("REFRESH_REUSE_POLICY") {
            Some(raw) => raw.parse::<ReusePolicy>().map_err(|e| eyre!(e))?,
            None => ReusePolicy::default(),
        };

        let defaults = Deadlines::default();
        let deadlines = Deadlines {
            blob: Duration::from_millis(parsed_or("BLOB_TIMEOUT_MS", defaults.blob.as_millis() as u64)?),
            record: Duration::from_millis(parsed_or("RECORD_TIMEOUT_MS", defaults.record.as_millis() as u64)?),
        };

        Ok(Self {
            database_url: optional("DATABASE_URL"),
            blob_store_url: optional("BLOB_STORE_URL"),
            blob_store_api_key: optional("BLOB_STORE_API_KEY"),
            access_token_secret,
            refresh_token_secret,
            access_token_ttl: chrono::Duration::seconds(parsed_or("ACCESS_TOKEN_TTL_SECS", DEFAULT_ACCESS_TTL_SECS)?),
            refresh_token_ttl: chrono::Duration::seconds(parsed_or(
                "REFRESH_TOKEN_TTL_SECS",
                DEFAULT_REFRESH_TTL_SECS,
            )?),
            reuse_policy,
            deadlines,
            http: HttpSettings {
                port: parsed_or("PORT", 3000)?,
                cors_origin: optional("CORS_ORIGIN"),
            },
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn required(name: &str) -> color_eyre::Result<String> {
    optional(name).ok_or_else(|| eyre!("{name} environment variable not set"))
}

fn parsed_or<T>(name: &str, default: T) -> color_eyre::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .wrap_err_with(|| format!("{name} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

/// The record stores behind the services, possibly all the same backend
#[derive(Clone)]
pub struct Stores {
    pub identities: Arc<dyn IdentityStore>,
    pub videos: Arc<dyn VideoStore>,
    pub orphans: Arc<dyn OrphanStore>,
}

impl Stores {
    /// Use one backend for every store
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: IdentityStore + VideoStore + OrphanStore + 'static,
    {
        Self {
            identities: store.clone(),
            videos: store.clone(),
            orphans: store,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub accounts: Accounts,
    pub videos: Videos,
    pub blobs: Arc<dyn BlobStore>,
    pub orphans: Arc<dyn OrphanStore>,
    pub deadlines: Deadlines,
    pub http: HttpSettings,
}

impl AppState {
    pub async fn from_env() -> color_eyre::Result<Self> {
        Self::from_config(Config::from_env()?).await
    }

    pub async fn from_config(config: Config) -> color_eyre::Result<Self> {
        let stores = match &config.database_url {
            Some(url) => {
                info!("Using Postgres record store");
                Stores::shared(Arc::new(PgStore::connect(url).await?))
            }
            None => {
                info!("DATABASE_URL not set, using in-memory record store");
                Stores::shared(Arc::new(MemoryStore::new()))
            }
        };

        let blobs: Arc<dyn BlobStore> = match &config.blob_store_url {
            Some(url) => {
                info!("Using blob service at {}", url);
                Arc::new(
                    HttpBlobStore::new(url.as_str(), config.blob_store_api_key.clone(), config.deadlines.blob)
                        .map_err(|e| eyre!(e))?,
                )
            }
            None => {
                info!("BLOB_STORE_URL not set, using in-memory blob store");
                Arc::new(MemoryBlobStore::default())
            }
        };

        let issuer = TokenIssuer::hmac(
            config.access_token_secret.as_bytes(),
            config.refresh_token_secret.as_bytes(),
            config.access_token_ttl,
            config.refresh_token_ttl,
        );

        Ok(Self::new(
            stores,
            blobs,
            issuer,
            config.reuse_policy,
            config.deadlines,
            config.http,
        ))
    }

    /// Wire the services together over the given collaborators
    pub fn new(
        stores: Stores,
        blobs: Arc<dyn BlobStore>,
        issuer: TokenIssuer,
        reuse_policy: ReusePolicy,
        deadlines: Deadlines,
        http: HttpSettings,
    ) -> Self {
        let saga = CreationSaga::new(blobs.clone(), stores.orphans.clone(), deadlines);
        let sessions = SessionManager::new(
            stores.identities.clone(),
            Arc::new(issuer),
            reuse_policy,
            deadlines.record,
        );

        Self {
            accounts: Accounts::new(stores.identities, saga.clone(), sessions, deadlines.record),
            videos: Videos::new(stores.videos, saga, deadlines.record),
            blobs,
            orphans: stores.orphans,
            deadlines,
            http,
        }
    }
}
