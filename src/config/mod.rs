//! Cache configuration.
//!
//! Deserialized from the host's JSON configuration (camelCase field names,
//! matching a typical `config.json`). A misconfigured cache is fatal at
//! startup: [`CacheConfig::validate`] refuses undefined TTL semantics rather
//! than letting entries persist forever.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating the cache configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cache.expirationTimeoutInSeconds must be a positive integer")]
    InvalidTtl,

    #[error("cache.redis.url must not be empty when the redis backend is selected")]
    MissingRedisUrl,

    #[error("cache.mongodb.uri must not be empty when the mongodb backend is selected")]
    MissingMongoUri,

    #[error("cache backend initialization failed: {0}")]
    Backend(#[from] crate::cache::CacheError),
}

/// Which storage backend the cache binds to.
///
/// The selection is made once at startup and fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Key-value store backend (hash per key, native TTL, keyspace
    /// expiration events drive the proactive refresher).
    Redis,
    /// Document store backend (one document per key, stored expiry checked
    /// at read time, no push notifications).
    Mongodb,
    /// In-process backend for development and tests.
    Memory,
}

/// Connection settings for the key-value backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

/// Connection settings for the document backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongoConfig {
    #[serde(default = "default_mongo_uri")]
    pub uri: String,
    #[serde(default = "default_mongo_database")]
    pub database: String,
    #[serde(default = "default_mongo_collection")]
    pub collection: String,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: default_mongo_uri(),
            database: default_mongo_database(),
            collection: default_mongo_collection(),
        }
    }
}

/// Top-level cache configuration.
///
/// # Examples
///
/// ```
/// use rendercache::config::{BackendKind, CacheConfig};
///
/// let config = CacheConfig::from_json_str(
///     r#"{"type": "memory", "expirationTimeoutInSeconds": 60}"#,
/// ).unwrap();
/// assert_eq!(config.kind, BackendKind::Memory);
/// assert!(config.active);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Whether the cache middleware is enabled at all. When `false`, the
    /// manager hands out a logged pass-through instead.
    #[serde(default = "default_active")]
    pub active: bool,

    /// The backend to bind.
    #[serde(rename = "type")]
    pub kind: BackendKind,

    /// Entry time-to-live in seconds. Required: `set` semantics are
    /// undefined without it, so a missing value fails deserialization.
    pub expiration_timeout_in_seconds: u64,

    /// The single status code eligible for caching.
    #[serde(default = "default_success_status")]
    pub success_status: u16,

    /// Route prefix stripped from an expired key to recover the render URL.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on concurrent background re-renders.
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub mongodb: MongoConfig,
}

fn default_active() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_mongo_uri() -> String {
    "mongodb://127.0.0.1:27017".to_owned()
}

fn default_mongo_database() -> String {
    "rendercache".to_owned()
}

fn default_mongo_collection() -> String {
    "pages".to_owned()
}

fn default_success_status() -> u16 {
    200
}

fn default_key_prefix() -> String {
    "/render/".to_owned()
}

fn default_refresh_concurrency() -> usize {
    8
}

impl CacheConfig {
    /// Loads and validates configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Parses and validates configuration from a JSON string.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the cache cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expiration_timeout_in_seconds == 0 {
            return Err(ConfigError::InvalidTtl);
        }
        match self.kind {
            BackendKind::Redis if self.redis.url.is_empty() => Err(ConfigError::MissingRedisUrl),
            BackendKind::Mongodb if self.mongodb.uri.is_empty() => {
                Err(ConfigError::MissingMongoUri)
            }
            _ => Ok(()),
        }
    }

    /// Convenience constructor for the in-process backend, used by tests and
    /// development setups.
    pub fn memory(ttl_seconds: u64) -> Self {
        Self {
            active: true,
            kind: BackendKind::Memory,
            expiration_timeout_in_seconds: ttl_seconds,
            success_status: default_success_status(),
            key_prefix: default_key_prefix(),
            refresh_concurrency: default_refresh_concurrency(),
            redis: RedisConfig::default(),
            mongodb: MongoConfig::default(),
        }
    }
}
