//! Response caching — pluggable backends, read-through middleware, and
//! proactive refresh on expiry.
//!
//! The layer stores one entry per full request URL: the response headers and
//! body of a successful render, with a configured time-to-live. The
//! [`CacheMiddleware`] serves hits without invoking the renderer and writes
//! misses back after the fact; the [`ExpirationRefresher`] re-renders pages
//! in the background as their entries expire, so popular pages never pay the
//! re-render cost on a client request.
//!
//! ## Backends
//!
//! - [`RedisBackend`] — hash per key with a native `EXPIRE`; keyspace
//!   expiration events feed the refresher.
//! - [`MongoBackend`] — document per key with a stored expiry checked at
//!   read time; no push notifications.
//! - [`MemoryBackend`] — in-process map with real TTL timers, for
//!   development and tests.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::http::Headers;

pub mod capture;
pub mod entry;
pub mod manager;
pub mod memory;
pub mod middleware;
pub mod mongo;
pub mod redis;
pub mod refresh;

pub use capture::{CaptureWriter, ResponseWriter};
pub use entry::Payload;
pub use manager::CacheManager;
pub use memory::MemoryBackend;
pub use middleware::{CacheMiddleware, HEADER_CACHED, HEADER_SERVED_BY};
pub use mongo::MongoBackend;
pub use redis::RedisBackend;
pub use refresh::{ExpirationRefresher, KeyMapper, PrefixKeyMapper};

/// Errors produced by a cache backend.
///
/// These never propagate to the HTTP caller: the middleware logs them and
/// degrades to uncached behavior.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("key-value store error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("document store error: {0}")]
    Mongo(#[from] ::mongodb::error::Error),

    #[error("stored entry is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("backend connection is not established")]
    NotConnected,
}

/// Connection state of a backend, owned by the backend instance and queried
/// synchronously by callers that want to skip doomed round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt has been made yet (lazy connect).
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The last operation completed against a live connection.
    Ready,
    /// The last operation or connection attempt failed.
    Failed,
}

/// A lazy stream of expired cache keys.
///
/// Produced by [`CacheBackend::expirations`]. Backends without push
/// notifications return a stream that never yields.
pub type ExpiredKeys = Pin<Box<dyn Stream<Item = String> + Send>>;

/// The storage contract every cache backend implements.
///
/// Entries are `(headers, payload)` pairs keyed by the full request URL.
/// The pair is read and returned atomically: `get` never returns one half
/// without the other.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Looks up a key. `Ok(None)` is the normal outcome for a miss and for a
    /// logically expired entry; errors are reserved for backend failures.
    async fn get(&self, key: &str) -> Result<Option<(Headers, Payload)>, CacheError>;

    /// Stores an entry under `key`, overwriting any previous entry and
    /// restarting its time-to-live.
    async fn set(&self, key: &str, headers: &Headers, payload: &Payload) -> Result<(), CacheError>;

    /// Deletes every stored entry, paginating through the keyspace until
    /// exhausted. Returns the number of entries removed.
    async fn clear_all(&self) -> Result<u64, CacheError>;

    /// Returns the stream of expired-key notifications.
    ///
    /// The default implementation never yields; backends with a native
    /// expiration push (keyspace events, in-process timers) override it.
    /// At most one consumer is supported — the refresher subscribes once at
    /// startup.
    fn expirations(&self) -> ExpiredKeys {
        Box::pin(futures::stream::pending())
    }

    /// Reports the backend's connection state.
    fn state(&self) -> ConnectionState {
        ConnectionState::Ready
    }
}
