//! Key-value store backend.
//!
//! Each entry is a hash with `headers` and `payload` fields plus a native
//! `EXPIRE`, so the store evicts entries itself. Expiration keyspace events
//! (`__keyevent@0__:expired`) feed the proactive refresher; the
//! subscription is lazy and reconnects with a delay whenever the event
//! connection drops. `clear_all` walks the keyspace with `SCAN` so result
//! sets larger than one page are fully removed.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::http::Headers;

use super::entry::{self, Payload};
use super::{CacheBackend, CacheError, ConnectionState, ExpiredKeys};

const HEADERS_FIELD: &str = "headers";
const PAYLOAD_FIELD: &str = "payload";

/// Keyspace-notification channel for expired keys in database 0.
const EXPIRED_CHANNEL: &str = "__keyevent@0__:expired";

/// Keys removed per `SCAN` page during `clear_all`.
const SCAN_PAGE: usize = 100;

/// Delay before re-establishing a dropped expiration subscription.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long `get`/`set` refuse round trips after a failure before trying
/// the connection again.
const RETRY_COOLDOWN: Duration = Duration::from_secs(5);

/// Key-value store [`CacheBackend`].
///
/// After a failed operation the backend reads as [`ConnectionState::Failed`]
/// and `get`/`set` short-circuit with [`CacheError::NotConnected`] — no
/// round trip — until [`RETRY_COOLDOWN`] elapses, at which point the next
/// operation probes the connection again.
pub struct RedisBackend {
    client: redis::Client,
    ttl_seconds: i64,
    // Established on first use; the manager reconnects on its own afterwards.
    conn: Mutex<Option<ConnectionManager>>,
    state: RwLock<ConnectionState>,
    last_failure: RwLock<Option<Instant>>,
}

impl RedisBackend {
    /// Creates a backend for the store at `url`. The connection itself is
    /// established lazily on the first operation.
    pub fn new(url: &str, ttl: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            ttl_seconds: ttl.as_secs() as i64,
            conn: Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            last_failure: RwLock::new(None),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    fn mark_failed(&self) {
        self.set_state(ConnectionState::Failed);
        *self.last_failure.write().expect("failure clock lock poisoned") = Some(Instant::now());
    }

    /// Synchronous ready check consulted before every `get`/`set`: a backend
    /// known to be down is refused without a round trip until the cooldown
    /// elapses.
    fn guard_ready(&self) -> Result<(), CacheError> {
        if self.state() != ConnectionState::Failed {
            return Ok(());
        }
        let cooling_down = self
            .last_failure
            .read()
            .expect("failure clock lock poisoned")
            .is_some_and(|at| at.elapsed() < RETRY_COOLDOWN);
        if cooling_down {
            return Err(CacheError::NotConnected);
        }
        Ok(())
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let mut guard = self.conn.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        self.set_state(ConnectionState::Connecting);
        match self.client.get_connection_manager().await {
            Ok(manager) => {
                self.set_state(ConnectionState::Ready);
                *guard = Some(manager.clone());
                Ok(manager)
            }
            Err(error) => {
                self.mark_failed();
                Err(error.into())
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<(Headers, Payload)>, CacheError> {
        self.guard_ready()?;
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = match conn.hgetall(key).await {
            Ok(fields) => fields,
            Err(error) => {
                self.mark_failed();
                return Err(error.into());
            }
        };
        self.set_state(ConnectionState::Ready);

        // A missing (or already evicted) key reads as an empty hash.
        if fields.is_empty() {
            return Ok(None);
        }

        let (Some(headers_json), Some(payload_json)) =
            (fields.get(HEADERS_FIELD), fields.get(PAYLOAD_FIELD))
        else {
            tracing::warn!(key = %key, "stored entry is missing a field; evicting");
            let _: Result<(), _> = conn.del(key).await;
            return Ok(None);
        };

        match entry::decode(headers_json, payload_json) {
            Ok(pair) => Ok(Some(pair)),
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "stored entry is malformed; evicting");
                let _: Result<(), _> = conn.del(key).await;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, headers: &Headers, payload: &Payload) -> Result<(), CacheError> {
        self.guard_ready()?;
        let (headers_json, payload_json) = entry::encode(headers, payload)?;
        let mut conn = self.connection().await?;

        let result: Result<(), redis::RedisError> = async {
            let _: () = conn
                .hset_multiple(
                    key,
                    &[(HEADERS_FIELD, headers_json), (PAYLOAD_FIELD, payload_json)],
                )
                .await?;
            let _: () = conn.expire(key, self.ttl_seconds).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Ready);
                Ok(())
            }
            Err(error) => {
                self.mark_failed();
                Err(error.into())
            }
        }
    }

    async fn clear_all(&self) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        let mut removed = 0u64;
        let mut cursor = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                removed += deleted;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        tracing::info!(removed, "cleared cache keyspace");
        Ok(removed)
    }

    fn expirations(&self) -> ExpiredKeys {
        let client = self.client.clone();
        Box::pin(stream! {
            loop {
                match subscribe(&client).await {
                    Ok(mut messages) => {
                        tracing::info!(channel = EXPIRED_CHANNEL, "expiration subscription established");
                        while let Some(message) = messages.next().await {
                            match message.get_payload::<String>() {
                                Ok(key) => yield key,
                                Err(error) => {
                                    tracing::warn!(error = %error, "undecodable expiration event");
                                }
                            }
                        }
                        tracing::warn!("expiration subscription closed; reconnecting");
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "expiration subscription failed; retrying");
                    }
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }

    fn state(&self) -> ConnectionState {
        *self.state.read().expect("state lock poisoned")
    }
}

/// Enables expired-key notifications server-side and subscribes to them.
async fn subscribe(
    client: &redis::Client,
) -> Result<impl Stream<Item = redis::Msg> + Send, redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: () = redis::cmd("CONFIG")
        .arg("SET")
        .arg("notify-keyspace-events")
        .arg("Ex")
        .query_async(&mut conn)
        .await?;

    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(EXPIRED_CHANNEL).await?;
    Ok(pubsub.into_on_message())
}
