//! In-process cache backend.
//!
//! A plain map with real TTL timers: each `set` arms a Tokio sleep that
//! physically evicts the entry when its time-to-live elapses and pushes the
//! key onto the expiration stream, so the proactive refresher works against
//! this backend exactly as it does against the key-value store. Useful for
//! development, single-node deployments, and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::http::Headers;

use super::entry::Payload;
use super::{CacheBackend, CacheError, ConnectionState, ExpiredKeys};

struct StoredEntry {
    headers: Headers,
    payload: Payload,
    expires_at: Instant,
    // Identifies which `set` armed the eviction timer; an overwrite bumps it
    // so a stale timer cannot evict the fresh entry.
    generation: u64,
}

/// In-memory [`CacheBackend`] with timer-driven eviction.
pub struct MemoryBackend {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
    generation: AtomicU64,
    expired_tx: mpsc::UnboundedSender<String>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl MemoryBackend {
    /// Creates a backend whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            expired_tx,
            expired_rx: Mutex::new(Some(expired_rx)),
        }
    }

    /// Returns the number of live entries (expired-but-unevicted entries
    /// excluded).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("entry map lock poisoned")
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Returns `true` if no live entry is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<(Headers, Payload)>, CacheError> {
        let entries = self.entries.lock().expect("entry map lock poisoned");
        Ok(entries.get(key).and_then(|entry| {
            // Logical expiry check: the timer may not have fired yet.
            if entry.expires_at <= Instant::now() {
                None
            } else {
                Some((entry.headers.clone(), entry.payload.clone()))
            }
        }))
    }

    async fn set(&self, key: &str, headers: &Headers, payload: &Payload) -> Result<(), CacheError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let expires_at = Instant::now() + self.ttl;

        self.entries.lock().expect("entry map lock poisoned").insert(
            key.to_owned(),
            StoredEntry {
                headers: headers.clone(),
                payload: payload.clone(),
                expires_at,
                generation,
            },
        );

        let entries = Arc::clone(&self.entries);
        let expired_tx = self.expired_tx.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            let evicted = {
                let mut entries = entries.lock().expect("entry map lock poisoned");
                match entries.get(&key) {
                    Some(entry) if entry.generation == generation => {
                        entries.remove(&key);
                        true
                    }
                    _ => false, // overwritten or cleared in the meantime
                }
            };
            if evicted {
                // No consumer is fine: the refresher may not be running.
                let _ = expired_tx.send(key);
            }
        });

        Ok(())
    }

    async fn clear_all(&self) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("entry map lock poisoned");
        // Count live entries only, matching `len`; an expired entry whose
        // timer has not fired yet was never retrievable.
        let removed = entries.values().filter(|e| e.expires_at > now).count() as u64;
        entries.clear();
        Ok(removed)
    }

    fn expirations(&self) -> ExpiredKeys {
        let receiver = self
            .expired_rx
            .lock()
            .expect("expiration receiver lock poisoned")
            .take();
        match receiver {
            Some(rx) => Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|key| (key, rx))
            })),
            // Already subscribed once; later subscribers get silence.
            None => Box::pin(futures::stream::pending()),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Ready
    }
}
