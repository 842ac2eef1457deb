//! Document store backend.
//!
//! One document per key with `saved_at`/`expires_at` timestamps alongside
//! the encoded headers and payload. The store does not auto-evict, so the
//! expiry field is checked on every read and a logically expired document is
//! never served (and is deleted on sight). There is no push notification
//! path: `expirations` inherits the never-firing default, and stale entries
//! are refreshed by the next client miss instead of proactively.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};

use crate::http::Headers;

use super::entry::{self, Payload};
use super::{CacheBackend, CacheError};

#[derive(Debug, Serialize, Deserialize)]
struct PageDocument {
    #[serde(rename = "_id")]
    key: String,
    saved_at: i64,
    expires_at: i64,
    headers: String,
    payload: String,
}

/// Document store [`CacheBackend`].
pub struct MongoBackend {
    collection: Collection<PageDocument>,
    ttl: Duration,
}

impl MongoBackend {
    /// Connects to the store at `uri` and binds the given database and
    /// collection.
    pub async fn connect(
        uri: &str,
        database: &str,
        collection: &str,
        ttl: Duration,
    ) -> Result<Self, CacheError> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self {
            collection: client.database(database).collection(collection),
            ttl,
        })
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl CacheBackend for MongoBackend {
    async fn get(&self, key: &str) -> Result<Option<(Headers, Payload)>, CacheError> {
        let Some(document) = self.collection.find_one(doc! { "_id": key }).await? else {
            return Ok(None);
        };

        // Logical expiry: the store never evicts on its own.
        if document.expires_at <= unix_now() {
            let _ = self.collection.delete_one(doc! { "_id": key }).await;
            return Ok(None);
        }

        match entry::decode(&document.headers, &document.payload) {
            Ok(pair) => Ok(Some(pair)),
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "stored entry is malformed; evicting");
                let _ = self.collection.delete_one(doc! { "_id": key }).await;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, headers: &Headers, payload: &Payload) -> Result<(), CacheError> {
        let (headers_json, payload_json) = entry::encode(headers, payload)?;
        let saved_at = unix_now();
        let document = PageDocument {
            key: key.to_owned(),
            saved_at,
            expires_at: saved_at + self.ttl.as_secs() as i64,
            headers: headers_json,
            payload: payload_json,
        };

        self.collection
            .replace_one(doc! { "_id": key }, &document)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<u64, CacheError> {
        // One server-side call covers the whole keyspace; no paging needed.
        let result = self.collection.delete_many(doc! {}).await?;
        tracing::info!(removed = result.deleted_count, "cleared cache collection");
        Ok(result.deleted_count)
    }
}
