//! Response-stream capture for bodies written in multiple partial writes.
//!
//! Handlers that stream their output do not produce one finished
//! [`Response`](crate::http::Response); they push chunks at a transport.
//! [`ResponseWriter`] is that "writable response" capability, and
//! [`CaptureWriter`] is a decorator over any implementation of it: every
//! `write` and the final `end` are forwarded to the wrapped transport
//! unchanged — same bytes, same order — while a [`Body`] accumulator keeps a
//! copy. When the stream finishes with the configured success status and a
//! non-empty body, the accumulated copy is written back to the backend on a
//! spawned task, after the final forward, so delivery is never delayed by
//! the cache.
//!
//! A stream that mixes text and byte chunks poisons the capture: it is
//! delivered exactly as written but never cached, since the accumulated
//! copy could not mirror what went over the wire.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::http::{Body, Chunk, Headers, StatusCode};

use super::entry::Payload;
use super::CacheBackend;

/// The writable-response capability: a transport accepting partial body
/// writes and a final flush.
///
/// The response head (status and headers) is fixed before the first write,
/// as with any streaming HTTP transport.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Writes one body chunk.
    async fn write(&mut self, chunk: Chunk) -> io::Result<()>;

    /// Writes the optional final chunk and finishes the response.
    async fn end(&mut self, chunk: Option<Chunk>) -> io::Result<()>;
}

/// Decorator that feeds an accumulator before forwarding to the wrapped
/// transport.
pub struct CaptureWriter<W: ResponseWriter> {
    inner: W,
    backend: Arc<dyn CacheBackend>,
    key: String,
    status: StatusCode,
    headers: Headers,
    success_status: u16,
    accumulated: Body,
    // Set when a chunk could not be accumulated; the stream is still
    // delivered but the capture is no longer a faithful copy.
    poisoned: bool,
}

impl<W: ResponseWriter> CaptureWriter<W> {
    /// Wraps `inner` for the response identified by `key`, whose head
    /// (`status`, `headers`) has already been committed.
    pub fn new(
        inner: W,
        backend: Arc<dyn CacheBackend>,
        key: impl Into<String>,
        status: StatusCode,
        headers: Headers,
        success_status: u16,
    ) -> Self {
        Self {
            inner,
            backend,
            key: key.into(),
            status,
            headers,
            success_status,
            accumulated: Body::Empty,
            poisoned: false,
        }
    }

    /// Consumes the wrapper, returning the inner transport.
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_back(&mut self) {
        if self.status.as_u16() != self.success_status {
            return;
        }
        if self.poisoned {
            tracing::debug!(key = %self.key, "mixed text/binary stream; not cached");
            return;
        }
        let Some(payload) = Payload::from_body(&self.accumulated) else {
            // Nothing accumulated — an empty render is never cached.
            return;
        };
        let backend = Arc::clone(&self.backend);
        let key = std::mem::take(&mut self.key);
        let headers = std::mem::take(&mut self.headers);
        tokio::spawn(async move {
            if let Err(error) = backend.set(&key, &headers, &payload).await {
                tracing::warn!(key = %key, error = %error, "cache write failed");
            } else {
                tracing::debug!(key = %key, "cached streamed response");
            }
        });
    }
}

#[async_trait]
impl<W: ResponseWriter> ResponseWriter for CaptureWriter<W> {
    async fn write(&mut self, chunk: Chunk) -> io::Result<()> {
        if !self.accumulated.push(&chunk) {
            self.poisoned = true;
        }
        self.inner.write(chunk).await
    }

    async fn end(&mut self, chunk: Option<Chunk>) -> io::Result<()> {
        if let Some(chunk) = &chunk {
            if !self.accumulated.push(chunk) {
                self.poisoned = true;
            }
        }
        // Forward first: the caller's bytes hit the wire before any cache
        // work is scheduled.
        self.inner.end(chunk).await?;
        self.write_back();
        Ok(())
    }
}
