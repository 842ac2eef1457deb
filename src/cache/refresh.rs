//! Proactive refresh of expired cache entries.
//!
//! The refresher consumes a backend's expired-key stream and re-renders each
//! page before any client asks for it again, avoiding the re-render storm a
//! popular page would otherwise trigger on its first post-expiry request.
//! It runs on its own task, shares nothing with the request path, and
//! bounds its concurrency with a semaphore so a burst of simultaneous
//! expirations cannot launch unbounded renders.
//!
//! A render failure is logged and dropped — no retry, no requeue. The entry
//! simply stays absent until a normal client miss renders it again.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::renderer::{RenderOptions, Renderer};

use super::entry::Payload;
use super::CacheBackend;

/// Strategy recovering the render URL from a cache key.
///
/// The key format is an application routing decision, not a cache contract,
/// so the mapping is injected rather than hardcoded.
pub trait KeyMapper: Send + Sync {
    /// Returns the URL to re-render for `key`, or `None` when the key does
    /// not correspond to a renderable page.
    fn url_for_key(&self, key: &str) -> Option<String>;
}

/// Maps keys of the form `<prefix><url>` by stripping the prefix — the
/// conventional `/render/<url>` route layout.
pub struct PrefixKeyMapper {
    prefix: String,
}

impl PrefixKeyMapper {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl KeyMapper for PrefixKeyMapper {
    fn url_for_key(&self, key: &str) -> Option<String> {
        key.strip_prefix(&self.prefix).map(str::to_owned)
    }
}

/// Background consumer of expiration events.
pub struct ExpirationRefresher {
    backend: Arc<dyn CacheBackend>,
    renderer: Arc<dyn Renderer>,
    mapper: Arc<dyn KeyMapper>,
    max_concurrent: usize,
}

impl ExpirationRefresher {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        renderer: Arc<dyn Renderer>,
        mapper: Arc<dyn KeyMapper>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            backend,
            renderer,
            mapper,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Spawns the refresher onto the runtime. Fire-and-forget: no
    /// request-serving path ever awaits the returned handle.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Consumes the backend's expiration stream until it ends (which, for
    /// push-capable backends, is never).
    pub async fn run(self) {
        let mut expirations = self.backend.expirations();
        let permits = Arc::new(Semaphore::new(self.max_concurrent));

        while let Some(key) = expirations.next().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break; // semaphore closed — only possible at shutdown
            };
            let backend = Arc::clone(&self.backend);
            let renderer = Arc::clone(&self.renderer);
            let mapper = Arc::clone(&self.mapper);

            tokio::spawn(async move {
                let _permit = permit;
                refresh_one(&*backend, &*renderer, &*mapper, &key).await;
            });
        }

        tracing::debug!("expiration stream ended; refresher stopping");
    }
}

async fn refresh_one(
    backend: &dyn CacheBackend,
    renderer: &dyn Renderer,
    mapper: &dyn KeyMapper,
    key: &str,
) {
    let Some(url) = mapper.url_for_key(key) else {
        tracing::debug!(key = %key, "expired key has no render URL; skipping");
        return;
    };

    tracing::info!(key = %key, url = %url, "entry expired; refreshing");

    let result = renderer.render(&url, RenderOptions::default()).await;
    let rendered = match result {
        Ok(rendered) => rendered,
        Err(error) => {
            tracing::error!(url = %url, error = %error, "refresh render failed");
            return;
        }
    };

    let Some(payload) = Payload::from_body(&rendered.body) else {
        tracing::warn!(url = %url, "refresh render produced an empty body; not cached");
        return;
    };

    if let Err(error) = backend.set(key, &rendered.headers, &payload).await {
        tracing::warn!(key = %key, error = %error, "refresh write failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::memory::MemoryBackend;
    use crate::http::{Body, Headers, StatusCode};
    use crate::renderer::{RenderError, RenderResult};

    struct StubRenderer {
        body: &'static str,
        fail: bool,
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
    }

    impl StubRenderer {
        fn new(body: &'static str) -> Self {
            Self {
                body,
                fail: false,
                calls: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new("")
            }
        }
    }

    #[async_trait]
    impl Renderer for StubRenderer {
        async fn render(
            &self,
            url: &str,
            _options: RenderOptions,
        ) -> Result<RenderResult, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_owned());
            if self.fail {
                return Err(RenderError::Fetch {
                    url: url.to_owned(),
                    reason: "no such host".into(),
                });
            }
            let mut headers = Headers::new();
            headers.insert("content-type", "text/html");
            Ok(RenderResult {
                status: StatusCode::Ok,
                headers,
                body: Body::from(self.body.to_owned()),
            })
        }
    }

    fn seed_entry() -> (Headers, Payload) {
        (Headers::new(), Payload::Text("stale".into()))
    }

    #[tokio::test]
    async fn refreshes_expired_entry_before_next_request() {
        let backend = Arc::new(MemoryBackend::new(Duration::from_millis(40)));
        let renderer = Arc::new(StubRenderer::new("<html>fresh</html>"));
        ExpirationRefresher::new(
            backend.clone(),
            renderer.clone(),
            Arc::new(PrefixKeyMapper::new("/render/")),
            4,
        )
        .spawn();

        let (headers, payload) = seed_entry();
        backend
            .set("/render/example.com", &headers, &payload)
            .await
            .unwrap();

        // Wait past expiry plus the refresh round trip.
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            renderer.urls.lock().unwrap().as_slice(),
            ["example.com".to_owned()]
        );
        let (_, refreshed) = backend.get("/render/example.com").await.unwrap().unwrap();
        assert_eq!(refreshed, Payload::Text("<html>fresh</html>".into()));
    }

    #[tokio::test]
    async fn failed_render_leaves_entry_absent() {
        let backend = Arc::new(MemoryBackend::new(Duration::from_millis(40)));
        let renderer = Arc::new(StubRenderer::failing());
        ExpirationRefresher::new(
            backend.clone(),
            renderer.clone(),
            Arc::new(PrefixKeyMapper::new("/render/")),
            4,
        )
        .spawn();

        let (headers, payload) = seed_entry();
        backend
            .set("/render/gone.example", &headers, &payload)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        assert!(backend.get("/render/gone.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unmappable_key_is_skipped() {
        let backend = Arc::new(MemoryBackend::new(Duration::from_millis(40)));
        let renderer = Arc::new(StubRenderer::new("x"));
        ExpirationRefresher::new(
            backend.clone(),
            renderer.clone(),
            Arc::new(PrefixKeyMapper::new("/render/")),
            4,
        )
        .spawn();

        let (headers, payload) = seed_entry();
        backend.set("/healthz", &headers, &payload).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn prefix_mapper_strips_only_its_prefix() {
        let mapper = PrefixKeyMapper::new("/render/");
        assert_eq!(
            mapper.url_for_key("/render/example.com?a=1"),
            Some("example.com?a=1".to_owned())
        );
        assert_eq!(mapper.url_for_key("/other/example.com"), None);
    }
}
