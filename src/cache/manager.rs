//! Cache composition root.
//!
//! Constructed explicitly at process startup: reads the validated
//! configuration once, binds exactly one backend for the process lifetime,
//! and hands the hosting server its middleware. No ambient singleton — the
//! instance is passed by reference to whatever wires the handler chain.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{BackendKind, CacheConfig, ConfigError};
use crate::context::Context;
use crate::middleware::{from_middleware, MiddlewareHandler, Next};
use crate::renderer::Renderer;

use super::memory::MemoryBackend;
use super::middleware::CacheMiddleware;
use super::mongo::MongoBackend;
use super::redis::RedisBackend;
use super::refresh::{ExpirationRefresher, PrefixKeyMapper};
use super::{CacheBackend, CacheError};

/// Owns the configured backend and exposes the cache layer to the host.
///
/// # Examples
///
/// ```rust,no_run
/// use rendercache::cache::CacheManager;
/// use rendercache::config::CacheConfig;
///
/// # async fn wire() -> Result<(), Box<dyn std::error::Error>> {
/// let config = CacheConfig::from_json_file("config.json")?;
/// let manager = CacheManager::new(config).await?;
/// let stack = vec![manager.middleware() /* , app handler */];
/// # Ok(())
/// # }
/// ```
pub struct CacheManager {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl CacheManager {
    /// Validates `config` and binds the selected backend.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] here is fatal: the process must refuse to start
    /// with a misconfigured cache rather than run with undefined TTL
    /// semantics.
    pub async fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let ttl = Duration::from_secs(config.expiration_timeout_in_seconds);

        let backend: Arc<dyn CacheBackend> = match config.kind {
            BackendKind::Redis => Arc::new(RedisBackend::new(&config.redis.url, ttl)?),
            BackendKind::Mongodb => Arc::new(
                MongoBackend::connect(
                    &config.mongodb.uri,
                    &config.mongodb.database,
                    &config.mongodb.collection,
                    ttl,
                )
                .await?,
            ),
            BackendKind::Memory => Arc::new(MemoryBackend::new(ttl)),
        };

        tracing::info!(backend = ?config.kind, ttl_seconds = ttl.as_secs(), "cache ready");
        Ok(Self { backend, config })
    }

    /// Returns the request-interception middleware, closed over the bound
    /// backend. When the cache is configured inactive, returns a
    /// pass-through handler instead.
    pub fn middleware(&self) -> MiddlewareHandler {
        if !self.config.active {
            tracing::info!("cache is inactive; middleware passes through");
            return Arc::new(|ctx: Context, next: Next| {
                Box::pin(async move { next.run(ctx).await })
            });
        }
        from_middleware(Arc::new(CacheMiddleware::new(
            Arc::clone(&self.backend),
            self.config.success_status,
        )))
    }

    /// Removes every cached entry. Returns the number removed.
    pub async fn clear_cache(&self) -> Result<u64, CacheError> {
        self.backend.clear_all().await
    }

    /// Starts the background refresher against the bound backend, mapping
    /// expired keys back to URLs with the configured key prefix.
    ///
    /// Only push-capable backends ever produce refresh work; for the
    /// others the spawned task just parks on a silent stream.
    pub fn spawn_refresher(&self, renderer: Arc<dyn Renderer>) -> JoinHandle<()> {
        ExpirationRefresher::new(
            Arc::clone(&self.backend),
            renderer,
            Arc::new(PrefixKeyMapper::new(self.config.key_prefix.clone())),
            self.config.refresh_concurrency,
        )
        .spawn()
    }

    /// The bound backend, for custom wiring (e.g. a bespoke
    /// [`KeyMapper`](super::KeyMapper)).
    pub fn backend(&self) -> Arc<dyn CacheBackend> {
        Arc::clone(&self.backend)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::middleware::{HEADER_CACHED, HEADER_SERVED_BY};
    use crate::context::Context;
    use crate::http::{Body, Headers, Request, Response, StatusCode};
    use crate::middleware::Next;
    use crate::renderer::{RenderError, RenderOptions, RenderResult};

    struct PageRenderer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Renderer for PageRenderer {
        async fn render(
            &self,
            _url: &str,
            _options: RenderOptions,
        ) -> Result<RenderResult, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut headers = Headers::new();
            headers.insert("content-type", "text/html");
            Ok(RenderResult {
                status: StatusCode::Ok,
                headers,
                body: Body::from("<html></html>".to_owned()),
            })
        }
    }

    fn ctx(target: &str) -> Context {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(request)
    }

    /// Terminal handler standing in for the application's render route,
    /// backed by the same renderer the refresher uses.
    fn render_route(renderer: Arc<PageRenderer>) -> MiddlewareHandler {
        Arc::new(move |ctx: Context, _next| {
            let renderer = Arc::clone(&renderer);
            Box::pin(async move {
                let url = ctx
                    .request()
                    .path()
                    .strip_prefix("/render/")
                    .unwrap_or_default()
                    .to_owned();
                match renderer.render(&url, RenderOptions::default()).await {
                    Ok(result) => {
                        let mut response = Response::new(result.status).with_body(result.body);
                        for (name, value) in result.headers.iter() {
                            response.add_header(name, value);
                        }
                        response
                    }
                    Err(_) => Response::new(StatusCode::BadGateway),
                }
            })
        })
    }

    #[tokio::test]
    async fn inactive_cache_passes_every_request_through() {
        let mut config = CacheConfig::memory(60);
        config.active = false;
        let manager = CacheManager::new(config).await.unwrap();
        let renderer = Arc::new(PageRenderer {
            calls: AtomicUsize::new(0),
        });
        let stack = vec![manager.middleware(), render_route(renderer.clone())];

        Next::new(stack.clone()).run(ctx("/render/example.com")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        Next::new(stack).run(ctx("/render/example.com")).await;

        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_cache_empties_the_keyspace() {
        let manager = CacheManager::new(CacheConfig::memory(60)).await.unwrap();
        let backend = manager.backend();
        let payload = super::super::Payload::Text("x".into());
        for i in 0..250 {
            backend
                .set(&format!("/page/{i}"), &Headers::new(), &payload)
                .await
                .unwrap();
        }

        assert_eq!(manager.clear_cache().await.unwrap(), 250);
        assert!(backend.get("/page/0").await.unwrap().is_none());
        assert!(backend.get("/page/249").await.unwrap().is_none());
    }

    /// The end-to-end scenario: miss renders and fills, hit skips the
    /// renderer, and after expiry the refresher has already repopulated the
    /// entry before the client returns.
    #[tokio::test]
    async fn render_scenario_with_proactive_refresh() {
        // Shortest valid TTL so the proactive path is observable.
        let manager = CacheManager::new(CacheConfig::memory(1)).await.unwrap();
        let renderer = Arc::new(PageRenderer {
            calls: AtomicUsize::new(0),
        });
        manager.spawn_refresher(renderer.clone());
        let stack = vec![manager.middleware(), render_route(renderer.clone())];

        // First request: miss — renderer invoked, entry cached.
        let first = Next::new(stack.clone()).run(ctx("/render/example.com")).await;
        assert_eq!(first.status(), StatusCode::Ok);
        assert_eq!(first.body_ref().as_bytes(), b"<html></html>");
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Second request within the TTL: hit — identical body, indicator
        // headers, renderer untouched.
        let second = Next::new(stack.clone()).run(ctx("/render/example.com")).await;
        assert_eq!(second.body_ref().as_bytes(), b"<html></html>");
        assert_eq!(second.headers().get(HEADER_SERVED_BY), Some("rendercache"));
        assert_eq!(second.headers().get(HEADER_CACHED), Some("true"));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);

        // Past expiry: the refresher re-rendered in the background, so the
        // client's next request is a hit again without a miss-path render.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);

        let third = Next::new(stack).run(ctx("/render/example.com")).await;
        assert_eq!(third.headers().get(HEADER_CACHED), Some("true"));
        assert_eq!(third.body_ref().as_bytes(), b"<html></html>");
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
    }
}
