//! Read-through, write-back cache middleware.
//!
//! Per request the middleware is a two-state machine. **Lookup**: consult
//! the backend for the full request URL; a hit is served directly with the
//! cache-indicator headers and the downstream renderer is never invoked.
//! **Capture**: on a miss, run the rest of the chain, then write the
//! finished response back — only when it carries exactly the configured
//! success status and a non-empty body. The write-back is spawned, never
//! awaited: a slow or failing backend cannot delay or fail the response.
//!
//! Backend failures on the lookup path are logged and treated as a miss, so
//! an unreachable cache degrades to "always uncached", never to a request
//! error.

use std::{future::Future, pin::Pin, sync::Arc};

use crate::context::Context;
use crate::http::{Headers, Response, StatusCode};
use crate::middleware::{Middleware, Next};

use super::entry::Payload;
use super::CacheBackend;

/// Header identifying responses that passed through this layer.
pub const HEADER_SERVED_BY: &str = "x-rendercache";

/// Header present (with value `"true"`) only when the response was served
/// from cache. Both names are a stable, client-visible contract.
pub const HEADER_CACHED: &str = "x-rendercache-cached";

// Written by the transport itself; replaying stored copies would conflict
// with the values computed for this delivery.
const HOP_BY_HOP: &[&str] = &["connection", "content-length", "transfer-encoding"];

/// The request-interception middleware. Construct via
/// [`CacheManager::middleware`](super::CacheManager::middleware) or directly
/// for custom wiring.
pub struct CacheMiddleware {
    backend: Arc<dyn CacheBackend>,
    success_status: u16,
    hit_status: StatusCode,
}

impl CacheMiddleware {
    /// Creates a middleware bound to `backend`, caching only responses with
    /// status `success_status`. Hits replay that same status — it is the
    /// only one ever stored.
    pub fn new(backend: Arc<dyn CacheBackend>, success_status: u16) -> Self {
        Self {
            backend,
            success_status,
            hit_status: StatusCode::from_u16(success_status).unwrap_or(StatusCode::Ok),
        }
    }

    fn hit_response(hit_status: StatusCode, entry_headers: Headers, payload: Payload) -> Response {
        let mut response = Response::new(hit_status);
        for (name, value) in entry_headers.iter() {
            if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            response.add_header(name, value);
        }
        response.add_header(HEADER_SERVED_BY, "rendercache");
        response.add_header(HEADER_CACHED, "true");
        response.with_body(payload.into())
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let backend = Arc::clone(&self.backend);
        let success_status = self.success_status;
        let hit_status = self.hit_status;

        Box::pin(async move {
            let key = ctx.request().full_url();

            match backend.get(&key).await {
                Ok(Some((headers, payload))) => {
                    tracing::debug!(key = %key, "cache hit");
                    return Self::hit_response(hit_status, headers, payload);
                }
                Ok(None) => {}
                Err(error) => {
                    // Degrade to a miss; the renderer is the fallback.
                    tracing::warn!(key = %key, error = %error, "cache lookup failed");
                }
            }

            let response = next.run(ctx).await;

            if response.status().as_u16() == success_status {
                if let Some(payload) = Payload::from_body(response.body_ref()) {
                    let headers = response.headers().clone();
                    tokio::spawn(async move {
                        if let Err(error) = backend.set(&key, &headers, &payload).await {
                            tracing::warn!(key = %key, error = %error, "cache write failed");
                        } else {
                            tracing::debug!(key = %key, "cached");
                        }
                    });
                }
            }

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::cache::memory::MemoryBackend;
    use crate::http::Request;
    use crate::middleware::{from_middleware, MiddlewareHandler};

    fn ctx(target: &str) -> Context {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(request)
    }

    fn counting_handler(
        status: StatusCode,
        body: &'static str,
        hits: Arc<AtomicUsize>,
    ) -> MiddlewareHandler {
        Arc::new(move |_ctx, _next| {
            hits.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Response::new(status)
                    .header("content-type", "text/html")
                    .body(body)
            })
        })
    }

    async fn settle() {
        // Let the spawned write-back task run.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn stack(backend: Arc<dyn CacheBackend>, handler: MiddlewareHandler) -> Vec<MiddlewareHandler> {
        vec![
            from_middleware(Arc::new(CacheMiddleware::new(backend, 200))),
            handler,
        ]
    }

    #[tokio::test]
    async fn miss_then_hit_skips_the_renderer() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new(Duration::from_secs(60)));
        let renders = Arc::new(AtomicUsize::new(0));
        let stack = stack(
            backend.clone(),
            counting_handler(StatusCode::Ok, "<html></html>", renders.clone()),
        );

        let first = Next::new(stack.clone()).run(ctx("/render/example.com")).await;
        assert_eq!(first.status(), StatusCode::Ok);
        assert_eq!(first.body_ref().as_bytes(), b"<html></html>");
        assert!(first.headers().get(HEADER_CACHED).is_none());
        settle().await;

        let second = Next::new(stack).run(ctx("/render/example.com")).await;
        assert_eq!(second.status(), StatusCode::Ok);
        assert_eq!(second.body_ref().as_bytes(), b"<html></html>");
        assert_eq!(second.headers().get("content-type"), Some("text/html"));
        assert_eq!(second.headers().get(HEADER_SERVED_BY), Some("rendercache"));
        assert_eq!(second.headers().get(HEADER_CACHED), Some("true"));
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_query_strings_are_distinct_entries() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new(Duration::from_secs(60)));
        let renders = Arc::new(AtomicUsize::new(0));
        let stack = stack(
            backend.clone(),
            counting_handler(StatusCode::Ok, "page", renders.clone()),
        );

        Next::new(stack.clone()).run(ctx("/page?v=1")).await;
        settle().await;
        Next::new(stack.clone()).run(ctx("/page?v=2")).await;
        settle().await;

        assert_eq!(renders.load(Ordering::SeqCst), 2);
        assert!(backend.get("/page?v=1").await.unwrap().is_some());
        assert!(backend.get("/page?v=2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn configured_success_status_is_replayed_on_hits() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new(Duration::from_secs(60)));
        let renders = Arc::new(AtomicUsize::new(0));
        let stack = vec![
            from_middleware(Arc::new(CacheMiddleware::new(backend.clone(), 201))),
            counting_handler(StatusCode::Created, "made", renders.clone()),
        ];

        let first = Next::new(stack.clone()).run(ctx("/thing")).await;
        assert_eq!(first.status(), StatusCode::Created);
        settle().await;

        let hit = Next::new(stack).run(ctx("/thing")).await;
        assert_eq!(hit.status(), StatusCode::Created);
        assert_eq!(hit.headers().get(HEADER_CACHED), Some("true"));
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_success_response_is_delivered_but_never_cached() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new(Duration::from_secs(60)));
        let renders = Arc::new(AtomicUsize::new(0));
        let stack = stack(
            backend.clone(),
            counting_handler(StatusCode::NotFound, "gone", renders.clone()),
        );

        let response = Next::new(stack).run(ctx("/missing")).await;
        assert_eq!(response.status(), StatusCode::NotFound);
        assert_eq!(response.body_ref().as_bytes(), b"gone");
        settle().await;

        assert!(backend.get("/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_body_is_never_cached() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new(Duration::from_secs(60)));
        let handler: MiddlewareHandler =
            Arc::new(|_ctx, _next| Box::pin(async { Response::new(StatusCode::Ok) }));
        let stack = stack(backend.clone(), handler);

        Next::new(stack).run(ctx("/empty")).await;
        settle().await;

        assert!(backend.get("/empty").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn binary_payload_served_as_binary() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new(Duration::from_secs(60)));
        let handler: MiddlewareHandler = Arc::new(|_ctx, _next| {
            Box::pin(async {
                Response::new(StatusCode::Ok)
                    .header("content-type", "application/octet-stream")
                    .body_bytes(vec![0u8, 159, 146, 150])
            })
        });
        let stack = stack(backend.clone(), handler);

        Next::new(stack.clone()).run(ctx("/blob")).await;
        settle().await;

        let hit = Next::new(stack).run(ctx("/blob")).await;
        assert!(matches!(hit.body_ref(), crate::http::Body::Binary(_)));
        assert_eq!(hit.body_ref().as_bytes(), &[0u8, 159, 146, 150]);
    }

    #[tokio::test]
    async fn expired_entry_behaves_as_a_fresh_miss() {
        let backend: Arc<dyn CacheBackend> =
            Arc::new(MemoryBackend::new(Duration::from_millis(50)));
        let renders = Arc::new(AtomicUsize::new(0));
        let stack = stack(
            backend.clone(),
            counting_handler(StatusCode::Ok, "page", renders.clone()),
        );

        Next::new(stack.clone()).run(ctx("/page")).await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        Next::new(stack).run(ctx("/page")).await;
        assert_eq!(renders.load(Ordering::SeqCst), 2);
    }
}
