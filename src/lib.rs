//! # rendercache
//!
//! A response-cache layer for a server-side page renderer, built on an
//! async HTTP/1.1 host.
//!
//! Rendering a page is expensive — a headless browser fetch, script
//! execution, serialization — so rendered responses are cached by full
//! request URL with a configured time-to-live. The cache sits in the
//! request path as a middleware: a hit is served straight from storage
//! (with indicator headers), a miss falls through to the renderer and the
//! successful response is written back without delaying the client.
//! Backends that push expiration events additionally drive a background
//! refresher that re-renders pages as they expire, before any client asks
//! again.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rendercache::cache::CacheManager;
//! use rendercache::config::CacheConfig;
//! use rendercache::middleware::MiddlewareHandler;
//! use rendercache::server::Server;
//! use rendercache::{Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::from_json_file("config.json")?;
//!     let manager = CacheManager::new(config).await?;
//!
//!     // The application's render route; a real host would call its
//!     // renderer here (and hand the same renderer to spawn_refresher).
//!     let render: MiddlewareHandler = Arc::new(|ctx, _next| {
//!         Box::pin(async move {
//!             let url = ctx.request().full_url();
//!             Response::new(StatusCode::Ok)
//!                 .header("Content-Type", "text/html")
//!                 .body(format!("<html><!-- rendered {url} --></html>"))
//!         })
//!     });
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(vec![manager.middleware(), render]).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`http`] — HTTP/1.1 primitives: request parsing, response building,
//!   typed bodies.
//! - [`context`] — per-request state passed through the middleware chain.
//! - [`middleware`] — the chain itself: handlers, [`Next`](middleware::Next),
//!   and the [`Middleware`](middleware::Middleware) trait.
//! - [`cache`] — the cache layer: backend contract, storage backends,
//!   read-through middleware, streamed-response capture, expiration
//!   refresher, and the [`CacheManager`](cache::CacheManager) composition
//!   root.
//! - [`renderer`] — the [`Renderer`](renderer::Renderer) contract the cache
//!   refreshes through.
//! - [`config`] — JSON configuration with startup validation.
//! - [`server`] — the async TCP host that runs the middleware stack.

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod renderer;
pub mod server;

pub use context::Context;
pub use http::{Body, Chunk, Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
