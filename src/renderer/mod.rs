//! Renderer collaborator interface.
//!
//! The renderer itself lives outside this crate — typically a headless
//! browser driving serializer. The cache layer only needs the contract:
//! given a URL and a set of options, produce a status, headers, and a body.

use async_trait::async_trait;
use thiserror::Error;

use crate::http::{Body, Headers, StatusCode};

/// Options passed to a render invocation.
///
/// `inject_shady_dom` controls whether the shady-DOM polyfill is injected
/// into the page before serialization; the proactive refresher always sets
/// it, matching how live render routes serve web-component pages.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub inject_shady_dom: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            inject_shady_dom: true,
        }
    }
}

/// The outcome of a successful render: what the renderer would have written
/// to the HTTP response.
#[derive(Debug)]
pub struct RenderResult {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Body,
}

/// Errors raised by a renderer implementation.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("page fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("render timed out")]
    Timeout,
}

/// A server-side page renderer.
///
/// Consumed by the miss path of the hosting application and by the
/// [`ExpirationRefresher`](crate::cache::ExpirationRefresher), which
/// re-renders pages in the background when their cache entries expire.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Renders `url` and returns the full response the page would produce.
    async fn render(&self, url: &str, options: RenderOptions) -> Result<RenderResult, RenderError>;
}
