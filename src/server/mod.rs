//! Async TCP hosting server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests through a
//! middleware stack — the cache middleware first, the application's render
//! handler last. Supports HTTP/1.1 persistent connections (keep-alive) out
//! of the box.
//!
//! Also provides [`ChunkedWriter`], the transport-side
//! [`ResponseWriter`](crate::cache::ResponseWriter) for handlers that
//! stream their body in multiple writes; wrap it in a
//! [`CaptureWriter`](crate::cache::CaptureWriter) to capture streamed
//! responses into the cache.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::cache::ResponseWriter;
use crate::context::Context;
use crate::http::{
    Chunk, Headers, StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::middleware::{MiddlewareHandler, Next};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The hosting HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests through
/// an ordered middleware stack.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rendercache::cache::CacheManager;
/// use rendercache::config::CacheConfig;
/// use rendercache::middleware::MiddlewareHandler;
/// use rendercache::server::Server;
/// use rendercache::{Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = CacheConfig::from_json_file("config.json")?;
///     let manager = CacheManager::new(config).await?;
///
///     let render: MiddlewareHandler = Arc::new(|_ctx, _next| {
///         Box::pin(async { Response::new(StatusCode::Ok).body("<html></html>") })
///     });
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(vec![manager.middleware(), render]).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections, dispatching each request through
    /// `stack` in order. The last handler in the stack is expected to
    /// produce the response; earlier entries may short-circuit (the cache
    /// middleware does, on a hit).
    ///
    /// This method runs until the process is terminated or an unrecoverable
    /// listener error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, stack: Vec<MiddlewareHandler>) -> Result<(), ServerError> {
        let stack = Arc::new(stack);
        info!(address = %self.local_addr, "rendercache host listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let stack = Arc::clone(&stack);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, stack).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    stack: Arc<Vec<MiddlewareHandler>>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large — sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Attempt to parse the buffered data as an HTTP request.
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                // Headers not yet fully received — read more data.
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request — sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            continue;
        }

        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            url = %request.full_url(),
            "dispatching request"
        );

        let response = Next::new(stack.as_ref().clone())
            .run(Context::new(request))
            .await;
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close — shutting down");
            break;
        }
    }

    Ok(())
}

/// Transport-side writable response using HTTP/1.1 chunked transfer
/// encoding.
///
/// The head (status line and headers, with `Transfer-Encoding: chunked`) is
/// committed by [`start`](Self::start); each [`write`](ResponseWriter::write)
/// emits one chunk frame, and [`end`](ResponseWriter::end) emits the
/// terminating zero-length chunk and flushes.
pub struct ChunkedWriter<W: AsyncWrite + Unpin + Send> {
    stream: W,
}

impl<W: AsyncWrite + Unpin + Send> ChunkedWriter<W> {
    /// Writes the response head to `stream` and returns the body writer.
    pub async fn start(
        mut stream: W,
        status: StatusCode,
        headers: &Headers,
    ) -> io::Result<Self> {
        let estimated_size = 128 + headers.len() * 64;
        let mut head = BytesMut::with_capacity(estimated_size);
        head.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in headers.iter() {
            head.put(format!("{name}: {value}\r\n").as_bytes());
        }
        head.put(&b"Transfer-Encoding: chunked\r\n\r\n"[..]);

        stream.write_all(&head).await?;
        Ok(Self { stream })
    }

    /// Consumes the writer, returning the underlying stream.
    pub fn into_inner(self) -> W {
        self.stream
    }

    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        // A zero-length frame would terminate the body early.
        if data.is_empty() {
            return Ok(());
        }
        let mut frame = BytesMut::with_capacity(data.len() + 16);
        frame.put(format!("{:x}\r\n", data.len()).as_bytes());
        frame.put(data);
        frame.put(&b"\r\n"[..]);
        self.stream.write_all(&frame).await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseWriter for ChunkedWriter<W> {
    async fn write(&mut self, chunk: Chunk) -> io::Result<()> {
        self.write_chunk(chunk.as_bytes()).await
    }

    async fn end(&mut self, chunk: Option<Chunk>) -> io::Result<()> {
        if let Some(chunk) = chunk {
            self.write_chunk(chunk.as_bytes()).await?;
        }
        self.stream.write_all(b"0\r\n\r\n").await?;
        self.stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunked_writer_frames_the_body() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html");

        let mut writer = ChunkedWriter::start(Vec::new(), StatusCode::Ok, &headers)
            .await
            .unwrap();
        writer.write(Chunk::Text("<html>".into())).await.unwrap();
        writer.end(Some(Chunk::Text("</html>".into()))).await.unwrap();

        let wire = String::from_utf8(writer.into_inner()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-Type: text/html\r\n"));
        assert!(wire.contains("Transfer-Encoding: chunked\r\n\r\n"));
        assert!(wire.contains("6\r\n<html>\r\n"));
        assert!(wire.contains("7\r\n</html>\r\n"));
        assert!(wire.ends_with("0\r\n\r\n"));
    }

    #[tokio::test]
    async fn chunked_writer_skips_empty_frames() {
        let mut writer = ChunkedWriter::start(Vec::new(), StatusCode::Ok, &Headers::new())
            .await
            .unwrap();
        writer.write(Chunk::Text(String::new())).await.unwrap();
        writer.end(None).await.unwrap();

        let wire = String::from_utf8(writer.into_inner()).unwrap();
        let body = wire.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(body, "0\r\n\r\n");
    }

    #[tokio::test]
    async fn server_serves_through_the_stack() {
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let handler: MiddlewareHandler = Arc::new(|_ctx, _next| {
            Box::pin(async { Response::new(StatusCode::Ok).body("hello") })
        });

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(vec![handler]));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hello"));
    }
}
