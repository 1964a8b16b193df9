//! Upstream transport layer
//!
//! Dialing upstream proxies, the HTTP CONNECT handshake, and replay of bytes
//! that arrive ahead of the tunnel.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{RelayError, Result};
use crate::models::ProxyEndpoint;

/// Largest CONNECT reply head accepted from an upstream
const MAX_CONNECT_HEAD: usize = 16 * 1024;

/// Largest CONNECT rejection body surfaced to the client
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Largest chunk-size line accepted in a chunked rejection body
const MAX_CHUNK_LINE: usize = 1024;

/// Upstream transport handler
pub struct UpstreamTransport;

impl UpstreamTransport {
    /// Open a TCP connection to the upstream proxy itself
    #[instrument(skip(endpoint), fields(upstream = %endpoint.address()))]
    pub async fn dial(endpoint: &ProxyEndpoint) -> Result<TcpStream> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| RelayError::UpstreamConnect(format!("TCP connect failed: {}", e)))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Ask the upstream to open a tunnel to `authority` (`host:port`).
    ///
    /// On a 200 reply the returned stream is the raw tunnel, with any bytes
    /// the upstream sent past its reply head queued in front of the socket.
    /// Any other status becomes [`RelayError::ConnectRejected`] carrying the
    /// upstream's body.
    pub async fn open_tunnel<S>(
        mut stream: S,
        endpoint: &ProxyEndpoint,
        authority: &str,
    ) -> Result<PrefixedIo<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = Self::build_connect_request(endpoint, authority);
        stream.write_all(request.as_bytes()).await.map_err(|e| {
            RelayError::UpstreamConnect(format!("Failed to send CONNECT: {}", e))
        })?;
        stream.flush().await.map_err(|e| {
            RelayError::UpstreamConnect(format!("Failed to send CONNECT: {}", e))
        })?;

        let (reply, leftover) = read_connect_reply(&mut stream).await?;

        if reply.status != StatusCode::OK {
            debug!(status = %reply.status, "CONNECT rejected by upstream");
            let body = if reply.chunked {
                read_chunked_body(&mut stream, leftover).await
            } else {
                read_rejection_body(&mut stream, leftover, reply.content_length).await
            };
            return Err(RelayError::ConnectRejected {
                status: reply.status,
                body,
            });
        }

        debug!(head_bytes = leftover.len(), "HTTP CONNECT tunnel established");
        Ok(PrefixedIo::new(leftover.freeze(), stream))
    }

    /// Build HTTP CONNECT request
    pub fn build_connect_request(endpoint: &ProxyEndpoint, authority: &str) -> String {
        format!(
            "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Authorization: {}\r\n\r\n",
            endpoint.proxy_authorization()
        )
    }
}

/// Parsed head of the upstream's CONNECT reply
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectReply {
    status: StatusCode,
    content_length: Option<usize>,
    chunked: bool,
}

/// Read until the end of the reply head; returns the bytes read past it.
async fn read_connect_reply<S>(stream: &mut S) -> Result<(ConnectReply, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_CONNECT_HEAD {
            return Err(RelayError::UpstreamConnect(
                "CONNECT reply head too large".to_string(),
            ));
        }

        let n = stream.read_buf(&mut buf).await.map_err(|e| {
            RelayError::UpstreamConnect(format!("Failed to read CONNECT response: {}", e))
        })?;
        if n == 0 {
            return Err(RelayError::UpstreamConnect(
                "Upstream closed before answering CONNECT".to_string(),
            ));
        }
    };

    let head = buf.split_to(head_end);
    let reply = parse_connect_head(&head)?;
    Ok((reply, buf))
}

/// Offset just past the blank line ending the head
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_connect_head(head: &[u8]) -> Result<ConnectReply> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();

    if !version.starts_with("HTTP/1.") {
        return Err(RelayError::UpstreamConnect(format!(
            "Malformed CONNECT response: {}",
            status_line
        )));
    }

    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| {
            RelayError::UpstreamConnect(format!("Malformed CONNECT status: {}", status_line))
        })?;

    let headers: Vec<(&str, &str)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok());

    // Chunked framing wins over Content-Length.
    let chunked = headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("transfer-encoding")
            && value
                .rsplit(',')
                .next()
                .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    });

    Ok(ConnectReply {
        status,
        content_length,
        chunked,
    })
}

/// Collect the body of a rejected CONNECT, best effort.
///
/// Reads up to `Content-Length` bytes, or until EOF when absent. A read
/// error simply ends the body.
async fn read_rejection_body<S>(
    stream: &mut S,
    mut buf: BytesMut,
    content_length: Option<usize>,
) -> Bytes
where
    S: AsyncRead + Unpin,
{
    let limit = content_length
        .unwrap_or(MAX_REJECTION_BODY)
        .min(MAX_REJECTION_BODY);

    while buf.len() < limit {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    buf.truncate(limit);
    buf.freeze()
}

/// Decode a chunked rejection body, stopping at the last chunk.
///
/// Output is capped at `MAX_REJECTION_BODY`; a malformed size line, a read
/// error or EOF ends the body with what was decoded so far.
async fn read_chunked_body<S>(stream: &mut S, mut buf: BytesMut) -> Bytes
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();

    loop {
        let line_end = loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                break pos;
            }
            if buf.len() > MAX_CHUNK_LINE || !fill(stream, &mut buf).await {
                return body.freeze();
            }
        };

        let size = parse_chunk_size(&buf[..line_end]);
        buf.advance(line_end + 2);
        let Some(size) = size else {
            break;
        };
        if size == 0 {
            break;
        }

        let room = MAX_REJECTION_BODY - body.len();
        if size >= room {
            while buf.len() < room && fill(stream, &mut buf).await {}
            let n = buf.len().min(room);
            body.extend_from_slice(&buf[..n]);
            break;
        }

        while buf.len() < size + 2 {
            if !fill(stream, &mut buf).await {
                let n = buf.len().min(size);
                body.extend_from_slice(&buf[..n]);
                return body.freeze();
            }
        }
        body.extend_from_slice(&buf[..size]);
        buf.advance(size + 2);
    }

    body.freeze()
}

/// Hex chunk size, ignoring chunk extensions
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim();
    usize::from_str_radix(size, 16).ok()
}

/// Read more bytes into `buf`; false on EOF or error
async fn fill<S>(stream: &mut S, buf: &mut BytesMut) -> bool
where
    S: AsyncRead + Unpin,
{
    matches!(stream.read_buf(buf).await, Ok(n) if n > 0)
}

pin_project! {
    /// Stream that yields buffered head bytes before reading the inner stream
    pub struct PrefixedIo<S> {
        head: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> PrefixedIo<S> {
    pub fn new(head: Bytes, inner: S) -> Self {
        Self { head, inner }
    }

    /// Bytes still waiting to be replayed
    pub fn pending_head(&self) -> usize {
        self.head.len()
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.head.is_empty() {
            let n = this.head.len().min(buf.remaining());
            buf.put_slice(&this.head[..n]);
            this.head.advance(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
