//! Request-line version check ahead of the HTTP/1.1 codec.
//!
//! # Responsibilities
//! - Read a connection's first request line before the codec parses it
//! - Answer 505 and close when the line names a version other than
//!   HTTP/1.0 or HTTP/1.1, the HTTP/2 connection preface included
//! - Hand every byte read so far to the codec unchanged otherwise
//!
//! # Design Decisions
//! - Only the first request line is inspected; later malformed lines are
//!   the codec's to reject with 400
//! - A line that is not `METHOD TARGET HTTP/x` is left to the codec as well,
//!   so framing errors keep their 400

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hyper::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::TransportError;
use crate::observability::metrics;

const INITIAL_READ: usize = 1024;

/// Outcome of looking at the bytes read so far.
#[derive(Debug, PartialEq, Eq)]
pub enum LineCheck {
    /// The codec can take over.
    Supported,
    /// A well-formed request line naming this version.
    Unsupported(String),
    /// No complete line yet.
    Incomplete,
}

/// Classify the first request line in `buf`. Leading empty lines are
/// skipped the way the codec skips them. Once `cap` bytes are buffered
/// without a line end the codec decides.
pub fn check_request_line(buf: &[u8], cap: usize) -> LineCheck {
    let start = buf.iter().position(|b| *b != b'\r' && *b != b'\n');
    let line_end = start.and_then(|s| buf[s..].iter().position(|b| *b == b'\n').map(|e| (s, s + e)));

    let Some((start, end)) = line_end else {
        return if buf.len() >= cap { LineCheck::Supported } else { LineCheck::Incomplete };
    };

    let line = buf[start..end].strip_suffix(b"\r").unwrap_or(&buf[start..end]);
    let parts: Vec<&[u8]> = line.split(|b| *b == b' ').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [_, _, b"HTTP/1.1" | b"HTTP/1.0"] => LineCheck::Supported,
        [_, _, version] if version.starts_with(b"HTTP/") => {
            LineCheck::Unsupported(String::from_utf8_lossy(version).into_owned())
        }
        _ => LineCheck::Supported,
    }
}

/// What to do with a fresh HTTP/1.1 connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Preread {
    /// Serve it, replaying these bytes first.
    Serve(Bytes),
    /// Answer 505 for this version and close.
    Reject(String),
    /// The peer went away or never sent a line.
    Closed,
}

async fn read_line<I>(io: &mut I, cap: usize) -> io::Result<Preread>
where
    I: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(INITIAL_READ);
    loop {
        match check_request_line(&buf, cap) {
            LineCheck::Supported => return Ok(Preread::Serve(buf.freeze())),
            LineCheck::Unsupported(version) => return Ok(Preread::Reject(version)),
            LineCheck::Incomplete => {}
        }
        if io.read_buf(&mut buf).await? == 0 {
            return Ok(if buf.is_empty() { Preread::Closed } else { Preread::Serve(buf.freeze()) });
        }
    }
}

/// Read until the first request line is complete, `cap` bytes are buffered,
/// or `timeout` passes.
pub async fn read_request_line<I>(io: &mut I, cap: usize, timeout: Duration) -> Preread
where
    I: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, read_line(io, cap)).await {
        Ok(Ok(preread)) => preread,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Connection failed before the request line");
            Preread::Closed
        }
        Err(_) => {
            tracing::debug!(timeout_ms = timeout.as_millis() as u64, "No request line before timeout");
            Preread::Closed
        }
    }
}

/// Wire bytes of the 505 answer. The body is the reason phrase, as for
/// every other transport-generated error.
pub fn version_not_supported() -> Bytes {
    let status = StatusCode::HTTP_VERSION_NOT_SUPPORTED;
    let reason = status.canonical_reason().unwrap_or("HTTP Version Not Supported");
    Bytes::from(format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status.as_u16(),
        reason,
        reason.len(),
        reason
    ))
}

/// Write the 505 and close the write side.
pub async fn reject<I>(io: &mut I, version: &str)
where
    I: AsyncWrite + Unpin,
{
    let err = TransportError::Protocol {
        status: StatusCode::HTTP_VERSION_NOT_SUPPORTED,
        reason: format!("unsupported protocol version {}", version),
    };
    tracing::debug!(error = %err, "Rejecting request line");
    metrics::record_rejection(StatusCode::HTTP_VERSION_NOT_SUPPORTED);

    let written = async {
        io.write_all(&version_not_supported()).await?;
        io.shutdown().await
    };
    if let Err(e) = written.await {
        tracing::debug!(error = %e, "Failed to write 505");
    }
}

/// Socket that yields already-read bytes before reading on.
pub struct Rewind<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(inner: T, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::h2c::PREFACE;

    #[test]
    fn http1_versions_pass() {
        assert_eq!(check_request_line(b"GET / HTTP/1.1\r\n", 8192), LineCheck::Supported);
        assert_eq!(check_request_line(b"\r\nGET / HTTP/1.0\r\n", 8192), LineCheck::Supported);
    }

    #[test]
    fn other_versions_are_unsupported() {
        assert_eq!(
            check_request_line(b"GET / HTTP/2.0\r\nhost: h\r\n\r\n", 8192),
            LineCheck::Unsupported("HTTP/2.0".into())
        );
        assert_eq!(
            check_request_line(PREFACE, 8192),
            LineCheck::Unsupported("HTTP/2.0".into())
        );
    }

    #[test]
    fn malformed_lines_are_left_to_the_codec() {
        assert_eq!(check_request_line(b"GET /\r\n", 8192), LineCheck::Supported);
        assert_eq!(check_request_line(b"GARBAGE\n", 8192), LineCheck::Supported);
    }

    #[test]
    fn waits_for_a_whole_line_up_to_the_cap() {
        assert_eq!(check_request_line(b"", 8192), LineCheck::Incomplete);
        assert_eq!(check_request_line(b"\r\n", 8192), LineCheck::Incomplete);
        assert_eq!(check_request_line(b"GET / HTTP/2", 8192), LineCheck::Incomplete);
        assert_eq!(check_request_line(b"GET /aaaa", 8), LineCheck::Supported);
    }

    #[tokio::test]
    async fn preread_bytes_are_replayed() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HT").await.unwrap();
        client.write_all(b"TP/1.1\r\nhost: h\r\n\r\n").await.unwrap();
        drop(client);

        let Preread::Serve(prefix) = read_request_line(&mut server, 8192, Duration::from_secs(1)).await
        else {
            panic!("expected the connection to be served");
        };
        let mut io = Rewind::new(server, prefix);
        let mut out = Vec::new();
        io.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET / HTTP/1.1\r\nhost: h\r\n\r\n");
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let preread = read_request_line(&mut server, 8192, Duration::from_millis(20)).await;
        assert_eq!(preread, Preread::Closed);
    }

    #[tokio::test]
    async fn rejection_writes_505_and_closes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        reject(&mut server, "HTTP/2.0").await;
        drop(server);

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 505 HTTP Version Not Supported\r\n"));
        assert!(out.contains("connection: close\r\n"));
        assert!(out.ends_with("\r\n\r\nHTTP Version Not Supported"));
    }
}
