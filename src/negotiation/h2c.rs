//! Cleartext HTTP/2 upgrade (`Upgrade: h2c`).
//!
//! # Responsibilities
//! - Decide whether an HTTP/1.1 request is an acceptable h2c upgrade
//! - Hand the upgrading request to the connection task once hyper yields the socket
//! - Replay the upgrade to the h2 codec: preface, SETTINGS from `HTTP2-Settings`,
//!   and the request itself as HEADERS on stream 1
//! - Verify and drop the client's own connection preface
//!
//! # Design Decisions
//! - The h2 codec has no server-side upgrade entry point, so the upgrade is
//!   expressed as synthesized client bytes; the codec cannot tell them apart
//!   from a prior-knowledge connection whose first request was stream 1
//! - Header blocks use HPACK literals without indexing and without Huffman
//!   coding; they never touch the peer-visible dynamic table
//! - Upgrades carrying a request body are declined

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hyper::header::{HeaderMap, HeaderName, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE};
use hyper::http::request::Parts;
use hyper::upgrade::OnUpgrade;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::http::headers::has_token;

/// Client connection preface (RFC 7540 §3.5).
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const HTTP2_SETTINGS: &str = "http2-settings";

const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

const FRAME_HEADER_LEN: usize = 9;

/// Default SETTINGS_MAX_FRAME_SIZE.
const MAX_FRAME_SIZE: usize = 16_384;

/// Each setting is a 16-bit id and a 32-bit value.
const SETTING_LEN: usize = 6;

/// Upgrade accepted by the pipeline, waiting for the socket.
pub struct PendingUpgrade {
    pub on_upgrade: OnUpgrade,
    pub settings: Bytes,
    pub head: Parts,
}

/// Single-use handoff from the upgrade stage to the connection task.
pub type UpgradeSlot = Arc<Mutex<Option<oneshot::Sender<PendingUpgrade>>>>;

pub fn upgrade_channel() -> (UpgradeSlot, oneshot::Receiver<PendingUpgrade>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(Mutex::new(Some(tx))), rx)
}

/// Decoded `HTTP2-Settings` payload if `headers` describe an acceptable upgrade.
pub fn upgrade_settings(headers: &HeaderMap) -> Option<Bytes> {
    if !has_token(headers, UPGRADE, "h2c") {
        return None;
    }
    if !has_token(headers, CONNECTION, "upgrade") || !has_token(headers, CONNECTION, HTTP2_SETTINGS) {
        return None;
    }
    if headers.contains_key(TRANSFER_ENCODING) {
        return None;
    }
    if let Some(length) = headers.get(CONTENT_LENGTH) {
        if length.as_bytes() != b"0" {
            return None;
        }
    }

    let mut values = headers.get_all(HTTP2_SETTINGS).iter();
    let value = values.next()?;
    if values.next().is_some() {
        return None;
    }

    let encoded = value.to_str().ok()?.trim().trim_end_matches('=');
    let decoded = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    if decoded.len() % SETTING_LEN != 0 {
        return None;
    }
    Some(Bytes::from(decoded))
}

fn is_excluded(name: &HeaderName, value: &[u8], nominated: &[String]) -> bool {
    match name.as_str() {
        "connection" | "upgrade" | "http2-settings" | "keep-alive" | "proxy-connection"
        | "transfer-encoding" | "host" => true,
        "te" => !value.eq_ignore_ascii_case(b"trailers"),
        other => nominated.iter().any(|n| n == other),
    }
}

/// HPACK integer with an `n`-bit prefix (RFC 7541 §5.1).
fn encode_integer(dst: &mut BytesMut, prefix: u8, n: u8, mut value: usize) {
    let max = (1usize << n) - 1;
    if value < max {
        dst.put_u8(prefix | value as u8);
        return;
    }
    dst.put_u8(prefix | max as u8);
    value -= max;
    while value >= 128 {
        dst.put_u8((value % 128) as u8 | 0x80);
        value /= 128;
    }
    dst.put_u8(value as u8);
}

fn encode_string(dst: &mut BytesMut, s: &[u8]) {
    encode_integer(dst, 0x00, 7, s.len());
    dst.put_slice(s);
}

/// Literal header field without indexing, new name.
fn encode_literal(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    dst.put_u8(0x00);
    encode_string(dst, name);
    encode_string(dst, value);
}

/// HPACK block for the upgrading request.
pub fn encode_header_block(head: &Parts) -> Bytes {
    let mut block = BytesMut::new();

    let path = head
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");
    let authority = head
        .headers
        .get(HOST)
        .map(|v| v.as_bytes().to_vec())
        .or_else(|| head.uri.authority().map(|a| a.as_str().as_bytes().to_vec()));

    encode_literal(&mut block, b":method", head.method.as_str().as_bytes());
    encode_literal(&mut block, b":scheme", b"http");
    encode_literal(&mut block, b":path", path.as_bytes());
    if let Some(authority) = authority {
        encode_literal(&mut block, b":authority", &authority);
    }

    let nominated: Vec<String> = head
        .headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    for (name, value) in head.headers.iter() {
        if is_excluded(name, value.as_bytes(), &nominated) {
            continue;
        }
        encode_literal(&mut block, name.as_str().as_bytes(), value.as_bytes());
    }

    block.freeze()
}

fn put_frame_header(dst: &mut BytesMut, len: usize, kind: u8, flags: u8, stream_id: u32) {
    dst.put_uint(len as u64, 3);
    dst.put_u8(kind);
    dst.put_u8(flags);
    dst.put_u32(stream_id & 0x7fff_ffff);
}

/// Bytes the h2 codec reads before the client's own traffic.
pub fn replay_preface(settings: &[u8], head: &Parts) -> Bytes {
    let block = encode_header_block(head);
    let mut out = BytesMut::with_capacity(PREFACE.len() + 9 + settings.len() + 9 + block.len());

    out.put_slice(PREFACE);

    put_frame_header(&mut out, settings.len(), FRAME_SETTINGS, 0, 0);
    out.put_slice(settings);

    let mut chunks = block.chunks(MAX_FRAME_SIZE).peekable();
    let first = chunks.next().unwrap_or(&[]);
    let mut flags = FLAG_END_STREAM;
    if chunks.peek().is_none() {
        flags |= FLAG_END_HEADERS;
    }
    put_frame_header(&mut out, first.len(), FRAME_HEADERS, flags, 1);
    out.put_slice(first);

    while let Some(chunk) = chunks.next() {
        let flags = if chunks.peek().is_none() { FLAG_END_HEADERS } else { 0 };
        put_frame_header(&mut out, chunk.len(), FRAME_CONTINUATION, flags, 1);
        out.put_slice(chunk);
    }

    out.freeze()
}

/// Upgraded socket that first yields the replayed bytes, then the client's
/// traffic with its connection preface removed.
///
/// On the write side the codec's first SETTINGS ACK answers the replayed
/// SETTINGS, which the client already considers acknowledged by the 101.
/// That one frame is dropped; every other byte passes through unchanged.
pub struct ReplayIo<T> {
    inner: T,
    replay: Bytes,
    preface_seen: usize,
    ack: AckFilter,
}

impl<T> ReplayIo<T> {
    pub fn new(inner: T, replay: Bytes) -> Self {
        Self { inner, replay, preface_seen: 0, ack: AckFilter::default() }
    }
}

/// Frame-boundary tracker for the outbound stream.
#[derive(Default)]
struct AckFilter {
    header: [u8; FRAME_HEADER_LEN],
    filled: usize,
    payload_left: usize,
    // frame header accepted from the caller but not yet written
    pending: BytesMut,
    done: bool,
}

impl AckFilter {
    /// Accepts up to one frame header's worth of bytes. Returns how many
    /// were consumed.
    fn accept_header(&mut self, buf: &[u8]) -> usize {
        let take = (FRAME_HEADER_LEN - self.filled).min(buf.len());
        self.header[self.filled..self.filled + take].copy_from_slice(&buf[..take]);
        self.filled += take;

        if self.filled == FRAME_HEADER_LEN {
            self.filled = 0;
            let h = &self.header;
            let len = (h[0] as usize) << 16 | (h[1] as usize) << 8 | h[2] as usize;
            if h[3] == FRAME_SETTINGS && h[4] & FLAG_ACK != 0 && len == 0 {
                self.done = true;
            } else {
                self.pending.extend_from_slice(h);
                self.payload_left = len;
            }
        }
        take
    }
}

impl<T: AsyncWrite + Unpin> ReplayIo<T> {
    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.ack.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.ack.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.ack.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for ReplayIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.replay.is_empty() {
            let n = this.replay.len().min(buf.remaining());
            buf.put_slice(&this.replay.split_to(n));
            return Poll::Ready(Ok(()));
        }

        while this.preface_seen < PREFACE.len() {
            let mut scratch = [0u8; 24];
            let want = PREFACE.len() - this.preface_seen;
            let mut rb = ReadBuf::new(&mut scratch[..want]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;

            let got = rb.filled();
            if got.is_empty() {
                return Poll::Ready(Ok(()));
            }
            let expected = &PREFACE[this.preface_seen..this.preface_seen + got.len()];
            if got != expected {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid HTTP/2 connection preface after h2c upgrade",
                )));
            }
            this.preface_seen += got.len();
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for ReplayIo<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;

        if this.ack.done || buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        if this.ack.payload_left > 0 {
            let n = this.ack.payload_left.min(buf.len());
            let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..n]))?;
            this.ack.payload_left -= written;
            return Poll::Ready(Ok(written));
        }
        Poll::Ready(Ok(this.ack.accept_header(buf)))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        if self.ack.done && self.ack.pending.is_empty() {
            return Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs);
        }
        let first = bufs.iter().find(|b| !b.is_empty()).map_or(&[][..], |b| &b[..]);
        self.poll_write(cx, first)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
