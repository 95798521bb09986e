//! Messages exchanged with the downstream layer.
//!
//! # Responsibilities
//! - Carry one decoded request (head plus pull-driven body) downstream
//! - Carry one response (status, headers, body source) back to the wire
//!
//! # Design Decisions
//! - Request ids are UUID v4, generated per request, never per connection
//! - The request body is read from the socket only as the consumer polls it

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Body as HttpBody;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode, Uri, Version};
use uuid::Uuid;

use crate::error::TransportError;
use crate::http::body::{self, Body, BoxError};
use crate::negotiation::NegotiatedProtocol;

/// Unique identifier of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Request body as seen by the downstream layer.
pub struct RequestBody {
    inner: Body,
}

impl RequestBody {
    pub fn new(inner: Body) -> Self {
        Self { inner }
    }

    pub fn empty() -> Self {
        Self::new(body::empty())
    }

    /// Exact length if the transport knows it.
    pub fn exact_len(&self) -> Option<u64> {
        self.inner.size_hint().exact()
    }

    /// Buffer the whole body, failing once `limit` bytes are exceeded.
    pub async fn collect(self, limit: usize) -> Result<Bytes, TransportError> {
        let collected = Limited::new(self.inner, limit)
            .collect()
            .await
            .map_err(|e| TransportError::from_body_error(e, limit))?;
        Ok(collected.to_bytes())
    }

    pub fn into_inner(self) -> Body {
        self.inner
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("size_hint", &self.inner.size_hint())
            .finish()
    }
}

/// A decoded request handed to the downstream layer.
#[derive(Debug)]
pub struct IncomingRequest {
    pub id: RequestId,
    pub listener_id: String,
    pub protocol: NegotiatedProtocol,
    pub remote_addr: SocketAddr,
    pub method: Method,
    pub target: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// Response body source.
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    /// Streamed or chunked source; written as the socket accepts data.
    Stream(Body),
}

impl ResponseBody {
    pub fn stream<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        ResponseBody::Stream(body::boxed(body))
    }

    pub fn into_body(self) -> Body {
        match self {
            ResponseBody::Empty => body::empty(),
            ResponseBody::Full(bytes) => body::full(bytes),
            ResponseBody::Stream(body) => body,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Response produced by the downstream layer for one request.
#[derive(Debug)]
pub struct OutgoingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl OutgoingResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Full(bytes.into());
        self
    }

    pub fn with_stream<B>(mut self, body: B) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        self.body = ResponseBody::stream(body);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SizeLimit;

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[tokio::test]
    async fn body_collect_enforces_limit() {
        let body = RequestBody::new(body::full("0123456789"));
        assert_eq!(body.exact_len(), Some(10));
        let err = body.collect(4).await.unwrap_err();
        assert!(matches!(err, TransportError::SizeLimitExceeded { limit: SizeLimit::Body, max: 4 }));

        let body = RequestBody::new(body::full("0123456789"));
        assert_eq!(body.collect(10).await.unwrap(), Bytes::from_static(b"0123456789"));
    }

    #[test]
    fn builder_sets_fields() {
        let response = OutgoingResponse::ok()
            .with_header(HeaderName::from_static("x-a"), HeaderValue::from_static("1"))
            .with_body("ok");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers["x-a"], "1");
        assert!(matches!(response.body, ResponseBody::Full(ref b) if b == "ok"));
    }
}
