//! Body size gate (`custom-aggregator` stage).
//!
//! # Responsibilities
//! - Refuse a declared `Content-Length` above `max_request_size` before reading
//! - Buffer the body, counting every received chunk against the limit
//! - Charge trailers to the header budget
//! - Hand the downstream a complete, length-delimited body
//!
//! # Design Decisions
//! - Overflow answers 413; the remaining body bytes are never read, so memory
//!   stays bounded by the limit. HTTP/1.1 also closes the connection, while
//!   an h2 stream simply ends with the 413
//! - A body read failure is a framing error (400)
//! - Failures are `TransportError`s rendered by `failure_response`

use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::{BodyExt, Collected, Full, Limited};
use hyper::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::Request;
use tower::util::BoxCloneService;
#[cfg(test)]
use tower::ServiceExt;

use crate::config::RequestSizeValidationConfiguration;
use crate::error::{SizeLimit, TransportError};
use crate::http::body::{self, Body, BoxError};
use crate::pipeline::decoder::{head_size, header_block_size};
use crate::pipeline::{failure_response, HttpService, Stage, StageKind};

#[derive(Debug, Clone)]
pub struct BodyAggregator {
    max_request_size: usize,
    max_header_size: Option<usize>,
    http2: bool,
}

impl BodyAggregator {
    pub fn new(config: &RequestSizeValidationConfiguration) -> Self {
        Self {
            max_request_size: config.max_request_size,
            max_header_size: config.header_size_validation.then_some(config.max_header_size),
            http2: false,
        }
    }

    /// Variant for an h2 pipeline: rejections end the stream, not the connection.
    pub fn for_http2(mut self) -> Self {
        self.http2 = true;
        self
    }
}

/// `Limited::collect` behind a named, boxed `Send` future, for the same
/// higher-ranked lifetime reason as [`super::oneshot`].
fn collect_limited(
    body: Body,
    max: usize,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<Collected<Bytes>, BoxError>> + Send>,
> {
    Box::pin(Limited::new(body, max).collect())
}

fn declared_length(req: &Request<Body>) -> Option<u64> {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

impl Stage for BodyAggregator {
    fn kind(&self) -> StageKind {
        StageKind::Aggregator
    }

    fn wrap(&self, inner: HttpService) -> HttpService {
        let max = self.max_request_size;
        let max_header = self.max_header_size;
        let http2 = self.http2;
        let reject = move |err: TransportError| Ok::<_, Infallible>(failure_response(&err, http2));

        BoxCloneService::new(tower::service_fn(move |req: Request<Body>| {
            let inner = inner.clone();
            async move {
                if let Some(declared) = declared_length(&req) {
                    if declared > max as u64 {
                        tracing::debug!(declared, max, "Declared body exceeds request size limit");
                        return reject(TransportError::SizeLimitExceeded { limit: SizeLimit::Body, max });
                    }
                }

                let (mut parts, incoming) = req.into_parts();
                let collected = match collect_limited(incoming, max).await {
                    Ok(collected) => collected,
                    Err(e) => {
                        let err = TransportError::from_body_error(e, max);
                        tracing::debug!(error = %err, "Failed to aggregate request body");
                        return reject(err);
                    }
                };

                if let (Some(limit), Some(trailers)) = (max_header, collected.trailers()) {
                    let size = head_size(&parts.method, &parts.uri, &parts.headers)
                        + header_block_size(trailers);
                    if size > limit {
                        tracing::debug!(size, limit, "Trailers exceed header size limit");
                        return reject(TransportError::SizeLimitExceeded {
                            limit: SizeLimit::Header,
                            max: limit,
                        });
                    }
                }

                let trailers = collected.trailers().cloned();
                let bytes = collected.to_bytes();
                if parts.headers.remove(TRANSFER_ENCODING).is_some() || !bytes.is_empty() {
                    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
                }

                let aggregated = match trailers {
                    Some(trailers) => body::boxed(
                        Full::new(bytes).with_trailers(std::future::ready(Some(Ok(trailers)))),
                    ),
                    None => body::full(bytes),
                };

                super::oneshot(inner, Request::from_parts(parts, aggregated)).await
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::h1_codec;
    use crate::pipeline::PipelineBuilder;
    use crate::pipeline::{Codec, Http2Settings};
    use bytes::Bytes;
    use hyper::{Response, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Terminal stage that counts calls and echoes the body length.
    struct Counting(Arc<AtomicUsize>);

    impl Stage for Counting {
        fn kind(&self) -> StageKind {
            StageKind::Handler
        }

        fn wrap(&self, _inner: HttpService) -> HttpService {
            let calls = self.0.clone();
            BoxCloneService::new(tower::service_fn(move |req: Request<Body>| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let length = req.headers().get(CONTENT_LENGTH).cloned();
                    let bytes = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
                    let mut response = Response::new(body::full(bytes));
                    if let Some(length) = length {
                        response.headers_mut().insert("x-seen-length", length);
                    }
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    }

    fn limits(max: usize) -> RequestSizeValidationConfiguration {
        RequestSizeValidationConfiguration {
            request_size_validation: true,
            max_request_size: max,
            ..Default::default()
        }
    }

    fn service(max: usize, calls: &Arc<AtomicUsize>) -> HttpService {
        PipelineBuilder::new(h1_codec())
            .add_last(BodyAggregator::new(&limits(max))).unwrap()
            .add_last(Counting(calls.clone())).unwrap()
            .build()
            .unwrap()
            .into_service()
    }

    /// h2 terminal stage for the shared aggregator.
    struct Http2Counting(Arc<AtomicUsize>);

    impl Stage for Http2Counting {
        fn kind(&self) -> StageKind {
            StageKind::Http2Handler
        }

        fn wrap(&self, inner: HttpService) -> HttpService {
            Counting(self.0.clone()).wrap(inner)
        }
    }

    #[tokio::test]
    async fn http2_rejection_keeps_the_connection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = PipelineBuilder::new(Codec::Http2(Http2Settings::default()))
            .add_last(BodyAggregator::new(&limits(64)).for_http2()).unwrap()
            .add_last(Http2Counting(calls.clone())).unwrap()
            .build()
            .unwrap()
            .into_service();

        let request = Request::post("/").body(body::full(vec![b'x'; 100])).unwrap();
        let response = svc.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(response.headers().get("connection").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn declared_oversize_is_rejected_without_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let request = Request::post("/")
            .header(CONTENT_LENGTH, "1048576")
            .body(body::empty())
            .unwrap();

        let response = service(65536, &calls).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response.headers()["connection"], "close");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn streamed_overflow_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let request = Request::post("/").body(body::full(vec![b'x'; 100])).unwrap();

        let response = service(64, &calls).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn body_within_limit_is_delivered_whole() {
        let calls = Arc::new(AtomicUsize::new(0));
        let request = Request::post("/")
            .header(TRANSFER_ENCODING, "chunked")
            .body(body::full("hello"))
            .unwrap();

        let response = service(64, &calls).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-seen-length"], "5");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes, Bytes::from_static(b"hello"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
