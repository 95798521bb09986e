//! Response compression (`compressor` stage).
//!
//! Negotiates gzip, deflate or brotli from `Accept-Encoding` using
//! tower-http's compression layer; responses already carrying a
//! `Content-Encoding`, small bodies and images are left alone.

use hyper::Response;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;

use crate::http::body;
use crate::pipeline::{HttpService, Stage, StageKind};

#[derive(Debug, Clone, Default)]
pub struct Compressor;

impl Compressor {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for Compressor {
    fn kind(&self) -> StageKind {
        StageKind::Compressor
    }

    fn wrap(&self, inner: HttpService) -> HttpService {
        let service = ServiceBuilder::new()
            .map_response(|response: Response<_>| response.map(body::boxed))
            .layer(CompressionLayer::new())
            .service(inner);
        BoxCloneService::new(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{h1_codec, recording};
    use crate::pipeline::PipelineBuilder;
    use http_body_util::BodyExt;
    use hyper::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
    use hyper::Request;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    struct Large;

    impl Stage for Large {
        fn kind(&self) -> StageKind {
            StageKind::Handler
        }

        fn wrap(&self, _inner: HttpService) -> HttpService {
            BoxCloneService::new(tower::service_fn(|_req: Request<body::Body>| async {
                Ok::<_, Infallible>(Response::new(body::full("abcdefgh".repeat(512))))
            }))
        }
    }

    fn service() -> HttpService {
        let log = Arc::new(Mutex::new(Vec::new()));
        PipelineBuilder::new(h1_codec())
            .add_last(recording(StageKind::Decoder, &log)).unwrap()
            .add_last(Compressor::new()).unwrap()
            .add_last(Large).unwrap()
            .build()
            .unwrap()
            .into_service()
    }

    #[tokio::test]
    async fn gzip_when_accepted() {
        let request = Request::get("/")
            .header(ACCEPT_ENCODING, "gzip")
            .body(body::empty())
            .unwrap();
        let response = service().oneshot(request).await.unwrap();
        assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");

        let compressed = response.into_body().collect().await.unwrap().to_bytes();
        assert!(compressed.len() < 4096);
    }

    #[tokio::test]
    async fn identity_without_accept_encoding() {
        let request = Request::get("/").body(body::empty()).unwrap();
        let response = service().oneshot(request).await.unwrap();
        assert!(response.headers().get(CONTENT_ENCODING).is_none());

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes.len(), 4096);
    }
}
