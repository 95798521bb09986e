//! Per-connection handler pipeline.
//!
//! # Data Flow
//! ```text
//! codec (hyper h1 or h2 connection)
//!     → decoder            (decoder.rs, header size gate)
//!     → http2-upgrade      (upgrade.rs, cleartext listeners only)
//!     → custom-aggregator  (aggregator.rs, body size gate)
//!     → compressor         (compressor.rs)
//!     → chunkWriter        (chunked.rs)
//!     → handler            (http/adapter.rs)
//!
//! HTTP/2 pipelines: codec → custom-aggregator (when enabled) → http2-handler
//! ```
//!
//! # Design Decisions
//! - Each stage wraps the rest of the chain, so inbound traversal follows
//!   installation order and outbound traversal is the reverse
//! - `PipelineBuilder::add_last` refuses out-of-order or mixed h1/h2 stages,
//!   so an assembled pipeline is always well formed. The aggregator is the
//!   one stage both codecs share
//! - Stage failures become a `TransportError` and leave through
//!   `failure_response`, which decides the status and whether to close
//! - A pipeline is consumed once to produce the connection's service

pub mod aggregator;
pub mod assembler;
pub mod chunked;
pub mod compressor;
pub mod decoder;
pub mod upgrade;

use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use tower::util::BoxCloneService;

pub use aggregator::BodyAggregator;
pub use assembler::PipelineAssembler;
pub use chunked::{ChunkWriter, ChunkedBody};
pub use compressor::Compressor;
pub use decoder::HeaderGate;
pub use upgrade::UpgradeStage;

use crate::error::TransportError;
use crate::http::body::{self, Body};
use crate::observability::metrics;

/// Service type every stage consumes and produces.
pub type HttpService = BoxCloneService<Request<Body>, Response<Body>, Infallible>;

/// Future returned by [`oneshot`].
pub(crate) type HttpFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response<Body>, Infallible>> + Send>>;

/// `ServiceExt::oneshot` behind a named, boxed `Send` future. Awaiting the
/// concrete `Oneshot` inside a stage's async block trips rustc's
/// higher-ranked lifetime check when the block is proven `Send`.
pub(crate) fn oneshot(inner: HttpService, req: Request<Body>) -> HttpFuture {
    Box::pin(tower::ServiceExt::oneshot(inner, req))
}

/// Stage kinds in mandatory installation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    Decoder,
    Http2Upgrade,
    Aggregator,
    Compressor,
    ChunkWriter,
    Handler,
    Http2Handler,
}

impl StageKind {
    /// Stage name as it appears in logs.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Decoder => "decoder",
            StageKind::Http2Upgrade => "http2-upgrade",
            StageKind::Aggregator => "custom-aggregator",
            StageKind::Compressor => "compressor",
            StageKind::ChunkWriter => "chunkWriter",
            StageKind::Handler => "handler",
            StageKind::Http2Handler => "http2-handler",
        }
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, StageKind::Http2Handler)
    }

    /// Stages that fit either codec.
    pub fn is_shared(&self) -> bool {
        matches!(self, StageKind::Aggregator)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageKind::Handler | StageKind::Http2Handler)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One pipeline stage.
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Wrap the remainder of the chain. Terminal stages ignore `inner`.
    fn wrap(&self, inner: HttpService) -> HttpService;
}

/// HTTP/1.1 codec settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http1Settings {
    pub keep_alive: bool,
    /// Read buffer cap; oversized heads are rejected while parsing.
    pub max_buf_size: Option<usize>,
    pub header_read_timeout: Duration,
}

/// HTTP/2 codec settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Http2Settings {
    pub max_header_list_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Http1(Http1Settings),
    Http2(Http2Settings),
}

impl Codec {
    pub fn is_http2(&self) -> bool {
        matches!(self, Codec::Http2(_))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("stage {stage} cannot be installed after {after}")]
    OutOfOrder { stage: StageKind, after: StageKind },

    #[error("stage {stage} does not match the {codec} codec")]
    MixedProtocols { stage: StageKind, codec: &'static str },

    #[error("pipeline has no terminal handler")]
    MissingHandler,
}

impl From<PipelineError> for TransportError {
    fn from(err: PipelineError) -> Self {
        TransportError::Protocol {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            reason: err.to_string(),
        }
    }
}

/// Builder that only accepts stages in rank order.
pub struct PipelineBuilder {
    codec: Codec,
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn new(codec: Codec) -> Self {
        Self { codec, stages: Vec::new() }
    }

    pub fn add_last(mut self, stage: impl Stage + 'static) -> Result<Self, PipelineError> {
        let kind = stage.kind();

        if !kind.is_shared() && kind.is_http2() != self.codec.is_http2() {
            let codec = if self.codec.is_http2() { "h2" } else { "http/1.1" };
            return Err(PipelineError::MixedProtocols { stage: kind, codec });
        }
        if let Some(last) = self.stages.last().map(|s| s.kind()) {
            if kind <= last {
                return Err(PipelineError::OutOfOrder { stage: kind, after: last });
            }
        }

        self.stages.push(Box::new(stage));
        Ok(self)
    }

    /// Install `stage` only when `enabled`.
    pub fn add_last_if(self, enabled: bool, stage: impl Stage + 'static) -> Result<Self, PipelineError> {
        if enabled {
            self.add_last(stage)
        } else {
            Ok(self)
        }
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        match self.stages.last() {
            Some(last) if last.kind().is_terminal() => Ok(Pipeline {
                codec: self.codec,
                stages: self.stages,
            }),
            _ => Err(PipelineError::MissingHandler),
        }
    }
}

/// An assembled pipeline: codec plus ordered stages.
pub struct Pipeline {
    codec: Codec,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Stage names in installation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.kind().name()).collect()
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.iter().any(|s| s.kind() == kind)
    }

    /// Fold the stages into one service, first stage outermost.
    pub fn into_service(self) -> HttpService {
        let tail = BoxCloneService::new(tower::service_fn(|_req: Request<Body>| async {
            tracing::error!("Request reached the end of the pipeline without a handler");
            Ok::<_, Infallible>(error_response(StatusCode::INTERNAL_SERVER_ERROR, true))
        }));

        self.stages
            .iter()
            .rev()
            .fold(tail, |inner, stage| stage.wrap(inner))
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("codec", &self.codec)
            .field("stages", &self.names())
            .finish()
    }
}

/// Canonical error response: reason phrase only, optionally closing the connection.
pub fn error_response(status: StatusCode, close: bool) -> Response<Body> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut response = Response::new(body::full(reason));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    if close {
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

/// Response for a request that failed inside the pipeline.
///
/// Protocol violations are counted as rejections and, on HTTP/1.1, close the
/// connection; an h2 stream ends with its own response. Errors without a wire
/// status fall back to 500.
pub fn failure_response(err: &TransportError, http2: bool) -> Response<Body> {
    let status = err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let protocol = err.is_protocol_error();
    if protocol {
        metrics::record_rejection(status);
    }
    error_response(status, protocol && !http2)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Stage that records its name on the way in and out.
    pub struct Recorder {
        pub kind: StageKind,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl Stage for Recorder {
        fn kind(&self) -> StageKind {
            self.kind
        }

        fn wrap(&self, inner: HttpService) -> HttpService {
            let log = self.log.clone();
            let name = self.kind.name();
            let terminal = self.kind.is_terminal();
            BoxCloneService::new(tower::service_fn(move |req: Request<Body>| {
                let log = log.clone();
                let inner = inner.clone();
                async move {
                    log.lock().unwrap().push(format!("in:{}", name));
                    let response = if terminal {
                        Response::new(body::full("ok"))
                    } else {
                        match crate::pipeline::oneshot(inner, req).await {
                            Ok(response) => response,
                            Err(never) => match never {},
                        }
                    };
                    log.lock().unwrap().push(format!("out:{}", name));
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    }

    pub fn recording(kind: StageKind, log: &Arc<Mutex<Vec<String>>>) -> Recorder {
        Recorder { kind, log: log.clone() }
    }

    pub fn h1_codec() -> Codec {
        Codec::Http1(Http1Settings {
            keep_alive: true,
            max_buf_size: None,
            header_read_timeout: Duration::from_secs(5),
        })
    }
}
