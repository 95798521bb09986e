//! Header size gate (`decoder` stage).
//!
//! # Responsibilities
//! - Charge the request line and header block against `max_header_size`
//! - Reject oversized heads with 431 and close the connection
//!
//! # Design Decisions
//! - Parsing itself is bounded by the codec's read buffer cap, so hyper aborts
//!   an oversized head before the header table is built; this stage applies
//!   the exact byte budget to heads that fit the buffer
//! - Without header validation the stage is a pass-through

use std::convert::Infallible;

use hyper::header::HeaderMap;
use hyper::{Method, Request, Uri};
use tower::util::BoxCloneService;
#[cfg(test)]
use tower::ServiceExt;

use crate::config::RequestSizeValidationConfiguration;
use crate::error::{SizeLimit, TransportError};
use crate::http::body::Body;
use crate::pipeline::{failure_response, HttpService, Stage, StageKind};

/// Smallest read buffer hyper accepts.
pub const MIN_READ_BUFFER: usize = 8192;

const CRLF: usize = 2;
const COLON_SP: usize = 2;

/// Bytes of a header block as written on the wire.
pub fn header_block_size(headers: &HeaderMap) -> usize {
    headers
        .iter()
        .map(|(name, value)| name.as_str().len() + COLON_SP + value.len() + CRLF)
        .sum()
}

/// "HTTP/1.1" and "HTTP/1.0" are both eight bytes.
const VERSION_LEN: usize = 8;

/// Bytes of the request line plus header block.
pub fn head_size(method: &Method, target: &Uri, headers: &HeaderMap) -> usize {
    method.as_str().len() + 1 + target.to_string().len() + 1 + VERSION_LEN + CRLF
        + header_block_size(headers)
}

/// Read buffer cap for the h1 codec given the size configuration.
pub fn read_buffer_cap(config: &RequestSizeValidationConfiguration) -> Option<usize> {
    config
        .header_size_validation
        .then(|| config.max_header_size.max(MIN_READ_BUFFER))
}

#[derive(Debug, Clone)]
pub struct HeaderGate {
    config: RequestSizeValidationConfiguration,
}

impl HeaderGate {
    pub fn new(config: RequestSizeValidationConfiguration) -> Self {
        Self { config }
    }
}

impl Stage for HeaderGate {
    fn kind(&self) -> StageKind {
        StageKind::Decoder
    }

    fn wrap(&self, inner: HttpService) -> HttpService {
        if !self.config.header_size_validation {
            return inner;
        }

        let max = self.config.max_header_size;
        BoxCloneService::new(tower::service_fn(move |req: Request<Body>| {
            let inner = inner.clone();
            async move {
                let size = head_size(req.method(), req.uri(), req.headers());
                if size > max {
                    tracing::debug!(size, max, "Request head exceeds header size limit");
                    let err = TransportError::SizeLimitExceeded { limit: SizeLimit::Header, max };
                    return Ok::<_, Infallible>(failure_response(&err, false));
                }
                super::oneshot(inner, req).await
            }
        }))
    }
}
