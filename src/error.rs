//! Transport error kinds.
//!
//! # Responsibilities
//! - Classify every failure by the scope it terminates
//! - Map protocol failures to the status code written on the wire
//!
//! # Design Decisions
//! - Startup and listener errors abort; connection errors close the socket;
//!   request errors end one exchange and keep the connection usable
//! - Internal details never reach the wire, only the canonical reason phrase

use std::net::SocketAddr;

use http_body_util::LengthLimitError;
use hyper::StatusCode;

use crate::config::ConfigError;
use crate::handler::DownstreamError;
use crate::http::body::BoxError;

/// Which size budget a request exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeLimit {
    /// Request line, header block and trailers.
    Header,
    /// Cumulative body content.
    Body,
}

impl std::fmt::Display for SizeLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizeLimit::Header => f.write_str("header"),
            SizeLimit::Body => f.write_str("body"),
        }
    }
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Startup,
    Listener,
    Connection,
    Request,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error ({status}): {reason}")]
    Protocol { status: StatusCode, reason: String },

    #[error("{limit} size limit of {max} bytes exceeded")]
    SizeLimitExceeded { limit: SizeLimit, max: usize },

    #[error("downstream error: {0}")]
    Downstream(#[from] DownstreamError),

    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    /// Shorthand for a 400-class framing error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        TransportError::Protocol {
            status: StatusCode::BAD_REQUEST,
            reason: reason.into(),
        }
    }

    /// Classify a failure raised while reading a request body capped at `limit`.
    pub fn from_body_error(err: BoxError, limit: usize) -> Self {
        if err.downcast_ref::<LengthLimitError>().is_some() {
            return TransportError::SizeLimitExceeded { limit: SizeLimit::Body, max: limit };
        }
        match err.downcast_ref::<hyper::Error>() {
            Some(e) if e.is_incomplete_message() || e.is_canceled() || e.is_closed() => {
                TransportError::Cancelled
            }
            _ => TransportError::malformed(err.to_string()),
        }
    }

    /// Status code to emit on the wire, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportError::Protocol { status, .. } => Some(*status),
            TransportError::SizeLimitExceeded { limit: SizeLimit::Header, .. } => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            TransportError::SizeLimitExceeded { limit: SizeLimit::Body, .. } => {
                Some(StatusCode::PAYLOAD_TOO_LARGE)
            }
            TransportError::Downstream(e) => Some(e.status()),
            TransportError::Config(_)
            | TransportError::Bind { .. }
            | TransportError::Handshake(_)
            | TransportError::Cancelled => None,
        }
    }

    pub fn scope(&self) -> ErrorScope {
        match self {
            TransportError::Config(_) => ErrorScope::Startup,
            TransportError::Bind { .. } => ErrorScope::Listener,
            TransportError::Handshake(_)
            | TransportError::Protocol { .. }
            | TransportError::SizeLimitExceeded { .. } => ErrorScope::Connection,
            TransportError::Downstream(_) | TransportError::Cancelled => ErrorScope::Request,
        }
    }

    /// Size limit violations are protocol errors with a dedicated status.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            TransportError::Protocol { .. } | TransportError::SizeLimitExceeded { .. }
        )
    }
}
