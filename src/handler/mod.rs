//! Downstream message-processing contract.
//!
//! # Data Flow
//! ```text
//! pipeline "handler" stage (http/adapter.rs)
//!     → SourceHandler::on_request(IncomingRequest)
//!         → echo.rs (reflects the request)
//!         → forward.rs (proxies through the shared ConnectionManager)
//!     ← OutgoingResponse | DownstreamError
//!     → SourceHandler::cancel(id, reason) if the connection goes away first
//! ```
//!
//! # Design Decisions
//! - Returning from `on_request` is the `respond(id, ..)` of the contract
//! - Implementations may run long work; the adapter never blocks the socket on it

pub mod echo;
pub mod forward;

use std::sync::Arc;

use async_trait::async_trait;
use hyper::StatusCode;

pub use echo::EchoHandler;
pub use forward::ForwardingHandler;

use crate::config::{ConfigError, HandlerConfig, HandlerKind};
use crate::http::{IncomingRequest, OutgoingResponse, RequestId};
use crate::services::TransportServices;

/// Why an in-flight request was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Peer close, reset or idle timeout. These are not distinguished.
    ConnectionClosed,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::ConnectionClosed => f.write_str("connection closed"),
        }
    }
}

/// Failure reported by the downstream layer for one request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DownstreamError {
    status: Option<StatusCode>,
    message: String,
}

impl DownstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { status: None, message: message.into() }
    }

    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status: Some(status), message: message.into() }
    }

    /// Status to emit; 500 unless the handler chose one.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Terminal consumer of decoded requests.
#[async_trait]
pub trait SourceHandler: Send + Sync + 'static {
    async fn on_request(&self, request: IncomingRequest) -> Result<OutgoingResponse, DownstreamError>;

    /// Release anything held for `id`; no response will be written.
    fn cancel(&self, id: RequestId, reason: CancelReason) {
        tracing::debug!(request_id = %id, %reason, "Request cancelled");
    }
}

/// Build the configured downstream handler.
pub fn from_config(
    config: &HandlerConfig,
    services: &Arc<TransportServices>,
) -> Result<Arc<dyn SourceHandler>, ConfigError> {
    match config.kind {
        HandlerKind::Echo => Ok(Arc::new(EchoHandler::new(services.clone()))),
        HandlerKind::Forward => {
            let upstream = config.upstream.as_deref().ok_or_else(|| ConfigError::InvalidParameter {
                name: "handler.upstream".into(),
                reason: "required for the forward handler".into(),
            })?;
            let handler = ForwardingHandler::new(upstream, services.connection_manager().clone())?;
            Ok(Arc::new(handler))
        }
    }
}
