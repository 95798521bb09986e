//! Request/response adapter (`handler` / `http2-handler` stage).
//!
//! # Responsibilities
//! - Turn each decoded request into an `IncomingRequest` with a fresh id
//! - Wait for room in the downstream queue before dispatching
//! - Write the downstream's `OutgoingResponse`, or a canonical error status
//! - Tell the downstream when a request is abandoned mid-flight
//!
//! # Design Decisions
//! - HTTP/1.1 ordering comes from the codec: the next request is not read
//!   until the current response is written
//! - HTTP/2 streams are dispatched concurrently by the codec; each stream
//!   runs its own adapter future
//! - Error bodies carry the reason phrase only

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{Request, Response};
use tower::util::BoxCloneService;
use tracing::Instrument;

use crate::error::TransportError;
use crate::handler::{CancelReason, SourceHandler};
use crate::http::body::Body;
use crate::http::headers::strip_hop_by_hop;
use crate::http::{IncomingRequest, OutgoingResponse, RequestBody, RequestId};
use crate::negotiation::NegotiatedProtocol;
use crate::net::connection::{ConnectionContext, ConnectionId};
use crate::pipeline::{failure_response, HttpService, Stage, StageKind};
use crate::services::DownstreamQueue;

/// Calls `cancel` on drop unless the request completed.
struct CancelGuard {
    handler: Arc<dyn SourceHandler>,
    id: RequestId,
    armed: bool,
}

impl CancelGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.handler.cancel(self.id, CancelReason::ConnectionClosed);
        }
    }
}

struct Shared {
    handler: Arc<dyn SourceHandler>,
    queue: Arc<DownstreamQueue>,
    connection_id: ConnectionId,
    listener_id: String,
    remote_addr: SocketAddr,
    protocol: NegotiatedProtocol,
}

impl Shared {
    async fn dispatch(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        let id = RequestId::new();
        let span = tracing::debug_span!(
            "request",
            request_id = %id,
            connection_id = %self.connection_id,
            method = %req.method(),
            target = %req.uri(),
        );

        async move {
            let _slot = self.queue.enter().await;

            let (parts, body) = req.into_parts();
            let incoming = IncomingRequest {
                id,
                listener_id: self.listener_id.clone(),
                protocol: self.protocol,
                remote_addr: self.remote_addr,
                method: parts.method,
                target: parts.uri,
                version: parts.version,
                headers: parts.headers,
                body: RequestBody::new(body),
            };

            let guard = CancelGuard { handler: self.handler.clone(), id, armed: true };
            let result = self.handler.on_request(incoming).await;
            guard.disarm();

            match result {
                Ok(response) => {
                    tracing::trace!(status = %response.status, "Downstream responded");
                    self.into_wire(response)
                }
                Err(e) => {
                    let err = TransportError::Downstream(e);
                    tracing::warn!(status = ?err.status(), error = %err, "Downstream error");
                    failure_response(&err, self.protocol.is_http2())
                }
            }
        }
        .instrument(span)
        .await
    }

    fn into_wire(&self, response: OutgoingResponse) -> Response<Body> {
        let OutgoingResponse { status, mut headers, body } = response;
        if self.protocol.is_http2() {
            strip_hop_by_hop(&mut headers);
        }

        let mut wire = Response::new(body.into_body());
        *wire.status_mut() = status;
        *wire.headers_mut() = headers;
        wire
    }
}

/// Terminal stage bridging the wire to a `SourceHandler`.
pub struct SourceAdapter {
    kind: StageKind,
    shared: Arc<Shared>,
}

impl SourceAdapter {
    pub fn new(
        kind: StageKind,
        handler: Arc<dyn SourceHandler>,
        queue: Arc<DownstreamQueue>,
        ctx: &ConnectionContext,
        protocol: NegotiatedProtocol,
    ) -> Self {
        Self {
            kind,
            shared: Arc::new(Shared {
                handler,
                queue,
                connection_id: ctx.id,
                listener_id: ctx.listener.id.clone(),
                remote_addr: ctx.remote_addr,
                protocol,
            }),
        }
    }
}

impl Stage for SourceAdapter {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn wrap(&self, _inner: HttpService) -> HttpService {
        let shared = self.shared.clone();
        BoxCloneService::new(tower::service_fn(move |req: Request<Body>| {
            let shared = shared.clone();
            async move { Ok::<_, Infallible>(shared.dispatch(req).await) }
        }))
    }
}
