//! Forwarding downstream.
//!
//! # Responsibilities
//! - Rewrite each request onto a fixed upstream base URI
//! - Send it through the shared outbound ConnectionManager
//! - Stream the upstream response back unchanged apart from hop-by-hop headers
//!
//! # Design Decisions
//! - No retries: the request body is streamed, not buffered
//! - Saturated pool → 503, any other outbound failure → 502

use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{Request, StatusCode, Uri};

use crate::config::ConfigError;
use crate::handler::{DownstreamError, SourceHandler};
use crate::http::headers::strip_hop_by_hop;
use crate::http::{IncomingRequest, OutgoingResponse, ResponseBody};
use crate::services::{ConnectionManager, OutboundError};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

pub struct ForwardingHandler {
    scheme: Scheme,
    authority: Authority,
    manager: Arc<ConnectionManager>,
}

impl ForwardingHandler {
    pub fn new(upstream: &str, manager: Arc<ConnectionManager>) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidParameter {
            name: "handler.upstream".into(),
            reason: reason.into(),
        };

        let uri: Uri = upstream.parse().map_err(|_| invalid("not a valid URI"))?;
        let parts = uri.into_parts();
        let scheme = parts.scheme.ok_or_else(|| invalid("missing scheme"))?;
        if scheme != Scheme::HTTP {
            return Err(invalid("only http upstreams are supported"));
        }
        let authority = parts.authority.ok_or_else(|| invalid("missing authority"))?;

        Ok(Self { scheme, authority, manager })
    }

    fn upstream_uri(&self, target: &Uri) -> Result<Uri, DownstreamError> {
        let path_and_query = target
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| DownstreamError::with_status(StatusCode::BAD_REQUEST, e.to_string()))
    }
}

#[async_trait]
impl SourceHandler for ForwardingHandler {
    async fn on_request(&self, request: IncomingRequest) -> Result<OutgoingResponse, DownstreamError> {
        let IncomingRequest { id, remote_addr, method, target, mut headers, body, .. } = request;

        let uri = self.upstream_uri(&target)?;
        strip_hop_by_hop(&mut headers);

        let peer = remote_addr.ip().to_string();
        let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, peer),
            None => peer,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        let mut outbound = Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(body.into_inner())
            .map_err(|e| DownstreamError::new(e.to_string()))?;
        *outbound.headers_mut() = headers;

        tracing::debug!(
            request_id = %id,
            method = %method,
            upstream = %outbound.uri(),
            "Forwarding request"
        );

        match self.manager.send(outbound).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Ok(OutgoingResponse {
                    status: parts.status,
                    headers: parts.headers,
                    body: ResponseBody::Stream(body),
                })
            }
            Err(OutboundError::Saturated(active)) => {
                tracing::warn!(request_id = %id, active, "Outbound pool saturated");
                Err(DownstreamError::with_status(StatusCode::SERVICE_UNAVAILABLE, "outbound pool saturated"))
            }
            Err(e) => {
                tracing::error!(request_id = %id, error = %e, "Upstream error");
                Err(DownstreamError::with_status(StatusCode::BAD_GATEWAY, "upstream request failed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportProperties;

    fn manager() -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(&TransportProperties::default()))
    }

    #[test]
    fn rejects_invalid_upstreams() {
        assert!(ForwardingHandler::new("not a uri", manager()).is_err());
        assert!(ForwardingHandler::new("/relative", manager()).is_err());
        assert!(ForwardingHandler::new("https://example.com", manager()).is_err());
    }

    #[test]
    fn rewrites_target_onto_upstream() {
        let handler = ForwardingHandler::new("http://127.0.0.1:9000", manager()).unwrap();
        let uri = handler.upstream_uri(&"/a/b?c=d".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/a/b?c=d");
    }
}
