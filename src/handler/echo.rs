//! Echo downstream.
//!
//! Answers every request with 200, its own body and its end-to-end headers.

use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, CONTENT_LENGTH};
use hyper::StatusCode;

use crate::handler::{DownstreamError, SourceHandler};
use crate::http::headers::strip_hop_by_hop;
use crate::http::{IncomingRequest, OutgoingResponse};
use crate::services::TransportServices;

pub struct EchoHandler {
    services: Arc<TransportServices>,
}

impl EchoHandler {
    pub fn new(services: Arc<TransportServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl SourceHandler for EchoHandler {
    async fn on_request(&self, request: IncomingRequest) -> Result<OutgoingResponse, DownstreamError> {
        let IncomingRequest { id, method, target, mut headers, body, .. } = request;

        let mut buf = self.services.buffer_factory().allocate();
        let mut body = body.into_inner();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| {
                tracing::debug!(request_id = %id, error = %e, "Failed to read request body");
                DownstreamError::with_status(StatusCode::BAD_REQUEST, "unreadable request body")
            })?;
            if let Ok(data) = frame.into_data() {
                buf.extend_from_slice(&data);
            }
        }

        strip_hop_by_hop(&mut headers);
        headers.remove(CONTENT_LENGTH);

        tracing::trace!(request_id = %id, %method, %target, bytes = buf.len(), "Echoing request");

        let mut response = OutgoingResponse::ok().with_headers(headers).with_body(buf.freeze());
        if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
            response.headers.insert("x-request-id", value);
        }
        Ok(response)
    }
}
