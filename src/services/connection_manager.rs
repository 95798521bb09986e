//! Pooled outbound connection manager.
//!
//! # Responsibilities
//! - Own the single outbound HTTP client pool of the process
//! - Apply transport socket options and pool sizing
//! - Bound concurrent outbound requests
//!
//! # Design Decisions
//! - Created once from the transport properties and shared via `Arc`
//! - Saturation is reported to the caller instead of queueing
//! - The active-request slot lives as long as the response body

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::config::TransportProperties;
use crate::http::body::{self, Body};

/// Error type for outbound requests.
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("outbound pool saturated ({0} active requests)")]
    Saturated(usize),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

#[derive(Debug)]
pub struct ConnectionManager {
    client: Client<HttpConnector, Body>,
    active: Arc<AtomicUsize>,
    max_active: usize,
}

impl ConnectionManager {
    /// Build the pool from transport properties.
    pub fn new(properties: &TransportProperties) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(properties.tcp_nodelay);
        connector.set_reuse_address(properties.so_reuseaddr);
        connector.set_keepalive(properties.so_keepalive.then(|| Duration::from_secs(60)));
        connector.set_connect_timeout(Some(Duration::from_millis(properties.connect_timeout_ms)));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(properties.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(properties.pool_idle_timeout_secs))
            .pool_timer(TokioTimer::new())
            .build(connector);

        tracing::debug!(
            max_idle_per_host = properties.max_idle_per_host,
            max_active = properties.max_active_requests,
            "Outbound connection manager created"
        );

        Self {
            client,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: properties.max_active_requests,
        }
    }

    /// Try to reserve an outbound request slot.
    pub fn try_acquire(&self) -> Option<OutboundGuard> {
        let mut prev = self.active.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_active {
                return None;
            }
            match self.active.compare_exchange_weak(
                prev, prev + 1, Ordering::Relaxed, Ordering::Relaxed
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(OutboundGuard {
            active: self.active.clone(),
        })
    }

    /// Send a request through the pool.
    pub async fn send(&self, request: Request<Body>) -> Result<Response<Body>, OutboundError> {
        let guard = self
            .try_acquire()
            .ok_or_else(|| OutboundError::Saturated(self.active_requests()))?;

        let response = self.client.request(request).await?;

        // Slot is released when the body is dropped.
        Ok(response.map(move |incoming| {
            body::boxed(incoming.map_frame(move |frame| {
                let _slot = &guard;
                frame
            }))
        }))
    }

    /// Outbound requests in flight.
    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// A RAII guard for one in-flight outbound request.
#[derive(Debug)]
pub struct OutboundGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for OutboundGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}
