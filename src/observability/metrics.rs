//! Metrics collection and exposition.
//!
//! # Metrics
//! - `transport_connections_total` (counter): connections by negotiated protocol
//! - `transport_pipelines_total` (counter): pipeline assemblies by protocol and phase
//! - `transport_active_connections` (gauge): live connections
//! - `transport_rejections_total` (counter): gate rejections by status code
//! - `transport_handshake_failures_total` (counter): failed TLS handshakes
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is only installed by the binary

use std::net::SocketAddr;

use hyper::StatusCode;

use crate::negotiation::NegotiatedProtocol;
use crate::pipeline::assembler::AssemblyPhase;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!(metrics_address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(metrics_address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}

pub fn record_pipeline(protocol: NegotiatedProtocol, phase: AssemblyPhase) {
    if phase == AssemblyPhase::Initial {
        ::metrics::counter!("transport_connections_total", "protocol" => protocol.as_str()).increment(1);
    }
    ::metrics::counter!(
        "transport_pipelines_total",
        "protocol" => protocol.as_str(),
        "phase" => phase.as_str()
    )
    .increment(1);
}

pub fn set_active_connections(active: u64) {
    ::metrics::gauge!("transport_active_connections").set(active as f64);
}

pub fn record_rejection(status: StatusCode) {
    ::metrics::counter!("transport_rejections_total", "status" => status.as_u16().to_string()).increment(1);
}

pub fn record_handshake_failure() {
    ::metrics::counter!("transport_handshake_failures_total").increment(1);
}
