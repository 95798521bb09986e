//! Codec drivers: run an assembled pipeline on a socket until it closes.
//!
//! # Design Decisions
//! - Connection-level I/O and parse errors end the connection quietly at
//!   debug level; peers resetting is routine
//! - Shutdown asks the codec to finish in-flight exchanges rather than
//!   dropping the socket
//! - HTTP/1.1 connections pass the request-line version check before the
//!   codec sees them

use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, oneshot};

use crate::http::body;
use crate::negotiation::h2c::PendingUpgrade;
use crate::negotiation::version::{self, Preread, Rewind};
use crate::observability::metrics;
use crate::pipeline::decoder::MIN_READ_BUFFER;
use crate::pipeline::{self, Codec, Pipeline};

fn log_connection_error(protocol: &'static str, e: &hyper::Error) {
    if e.is_parse_too_large() {
        metrics::record_rejection(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }
    tracing::debug!(protocol, error = %e, "Connection ended with error");
}

/// Serve HTTP/1.1. When `upgrade` is given and the pipeline accepted an h2c
/// upgrade, the pending upgrade is returned once the 101 has been written.
pub async fn serve_http1<I>(
    mut io: I,
    pipeline: Pipeline,
    upgrade: Option<oneshot::Receiver<PendingUpgrade>>,
    mut shutdown: broadcast::Receiver<()>,
) -> Option<PendingUpgrade>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Codec::Http1(settings) = pipeline.codec() else {
        tracing::error!(stages = ?pipeline.names(), "HTTP/1.1 driver given an HTTP/2 pipeline");
        return None;
    };

    let cap = settings.max_buf_size.unwrap_or(MIN_READ_BUFFER);
    let preread = tokio::select! {
        preread = version::read_request_line(&mut io, cap, settings.header_read_timeout) => preread,
        _ = shutdown.recv() => return None,
    };
    let prefix = match preread {
        Preread::Serve(prefix) => prefix,
        Preread::Reject(v) => {
            version::reject(&mut io, &v).await;
            return None;
        }
        Preread::Closed => return None,
    };

    let svc = pipeline.into_service();
    let service = service_fn(move |req: Request<Incoming>| pipeline::oneshot(svc.clone(), req.map(body::boxed)));

    let mut builder = http1::Builder::new();
    builder
        .keep_alive(settings.keep_alive)
        .timer(TokioTimer::new())
        .header_read_timeout(settings.header_read_timeout);
    if let Some(cap) = settings.max_buf_size {
        builder.max_buf_size(cap);
    }

    let conn = builder
        .serve_connection(TokioIo::new(Rewind::new(io, prefix)), service)
        .with_upgrades();
    tokio::pin!(conn);

    let mut draining = false;
    let result = loop {
        tokio::select! {
            res = conn.as_mut() => break res,
            _ = shutdown.recv(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };
    if let Err(e) = &result {
        log_connection_error("http/1.1", e);
    }

    upgrade.and_then(|mut rx| rx.try_recv().ok())
}

/// Serve HTTP/2 until the peer or shutdown closes the connection.
pub async fn serve_http2<I>(io: I, pipeline: Pipeline, mut shutdown: broadcast::Receiver<()>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Codec::Http2(settings) = pipeline.codec() else {
        tracing::error!(stages = ?pipeline.names(), "HTTP/2 driver given an HTTP/1.1 pipeline");
        return;
    };

    let svc = pipeline.into_service();
    let service = service_fn(move |req: Request<Incoming>| pipeline::oneshot(svc.clone(), req.map(body::boxed)));

    let mut builder = http2::Builder::new(TokioExecutor::new());
    builder.timer(TokioTimer::new());
    if let Some(max) = settings.max_header_list_size {
        builder.max_header_list_size(max);
    }

    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut draining = false;
    let result = loop {
        tokio::select! {
            res = conn.as_mut() => break res,
            _ = shutdown.recv(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };
    if let Err(e) = &result {
        log_connection_error("h2", e);
    }
}
