//! Protocol negotiation.
//!
//! # Data Flow
//! ```text
//! Path A (ssl_config, http2_tls):
//!     TLS handshake → ALPN select → h2 pipeline | h1 pipeline
//! Path B (ssl_config):
//!     TLS handshake → h1 pipeline
//! Path C (cleartext):
//!     h1 pipeline + http2-upgrade → [101, h2c replay] → h2 pipeline
//! ```
//!
//! # Design Decisions
//! - ALPN is settled before any HTTP byte flows, so TLS listeners never
//!   offer the h2c upgrade
//! - The protocol is fixed once per connection; nothing re-enters
//!   negotiation after the first pipeline is assembled, except the single
//!   h2c switch

pub mod alpn;
pub mod driver;
pub mod h2c;
pub mod version;

use std::fmt;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::config::ListenerConfiguration;
use crate::error::TransportError;
use crate::net::connection::ConnectionContext;
use crate::net::tls::TlsAcceptorCache;
use crate::pipeline::assembler::{AssemblyPhase, PipelineAssembler};

/// Protocol a connection settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiatedProtocol {
    /// Cleartext HTTP/1.1.
    Http11,
    /// HTTP/1.1 over TLS, via ALPN or a plain TLS context.
    Http11Tls,
    /// HTTP/2 selected through ALPN.
    Http2Tls,
    /// HTTP/2 after an accepted `Upgrade: h2c`.
    Http2Cleartext,
}

impl NegotiatedProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiatedProtocol::Http11 => "http/1.1",
            NegotiatedProtocol::Http11Tls => "http/1.1+tls",
            NegotiatedProtocol::Http2Tls => "h2",
            NegotiatedProtocol::Http2Cleartext => "h2c",
        }
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, NegotiatedProtocol::Http2Tls | NegotiatedProtocol::Http2Cleartext)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, NegotiatedProtocol::Http11Tls | NegotiatedProtocol::Http2Tls)
    }
}

impl fmt::Display for NegotiatedProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a listener's connections are negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPath {
    /// TLS with ALPN (`h2`, `http/1.1`).
    Alpn,
    /// TLS without ALPN, always HTTP/1.1.
    Tls,
    /// Cleartext HTTP/1.1 with the h2c upgrade on offer.
    Cleartext,
}

impl NegotiationPath {
    pub fn select(listener: &ListenerConfiguration) -> Self {
        match (&listener.ssl_config, listener.http2_tls) {
            (Some(_), true) => NegotiationPath::Alpn,
            (Some(_), false) => NegotiationPath::Tls,
            (None, _) => NegotiationPath::Cleartext,
        }
    }
}

/// Drives one connection from its first byte to close.
#[derive(Clone)]
pub struct ProtocolNegotiator {
    assembler: PipelineAssembler,
    tls: Arc<TlsAcceptorCache>,
}

impl ProtocolNegotiator {
    pub fn new(assembler: PipelineAssembler, tls: Arc<TlsAcceptorCache>) -> Self {
        Self { assembler, tls }
    }

    pub async fn negotiate(
        &self,
        stream: TcpStream,
        ctx: ConnectionContext,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        match NegotiationPath::select(&ctx.listener) {
            NegotiationPath::Cleartext => self.run_cleartext(stream, ctx, shutdown).await,
            path => self.run_tls(stream, ctx, path, shutdown).await,
        }
    }

    async fn run_tls(
        &self,
        stream: TcpStream,
        ctx: ConnectionContext,
        path: NegotiationPath,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        let acceptor = self.tls.get(ctx.listener.port).ok_or_else(|| {
            TransportError::Handshake(format!("no TLS context for port {}", ctx.listener.port))
        })?;

        let (tls_stream, protocol) =
            alpn::handshake(&acceptor, stream, path, ctx.listener.connect_timeout()).await?;
        tracing::debug!(protocol = protocol.as_str(), "TLS handshake complete");

        if protocol.is_http2() {
            let pipeline = self.assembler.http2(&ctx, protocol, AssemblyPhase::Initial)?;
            driver::serve_http2(tls_stream, pipeline, shutdown).await;
        } else {
            let pipeline = self.assembler.http1(&ctx, protocol, None)?;
            driver::serve_http1(tls_stream, pipeline, None, shutdown).await;
        }
        Ok(())
    }

    async fn run_cleartext(
        &self,
        stream: TcpStream,
        ctx: ConnectionContext,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        let (slot, pending) = h2c::upgrade_channel();
        let pipeline = self.assembler.http1(&ctx, NegotiatedProtocol::Http11, Some(slot))?;

        let h2_shutdown = shutdown.resubscribe();
        let Some(upgrade) = driver::serve_http1(stream, pipeline, Some(pending), shutdown).await else {
            return Ok(());
        };

        let upgraded = upgrade
            .on_upgrade
            .await
            .map_err(|e| TransportError::malformed(format!("h2c upgrade failed: {}", e)))?;
        tracing::debug!("Connection switched to h2c");

        let replay = h2c::replay_preface(&upgrade.settings, &upgrade.head);
        let io = h2c::ReplayIo::new(hyper_util::rt::TokioIo::new(upgraded), replay);
        let pipeline = self
            .assembler
            .http2(&ctx, NegotiatedProtocol::Http2Cleartext, AssemblyPhase::Upgrade)?;
        driver::serve_http2(io, pipeline, h2_shutdown).await;
        Ok(())
    }
}
