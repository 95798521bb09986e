//! Channel initializer.
//!
//! # Responsibilities
//! - Own the listener registry and the per-port TLS contexts
//! - On accept: resolve the listener by local port, pick the negotiation
//!   path, and hand the socket to the negotiator
//!
//! # Design Decisions
//! - Initialization runs once per connection; later bytes never come back here
//! - A socket whose port has no registered listener is closed without a response

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::config::{ConfigError, ListenerConfiguration};
use crate::error::{ErrorScope, TransportError};
use crate::handler::SourceHandler;
use crate::negotiation::{NegotiationPath, ProtocolNegotiator};
use crate::net::connection::{ConnectionContext, ConnectionId, ConnectionTracker};
use crate::net::registry::ListenerRegistry;
use crate::net::tls::TlsAcceptorCache;
use crate::pipeline::PipelineAssembler;
use crate::services::TransportServices;

pub struct ChannelInitializer {
    registry: ListenerRegistry,
    tls: Arc<TlsAcceptorCache>,
    negotiator: ProtocolNegotiator,
    tracker: ConnectionTracker,
}

impl ChannelInitializer {
    pub fn new(services: Arc<TransportServices>, handler: Arc<dyn SourceHandler>) -> Self {
        let tls = Arc::new(TlsAcceptorCache::new());
        let negotiator = ProtocolNegotiator::new(PipelineAssembler::new(services, handler), tls.clone());
        Self {
            registry: ListenerRegistry::new(),
            tls,
            negotiator,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Register a listener, building its TLS context first.
    pub fn register(&self, config: ListenerConfiguration) -> Result<(), ConfigError> {
        self.tls.prepare(&config)?;
        if let Some(previous) = self.registry.register(config) {
            tracing::info!(listener_id = %previous.id, port = previous.port, "Listener configuration replaced");
        }
        Ok(())
    }

    pub fn unregister(&self, config: &ListenerConfiguration) {
        if self.registry.unregister(config).is_some() {
            self.tls.remove(config.port);
        }
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Run one accepted connection to completion.
    pub async fn init_channel(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        shutdown: broadcast::Receiver<()>,
    ) {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!(peer_addr = %remote_addr, error = %e, "Socket closed before initialization");
                return;
            }
        };

        let Some(listener) = self.registry.lookup(local_addr.port()) else {
            tracing::warn!(
                port = local_addr.port(),
                peer_addr = %remote_addr,
                "No listener registered for port, closing connection"
            );
            return;
        };

        let id = ConnectionId::new();
        let _guard = self.tracker.track(id);
        let path = NegotiationPath::select(&listener);
        let span = tracing::debug_span!(
            "connection",
            connection_id = %id,
            listener_id = %listener.id,
            peer_addr = %remote_addr,
            path = ?path,
        );

        let ctx = ConnectionContext { id, listener, local_addr, remote_addr };
        let result = self.negotiator.negotiate(stream, ctx, shutdown).instrument(span.clone()).await;

        let _enter = span.enter();
        match result {
            Ok(()) => tracing::trace!("Connection finished"),
            Err(TransportError::Handshake(reason)) => tracing::debug!(%reason, "TLS handshake failed"),
            Err(e) if e.scope() == ErrorScope::Connection => tracing::warn!(error = %e, "Connection aborted"),
            Err(e) => tracing::error!(error = %e, "Connection failed"),
        }
    }
}
