//! Transport server.
//!
//! # Data Flow
//! ```text
//! TransportConfig
//!     → TransportServices (once) + SourceHandler
//!     → ChannelInitializer::register (per listener, TLS contexts built)
//!     → Listener::bind (all listeners, before any accept)
//!     → accept loop per listener
//!         → ChannelInitializer::init_channel (one task per connection)
//! ```
//!
//! # Design Decisions
//! - Every listener is bound before the first accept; one bind failure
//!   aborts startup
//! - Shutdown stops the accept loops, then waits for live connections to
//!   finish their in-flight exchanges

pub mod initializer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;

pub use initializer::ChannelInitializer;

use crate::config::{ListenerConfiguration, TransportConfig};
use crate::error::TransportError;
use crate::handler::{self, SourceHandler};
use crate::lifecycle::Shutdown;
use crate::net::listener::{Listener, ListenerError};
use crate::services::TransportServices;

/// Upper bound on waiting for connections after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept (e.g. descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct HttpTransport {
    config: TransportConfig,
    services: Arc<TransportServices>,
    initializer: Arc<ChannelInitializer>,
}

impl HttpTransport {
    /// Build services and the configured downstream handler, then register
    /// every listener.
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let services = Arc::new(TransportServices::new(&config.transport, config.request_size)?);
        let handler = handler::from_config(&config.handler, &services)?;
        Self::with_handler(config, services, handler)
    }

    /// Same as `new` with a caller-supplied downstream.
    pub fn with_handler(
        config: TransportConfig,
        services: Arc<TransportServices>,
        handler: Arc<dyn SourceHandler>,
    ) -> Result<Self, TransportError> {
        let initializer = Arc::new(ChannelInitializer::new(services.clone(), handler));
        for listener in &config.listeners {
            initializer.register(listener.clone())?;
        }
        Ok(Self { config, services, initializer })
    }

    pub fn services(&self) -> &Arc<TransportServices> {
        &self.services
    }

    pub fn initializer(&self) -> &Arc<ChannelInitializer> {
        &self.initializer
    }

    /// Bind all listeners and serve until `shutdown` fires.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), TransportError> {
        let mut bound = Vec::with_capacity(self.config.listeners.len());
        for config in &self.config.listeners {
            let listener = Listener::bind(config, &self.config.transport)
                .await
                .map_err(|e| bind_error(config, e))?;
            bound.push((config.id.clone(), listener));
        }

        tracing::info!(listeners = bound.len(), "Transport started");

        let mut accept_loops = JoinSet::new();
        for (listener_id, listener) in bound {
            accept_loops.spawn(accept_loop(
                listener_id,
                listener,
                self.initializer.clone(),
                shutdown.subscribe(),
            ));
        }

        while let Some(joined) = accept_loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Accept loop panicked");
            }
        }

        let tracker = self.initializer.tracker();
        tracing::info!(active_connections = tracker.active_count(), "Draining connections");
        if !tracker.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!(
                active_connections = tracker.active_count(),
                timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "Drain timed out"
            );
        }

        tracing::info!("Transport stopped");
        Ok(())
    }
}

fn bind_error(config: &ListenerConfiguration, e: ListenerError) -> TransportError {
    let addr = config
        .bind_address()
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], config.port)));
    let source = match e {
        ListenerError::Bind(io) | ListenerError::Accept(io) => io,
        ListenerError::Closed => std::io::Error::new(std::io::ErrorKind::Other, "listener closed"),
    };
    TransportError::Bind { addr, source }
}

async fn accept_loop(
    listener_id: String,
    listener: Listener,
    initializer: Arc<ChannelInitializer>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(listener_id = %listener_id, "Listener stopped accepting");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr, permit)) => {
                    let initializer = initializer.clone();
                    let connection_shutdown = shutdown.resubscribe();
                    tokio::spawn(async move {
                        initializer.init_channel(stream, remote_addr, connection_shutdown).await;
                        drop(permit);
                    });
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(listener_id = %listener_id, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}
