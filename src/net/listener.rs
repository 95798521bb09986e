//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind a configured listener with the transport socket options
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Graceful handling of accept errors

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;

use crate::config::{ListenerConfiguration, TransportProperties};

const BACKLOG: u32 = 1024;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Failed to accept: {0}")]
    Accept(#[source] std::io::Error),

    /// The connection limit semaphore was closed.
    #[error("Listener closed")]
    Closed,
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    nodelay: bool,
}

impl Listener {
    /// Bind to the listener's address with the transport socket options.
    pub async fn bind(
        config: &ListenerConfiguration,
        properties: &TransportProperties,
    ) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .bind_address()
            .parse()
            .map_err(|e| ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let socket = (if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() })
            .map_err(ListenerError::Bind)?;
        socket.set_reuseaddr(properties.so_reuseaddr).map_err(ListenerError::Bind)?;
        socket.set_keepalive(properties.so_keepalive).map_err(ListenerError::Bind)?;
        socket.bind(addr).map_err(ListenerError::Bind)?;
        let listener = socket.listen(BACKLOG).map_err(ListenerError::Bind)?;

        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            listener_id = %config.id,
            address = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            nodelay: properties.tcp_nodelay,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        if let Err(e) = stream.set_nodelay(self.nodelay) {
            tracing::debug!(peer_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_bound_concurrent_connections() {
        let config = ListenerConfiguration {
            host: "127.0.0.1".into(),
            port: 18181,
            max_connections: 1,
            ..Default::default()
        };
        let listener = Listener::bind(&config, &TransportProperties::default()).await.unwrap();
        assert_eq!(listener.max_connections(), 1);

        let _client = TcpStream::connect("127.0.0.1:18181").await.unwrap();
        let (_stream, _addr, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 0);

        drop(permit);
        assert_eq!(listener.available_permits(), 1);
    }

    #[test]
    fn errors_keep_their_io_source() {
        use std::error::Error;

        let err = ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"));
        assert_eq!(err.to_string(), "Failed to bind: in use");
        assert!(err.source().is_some());
        assert!(ListenerError::Closed.source().is_none());
    }
}
