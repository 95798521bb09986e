//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the transport.
//! All types derive Serde traits for deserialization from config files.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the transport front-end.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Listener definitions, one per bound port.
    pub listeners: Vec<ListenerConfiguration>,

    /// Process-wide transport properties.
    pub transport: TransportProperties,

    /// Process-wide request size validation.
    pub request_size: RequestSizeValidationConfiguration,

    /// Downstream handler selection.
    pub handler: HandlerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// URI scheme served by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Configuration of a single listener, keyed by port.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfiguration {
    /// Identifier used in logs and on downstream requests.
    pub id: String,

    /// Interface to bind (e.g., "0.0.0.0").
    pub host: String,

    /// Port to bind; primary key in the listener registry.
    pub port: u16,

    pub scheme: Scheme,

    /// Present iff the listener terminates TLS.
    pub ssl_config: Option<SslConfig>,

    /// Negotiate HTTP/2 over TLS with ALPN. Ignored without `ssl_config`.
    pub http2_tls: bool,

    /// Allow HTTP/1.1 persistent connections.
    pub keep_alive: bool,

    /// Bound on TLS handshake and request head reads, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Per-listener override of the process-wide size validation.
    pub request_size: Option<RequestSizeValidationConfiguration>,
}

impl Default for ListenerConfiguration {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            scheme: Scheme::Http,
            ssl_config: None,
            http2_tls: false,
            keep_alive: true,
            connect_timeout_ms: 15_000,
            max_connections: 10_000,
            request_size: None,
        }
    }
}

impl ListenerConfiguration {
    /// Address string suitable for binding. IPv6 literals are bracketed.
    pub fn bind_address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn is_tls(&self) -> bool {
        self.ssl_config.is_some()
    }
}

/// Client certificate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    #[default]
    None,
    Optional,
    Require,
}

/// TLS configuration for a listener.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SslConfig {
    /// Path to certificate chain (PEM).
    pub cert_path: String,

    /// Path to private key (PEM).
    pub key_path: String,

    /// Cipher suite names (e.g., "TLS13_AES_128_GCM_SHA256"). Empty = provider defaults.
    #[serde(default)]
    pub cipher_suites: Vec<String>,

    /// Protocol versions ("TLSv1.2", "TLSv1.3"). Empty = safe defaults.
    #[serde(default)]
    pub protocols: Vec<String>,

    #[serde(default)]
    pub client_auth: ClientAuth,

    /// CA bundle (PEM) used to verify client certificates.
    #[serde(default)]
    pub trust_store_path: Option<String>,
}

/// Header and body size policing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestSizeValidationConfiguration {
    pub header_size_validation: bool,
    pub max_header_size: usize,
    pub request_size_validation: bool,
    pub max_request_size: usize,
}

impl Default for RequestSizeValidationConfiguration {
    fn default() -> Self {
        Self {
            header_size_validation: false,
            max_header_size: 8 * 1024,
            request_size_validation: false,
            max_request_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Properties consumed once at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportProperties {
    /// Largest DATA slice written by the chunked writer.
    #[serde(alias = "outputContentBufferSize")]
    pub output_content_buffer_size: usize,

    /// Idle outbound connections kept per upstream host.
    pub max_idle_per_host: usize,

    /// Idle outbound connections are closed after this many seconds.
    pub pool_idle_timeout_secs: u64,

    /// Outbound connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    pub tcp_nodelay: bool,
    pub so_keepalive: bool,
    pub so_reuseaddr: bool,

    /// Concurrent outbound requests before the pool reports saturation.
    pub max_active_requests: usize,

    /// Queued downstream requests at which inbound dispatch pauses.
    pub downstream_high_water_mark: usize,

    /// Queue depth at which paused dispatch resumes.
    pub downstream_low_water_mark: usize,
}

impl Default for TransportProperties {
    fn default() -> Self {
        Self {
            output_content_buffer_size: 16 * 1024,
            max_idle_per_host: 32,
            pool_idle_timeout_secs: 90,
            connect_timeout_ms: 15_000,
            tcp_nodelay: true,
            so_keepalive: true,
            so_reuseaddr: true,
            max_active_requests: 1024,
            downstream_high_water_mark: 1024,
            downstream_low_water_mark: 512,
        }
    }
}

/// Which bundled downstream handler the binary wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    #[default]
    Echo,
    Forward,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HandlerConfig {
    pub kind: HandlerKind,

    /// Base URI for the forwarding handler (e.g., "http://127.0.0.1:9000").
    pub upstream: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
