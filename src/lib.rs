//! HTTP transport front-end.
//!
//! Accepts HTTP/1.1 and HTTP/2 (ALPN over TLS, or cleartext via `Upgrade: h2c`)
//! on configured listeners, enforces header and body size limits, and hands
//! each request to a `SourceHandler`.

// Configuration and shared services
pub mod config;
pub mod error;
pub mod services;

// Connection path
pub mod negotiation;
pub mod net;
pub mod pipeline;
pub mod server;

// Messages and downstream
pub mod handler;
pub mod http;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::TransportConfig;
pub use error::TransportError;
pub use lifecycle::Shutdown;
pub use server::HttpTransport;
