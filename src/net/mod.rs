//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bound socket, connection limit)
//!     → registry.rs (port → listener configuration)
//!     → tls.rs (TLS context for the port, if any)
//!     → connection.rs (id, context, live-connection tracking)
//!     → negotiation
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS material is loaded at registration, never per connection

pub mod connection;
pub mod listener;
pub mod registry;
pub mod tls;
