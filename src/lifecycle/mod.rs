//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → TransportServices → register listeners → bind → accept
//!
//! Shutdown (shutdown.rs):
//!     Ctrl-C → stop accepting → graceful close of live connections → exit
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;
