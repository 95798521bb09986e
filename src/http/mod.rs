//! HTTP message handling subsystem.
//!
//! # Data Flow
//! ```text
//! hyper request (h1 or h2)
//!     → body.rs (type-erased body shared by every stage)
//!     → pipeline stages
//!     → adapter.rs (IncomingRequest with request ID, downstream dispatch)
//!     → message.rs (OutgoingResponse back to the codec)
//!     → headers.rs (hop-by-hop filtering where a hop is crossed)
//! ```

pub mod adapter;
pub mod body;
pub mod headers;
pub mod message;

pub use adapter::SourceAdapter;
pub use message::{IncomingRequest, OutgoingResponse, RequestBody, RequestId, ResponseBody};
