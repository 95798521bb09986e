//! Process-wide transport services.
//!
//! # Data Flow
//! ```text
//! TransportProperties + RequestSizeValidationConfiguration
//!     → TransportServices::new (once, before any listener binds)
//!         → buffer.rs (output content buffer size)
//!         → connection_manager.rs (outbound pool)
//!         → queue.rs (downstream water marks)
//!     → Arc<TransportServices> threaded through every channel initializer
//! ```
//!
//! # Design Decisions
//! - One immutable record instead of global singletons; tests build their own
//! - The connection manager is created here and never re-created

pub mod buffer;
pub mod connection_manager;
pub mod queue;

use std::collections::HashMap;
use std::sync::Arc;

pub use buffer::BufferFactory;
pub use connection_manager::{ConnectionManager, OutboundError, OutboundGuard};
pub use queue::{DownstreamQueue, QueueSlot};

use crate::config::{ConfigError, RequestSizeValidationConfiguration, TransportProperties};

#[derive(Debug)]
pub struct TransportServices {
    buffer_factory: BufferFactory,
    request_size: RequestSizeValidationConfiguration,
    connection_manager: Arc<ConnectionManager>,
    downstream_queue: Arc<DownstreamQueue>,
}

impl TransportServices {
    pub fn new(
        properties: &TransportProperties,
        request_size: RequestSizeValidationConfiguration,
    ) -> Result<Self, ConfigError> {
        let buffer_factory = BufferFactory::new();
        buffer_factory.setup(properties.output_content_buffer_size)?;

        Ok(Self {
            buffer_factory,
            request_size,
            connection_manager: Arc::new(ConnectionManager::new(properties)),
            downstream_queue: Arc::new(DownstreamQueue::new(
                properties.downstream_high_water_mark,
                properties.downstream_low_water_mark,
            )),
        })
    }

    /// Re-apply legacy `setup` parameters; only a matching buffer size is accepted.
    pub fn setup(&self, parameters: &HashMap<String, String>) -> Result<(), ConfigError> {
        self.buffer_factory.setup_from_parameters(parameters)
    }

    pub fn buffer_factory(&self) -> &BufferFactory {
        &self.buffer_factory
    }

    /// Largest DATA slice the chunked writer emits.
    pub fn output_content_buffer_size(&self) -> usize {
        self.buffer_factory.buffer_size().unwrap_or(16 * 1024)
    }

    pub fn request_size(&self) -> RequestSizeValidationConfiguration {
        self.request_size
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connection_manager
    }

    pub fn downstream_queue(&self) -> &Arc<DownstreamQueue> {
        &self.downstream_queue
    }
}

impl Default for TransportServices {
    fn default() -> Self {
        let properties = TransportProperties::default();
        let buffer_factory = BufferFactory::new();
        let _ = buffer_factory.setup(properties.output_content_buffer_size);
        Self {
            buffer_factory,
            request_size: RequestSizeValidationConfiguration::default(),
            connection_manager: Arc::new(ConnectionManager::new(&properties)),
            downstream_queue: Arc::new(DownstreamQueue::new(
                properties.downstream_high_water_mark,
                properties.downstream_low_water_mark,
            )),
        }
    }
}
