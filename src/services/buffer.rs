//! Output content buffer factory.
//!
//! # Responsibilities
//! - Fix the output content buffer size once, before listeners bind
//! - Hand out pre-sized buffers and the chunk size used by the chunked writer
//!
//! # Design Decisions
//! - Re-running setup with the same size is a no-op; a different size is an error
//! - The legacy string-map entry point keeps the `outputContentBufferSize` key

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::BytesMut;

use crate::config::ConfigError;

/// Parameter name accepted by [`BufferFactory::setup_from_parameters`].
pub const OUTPUT_CONTENT_BUFFER_SIZE: &str = "outputContentBufferSize";

#[derive(Debug, Default)]
pub struct BufferFactory {
    size: OnceLock<usize>,
}

impl BufferFactory {
    /// Create an unconfigured factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the buffer size.
    pub fn setup(&self, size: usize) -> Result<(), ConfigError> {
        if size == 0 {
            return Err(ConfigError::InvalidParameter {
                name: OUTPUT_CONTENT_BUFFER_SIZE.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let configured = *self.size.get_or_init(|| size);
        if configured == size {
            Ok(())
        } else {
            Err(ConfigError::BufferSize { configured, requested: size })
        }
    }

    /// Apply the legacy untyped parameter map. Unknown keys are logged and ignored.
    pub fn setup_from_parameters(&self, parameters: &HashMap<String, String>) -> Result<(), ConfigError> {
        for (key, value) in parameters {
            if key != OUTPUT_CONTENT_BUFFER_SIZE {
                tracing::warn!(parameter = %key, "Ignoring unknown transport parameter");
                continue;
            }
            let size = value.trim().parse::<usize>().map_err(|e| ConfigError::InvalidParameter {
                name: key.clone(),
                reason: e.to_string(),
            })?;
            self.setup(size)?;
        }
        Ok(())
    }

    /// Configured size, if setup has run.
    pub fn buffer_size(&self) -> Option<usize> {
        self.size.get().copied()
    }

    /// A buffer with the configured capacity (empty capacity before setup).
    pub fn allocate(&self) -> BytesMut {
        BytesMut::with_capacity(self.buffer_size().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_size_is_idempotent() {
        let factory = BufferFactory::new();
        factory.setup(8192).unwrap();
        factory.setup(8192).unwrap();
        assert_eq!(factory.buffer_size(), Some(8192));
        assert!(factory.allocate().capacity() >= 8192);
    }

    #[test]
    fn different_size_is_rejected() {
        let factory = BufferFactory::new();
        factory.setup(8192).unwrap();
        let err = factory.setup(4096).unwrap_err();
        assert!(matches!(err, ConfigError::BufferSize { configured: 8192, requested: 4096 }));
    }

    #[test]
    fn legacy_parameters_ignore_unknown_keys() {
        let factory = BufferFactory::new();
        let mut params = HashMap::new();
        params.insert(OUTPUT_CONTENT_BUFFER_SIZE.to_string(), "2048".to_string());
        params.insert("somethingElse".to_string(), "x".to_string());

        factory.setup_from_parameters(&params).unwrap();
        assert_eq!(factory.buffer_size(), Some(2048));
    }

    #[test]
    fn legacy_parameter_must_be_numeric() {
        let factory = BufferFactory::new();
        let mut params = HashMap::new();
        params.insert(OUTPUT_CONTENT_BUFFER_SIZE.to_string(), "big".to_string());
        assert!(factory.setup_from_parameters(&params).is_err());
        assert_eq!(factory.buffer_size(), None);
    }
}
