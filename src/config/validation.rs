//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ports, sizes, water marks)
//! - Check TLS settings are coherent with the listener scheme
//! - Detect duplicate listener ports and ids
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use hyper::Uri;

use crate::config::schema::{
    ClientAuth, HandlerKind, ListenerConfiguration, RequestSizeValidationConfiguration, Scheme,
    TransportConfig,
};

/// A single semantic problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut ports = HashSet::new();
    let mut ids = HashSet::new();

    for (i, listener) in config.listeners.iter().enumerate() {
        let prefix = format!("listeners[{}]", i);
        validate_listener(&prefix, listener, &mut errors);

        if listener.port != 0 && !ports.insert(listener.port) {
            errors.push(ValidationError::new(
                format!("{}.port", prefix),
                format!("port {} is used by more than one listener", listener.port),
            ));
        }
        if !ids.insert(listener.id.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.id", prefix),
                format!("duplicate listener id '{}'", listener.id),
            ));
        }
    }

    validate_request_size("request_size", &config.request_size, &mut errors);

    let transport = &config.transport;
    if transport.output_content_buffer_size == 0 {
        errors.push(ValidationError::new(
            "transport.output_content_buffer_size",
            "must be greater than zero",
        ));
    }
    if transport.downstream_low_water_mark >= transport.downstream_high_water_mark {
        errors.push(ValidationError::new(
            "transport.downstream_low_water_mark",
            "must be lower than downstream_high_water_mark",
        ));
    }
    if transport.max_active_requests == 0 {
        errors.push(ValidationError::new("transport.max_active_requests", "must be greater than zero"));
    }

    if config.handler.kind == HandlerKind::Forward {
        match config.handler.upstream.as_deref().map(str::parse::<Uri>) {
            Some(Ok(uri)) if uri.scheme_str() == Some("http") && uri.authority().is_some() => {}
            Some(_) => errors.push(ValidationError::new(
                "handler.upstream",
                "must be an absolute http:// URI",
            )),
            None => errors.push(ValidationError::new(
                "handler.upstream",
                "required when handler.kind = \"forward\"",
            )),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(prefix: &str, listener: &ListenerConfiguration, errors: &mut Vec<ValidationError>) {
    if listener.port == 0 {
        errors.push(ValidationError::new(format!("{}.port", prefix), "must be in 1..=65535"));
    }
    if listener.id.trim().is_empty() {
        errors.push(ValidationError::new(format!("{}.id", prefix), "must not be empty"));
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::new(format!("{}.max_connections", prefix), "must be greater than zero"));
    }

    match (&listener.scheme, &listener.ssl_config) {
        (Scheme::Https, None) => errors.push(ValidationError::new(
            format!("{}.scheme", prefix),
            "https requires ssl_config",
        )),
        (Scheme::Http, Some(_)) => errors.push(ValidationError::new(
            format!("{}.scheme", prefix),
            "ssl_config requires scheme = \"https\"",
        )),
        _ => {}
    }

    if listener.http2_tls && listener.ssl_config.is_none() {
        errors.push(ValidationError::new(
            format!("{}.http2_tls", prefix),
            "requires ssl_config; cleartext listeners negotiate h2c by upgrade",
        ));
    }

    if let Some(ssl) = &listener.ssl_config {
        if ssl.client_auth != ClientAuth::None && ssl.trust_store_path.is_none() {
            errors.push(ValidationError::new(
                format!("{}.ssl_config.trust_store_path", prefix),
                "required when client_auth is enabled",
            ));
        }
    }

    if let Some(size) = &listener.request_size {
        validate_request_size(&format!("{}.request_size", prefix), size, errors);
    }
}

fn validate_request_size(
    prefix: &str,
    size: &RequestSizeValidationConfiguration,
    errors: &mut Vec<ValidationError>,
) {
    if size.header_size_validation && size.max_header_size == 0 {
        errors.push(ValidationError::new(format!("{}.max_header_size", prefix), "must be greater than zero"));
    }
    if size.request_size_validation && size.max_request_size == 0 {
        errors.push(ValidationError::new(format!("{}.max_request_size", prefix), "must be greater than zero"));
    }
}
