//! Listener registry: bound local port → listener configuration.
//!
//! # Responsibilities
//! - Hold exactly one configuration per port
//! - Serve lock-free lookups on every accepted connection
//!
//! # Design Decisions
//! - Copy-on-write map behind `ArcSwap`; writes only happen at bind/unbind
//! - Registering a port again replaces the previous configuration

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::ListenerConfiguration;

#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: ArcSwap<HashMap<u16, Arc<ListenerConfiguration>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `config` under its port. Returns the configuration it replaced.
    pub fn register(&self, config: ListenerConfiguration) -> Option<Arc<ListenerConfiguration>> {
        let config = Arc::new(config);
        let port = config.port;
        let previous = self.listeners.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(port, config.clone());
            next
        });

        let replaced = previous.get(&port).cloned();
        tracing::debug!(
            port,
            listener_id = %config.id,
            replaced = replaced.is_some(),
            "Listener registered"
        );
        replaced
    }

    /// Remove the configuration bound to `config.port`.
    pub fn unregister(&self, config: &ListenerConfiguration) -> Option<Arc<ListenerConfiguration>> {
        let port = config.port;
        let previous = self.listeners.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&port);
            next
        });

        let removed = previous.get(&port).cloned();
        if removed.is_some() {
            tracing::debug!(port, listener_id = %config.id, "Listener unregistered");
        }
        removed
    }

    pub fn lookup(&self, port: u16) -> Option<Arc<ListenerConfiguration>> {
        self.listeners.load().get(&port).cloned()
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered ports in ascending order.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.load().keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}
