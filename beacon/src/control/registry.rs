//! Routing table from qualified signal names to delivery callbacks.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::types::{Delivery, qualified_name};

/// Named routing shared between the application and a named server.
///
/// Cloning yields another handle to the same table. Reads come from
/// negotiation on the accept thread; writes come from the application at any
/// time, including after the server is open.
pub struct SignalRegistry<T> {
    routes: Arc<RwLock<HashMap<String, Delivery<T>>>>,
}

impl<T> SignalRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Routes `domain.signal` to `delivery`, replacing any previous route.
    pub fn register(&self, domain: &str, signal: &str, delivery: Delivery<T>) {
        self.register_qualified(qualified_name(domain, signal), delivery);
    }

    /// Routes an already-qualified name to `delivery`.
    pub fn register_qualified(&self, name: impl Into<String>, delivery: Delivery<T>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), delivery);
    }

    /// Removes a route. Connections already negotiated keep their callback.
    pub fn unregister(&self, name: &str) -> Option<Delivery<T>> {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Delivery<T>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for SignalRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            routes: Arc::clone(&self.routes),
        }
    }
}

impl<T> Default for SignalRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
