use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use crate::conn::ClientConn;
use crate::error::RouterError;
use crate::router::service::Service;

/// The (service, key) pair a route is registered under.
///
/// An empty service matches every service, an empty key matches every key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub service: String,
    pub key: String,
}

impl RouteKey {
    pub fn new(service: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {:?})", self.service, self.key)
    }
}

/// Registered services and routes. Guarded as a whole by the router's lock.
#[derive(Default)]
pub(crate) struct Table {
    services: HashMap<String, Arc<Service>, ahash::RandomState>,
    routes: HashMap<RouteKey, Arc<dyn ClientConn>, ahash::RandomState>,
}

impl Table {
    pub(crate) fn add_service(&mut self, service: Service) -> Result<(), RouterError> {
        match self.services.entry(service.name().to_string()) {
            Entry::Occupied(entry) => Err(RouterError::ServiceExists(entry.key().clone())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    pub(crate) fn delete_service(&mut self, name: &str) -> bool {
        self.services.remove(name).is_some()
    }

    pub(crate) fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).cloned()
    }

    pub(crate) fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub(crate) fn add_route(
        &mut self,
        route: RouteKey,
        target: Arc<dyn ClientConn>,
    ) -> Result<(), RouterError> {
        if !route.service.is_empty() && !self.services.contains_key(&route.service) {
            return Err(RouterError::UnknownService(route.service));
        }

        match self.routes.entry(route) {
            Entry::Occupied(entry) => Err(RouterError::RouteExists(entry.key().clone())),
            Entry::Vacant(slot) => {
                slot.insert(target);
                Ok(())
            }
        }
    }

    pub(crate) fn delete_route(&mut self, route: &RouteKey) -> bool {
        self.routes.remove(route).is_some()
    }

    pub(crate) fn route_keys(&self) -> impl Iterator<Item = &RouteKey> {
        self.routes.keys()
    }

    /// Find the most specific route for a call to `service`.
    ///
    /// Keyed calls probe `(service, key)`, `("", key)`, `(service, "")`, `("", "")` in that
    /// order; calls without a key only probe the last two.
    pub(crate) fn lookup(&self, service: &str, key: Option<&str>) -> Option<Arc<dyn ClientConn>> {
        let keyed = key.into_iter().flat_map(|key| [(service, key), ("", key)]);
        let unkeyed = [(service, ""), ("", "")];

        keyed
            .chain(unkeyed)
            .find_map(|(service, key)| self.routes.get(&RouteKey::new(service, key)))
            .cloned()
    }
}
