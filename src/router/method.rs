use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use tracing::debug;

use crate::conn::ClientConn;
use crate::error::RouterError;
use crate::router::KeyInterceptor;
use crate::router::service::Service;
use crate::router::table::Table;

/// Split a full method name of the form `/{service}/{method}`.
pub fn parse_method_name(full_method: &str) -> Result<(&str, &str), RouterError> {
    full_method
        .strip_prefix('/')
        .and_then(|rest| rest.split_once('/'))
        .filter(|(service, method)| {
            !service.is_empty() && !method.is_empty() && !method.contains('/')
        })
        .ok_or_else(|| RouterError::MissingMethod(full_method.to_string()))
}

/// The outcome of [`Router::resolve_method`](crate::router::Router::resolve_method).
///
/// Carries the method's descriptor and a [`ConnResolver`] bound to it. Nothing about the
/// backend has been decided yet.
#[derive(Clone, Debug)]
pub struct ResolvedMethod {
    pub descriptor: MethodDescriptor,
    pub resolver: ConnResolver,
}

/// Picks the backend connection for a call once its first message is known.
#[derive(Clone)]
pub struct ConnResolver {
    table: Arc<RwLock<Table>>,
    service: Arc<Service>,
    method: String,
    key_interceptor: Option<KeyInterceptor>,
}

impl ConnResolver {
    pub(crate) fn new(
        table: Arc<RwLock<Table>>,
        service: Arc<Service>,
        method: String,
        key_interceptor: Option<KeyInterceptor>,
    ) -> Self {
        Self {
            table,
            service,
            method,
            key_interceptor,
        }
    }

    /// Resolve the connection serving a call whose first message is `message`.
    pub fn resolve(&self, message: &DynamicMessage) -> Result<Arc<dyn ClientConn>, RouterError> {
        let service = self.service.name();
        let key = match self.service.key_fn(&self.method) {
            Some(key_fn) => {
                let key = key_fn(message)?;
                Some(match &self.key_interceptor {
                    Some(intercept) => intercept(service, key),
                    None => key,
                })
            }
            None => None,
        };

        let conn = self.table.read().lookup(service, key.as_deref());

        debug!(
            service = %service,
            method = %self.method,
            key = ?key,
            found = conn.is_some(),
            "Resolved connection"
        );

        conn.ok_or_else(|| RouterError::NotFound {
            service: service.to_string(),
            key,
        })
    }
}

impl fmt::Debug for ConnResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnResolver")
            .field("service", &self.service.name())
            .field("method", &self.method)
            .finish()
    }
}
