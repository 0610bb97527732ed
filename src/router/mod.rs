//! Dynamic routing of RPC calls to registered backend connections.
//!
//! The [`Router`] keeps a registry of [`Service`]s and a table of routes mapping
//! `(service, key)` pairs to [`ClientConn`]s. A call is resolved in two steps:
//!
//! 1. [`Router::resolve_method`] turns a full method name into a [`ResolvedMethod`]. This only
//!    needs the name, so it happens up front.
//! 2. The method's [`ConnResolver`] picks the backend once the call's first message is known,
//!    extracting the routing key from it for key-routable services.
//!
//! ## Route precedence
//!
//! For a key-routable service `s` and key `k` the table is probed in the order
//! `(s, k)`, `("", k)`, `(s, "")`, `("", "")`. Unrouted services have no key, so only
//! `(s, "")` and `("", "")` are probed. The first registered route wins.
//!
//! ## Example
//!
//! ```ignore
//! let router = Router::default();
//!
//! let service = router.new_routed_service(pool.get_service_by_name("bms.PointService").unwrap())?;
//! router.add_service(service)?;
//! router.add_route("bms.PointService", "ahu-1", Arc::new(bacnet_conn))?;
//! router.add_route("", "", Arc::new(default_conn))?;
//!
//! let reply: ReadReply = router
//!     .loopback()
//!     .unary(&CallContext::new(), "/bms.PointService/Read", &ReadRequest { name: "ahu-1".into() })
//!     .await?;
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use parking_lot::RwLock;
use prost_reflect::{DescriptorPool, ServiceDescriptor};
use tonic::codegen::http;
use tonic::server::NamedService;
use tonic::service::Routes;
use tracing::info;

use crate::conn::local::in_process_channel;
use crate::conn::{ClientConn, GrpcConn};
use crate::error::RouterError;
use crate::handler::StreamHandler;
use crate::loopback::Loopback;

mod config;
mod method;
mod service;
mod table;

pub use config::{DEFAULT_KEY_FIELD, RouterConfig};
pub use method::{ConnResolver, ResolvedMethod, parse_method_name};
pub use service::{KeyFn, Service};
pub use table::RouteKey;

use self::table::Table;

/// Rewrites a routing key before the route table is probed.
///
/// Receives the service name and the extracted key.
pub type KeyInterceptor = Arc<dyn Fn(&str, String) -> String + Send + Sync>;

/// Registry of services and routes shared by every call it resolves.
///
/// Cloning a router is cheap and clones share the same tables.
#[derive(Clone)]
pub struct Router {
    table: Arc<RwLock<Table>>,
    key_interceptor: Option<KeyInterceptor>,
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            table: Arc::new(RwLock::new(Table::default())),
            key_interceptor: None,
            config,
        }
    }

    /// Install a function applied to every extracted key, e.g. to resolve aliases.
    pub fn with_key_interceptor<F>(mut self, intercept: F) -> Self
    where
        F: Fn(&str, String) -> String + Send + Sync + 'static,
    {
        self.key_interceptor = Some(Arc::new(intercept));
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Build a service routed on the configured key field.
    pub fn new_routed_service(&self, descriptor: ServiceDescriptor) -> Result<Service, RouterError> {
        Service::new_routed(descriptor, &self.config.key_field)
    }

    /// Register `service` under its fully-qualified name.
    pub fn add_service(&self, service: Service) -> Result<(), RouterError> {
        let name = service.name().to_string();
        let routed = service.is_routed();
        self.table.write().add_service(service)?;

        info!(service = %name, routed, "Registered service");
        Ok(())
    }

    /// Remove a service, returning whether it was registered.
    ///
    /// Routes naming the service are kept, but calls to it no longer resolve.
    pub fn delete_service(&self, name: &str) -> bool {
        let existed = self.table.write().delete_service(name);
        if existed {
            info!(service = %name, "Removed service");
        }
        existed
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.table.read().service(name)
    }

    /// Names of all registered services, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<_> = self.table.read().service_names().map(str::to_string).collect();
        names.sort_unstable();
        names
    }

    /// Route calls matching `(service, key)` to `target`.
    ///
    /// An empty `service` or `key` is a wildcard. A non-empty `service` must already be
    /// registered, and an existing route for the same pair is never replaced.
    pub fn add_route(
        &self,
        service: impl Into<String>,
        key: impl Into<String>,
        target: Arc<dyn ClientConn>,
    ) -> Result<(), RouterError> {
        let route = RouteKey::new(service, key);
        self.table.write().add_route(route.clone(), target)?;

        info!(route = %route, "Added route");
        Ok(())
    }

    /// Remove the route for `(service, key)`, returning whether it existed.
    pub fn delete_route(&self, service: &str, key: &str) -> bool {
        let route = RouteKey::new(service, key);
        let existed = self.table.write().delete_route(&route);
        if existed {
            info!(route = %route, "Removed route");
        }
        existed
    }

    /// All registered routes, sorted.
    pub fn routes(&self) -> Vec<RouteKey> {
        let mut routes: Vec<_> = self.table.read().route_keys().cloned().collect();
        routes.sort_unstable();
        routes
    }

    /// Look up the method named by `full_method` (`/{service}/{method}`).
    ///
    /// The returned [`ResolvedMethod`] has not chosen a connection yet; see [`ConnResolver`].
    pub fn resolve_method(&self, full_method: &str) -> Result<ResolvedMethod, RouterError> {
        let (service_name, method_name) = parse_method_name(full_method)?;

        let service = self
            .get_service(service_name)
            .ok_or_else(|| RouterError::UnknownService(service_name.to_string()))?;

        let descriptor =
            service
                .method(method_name)
                .ok_or_else(|| RouterError::UnknownMethod {
                    service: service_name.to_string(),
                    method: method_name.to_string(),
                })?;

        let resolver = ConnResolver::new(
            Arc::clone(&self.table),
            service,
            method_name.to_string(),
            self.key_interceptor.clone(),
        );

        Ok(ResolvedMethod {
            descriptor,
            resolver,
        })
    }

    /// A client connection that routes every call through this router.
    pub fn loopback(&self) -> Loopback {
        Loopback::new(self.clone())
    }

    /// A server handler that routes every call it receives through this router.
    pub fn stream_handler(&self) -> StreamHandler {
        StreamHandler::new(self.clone())
    }

    /// Host a tonic-generated `server` in-process and route all calls to its service to it.
    ///
    /// The service is looked up in `pool` by the server's name, registered unrouted, and given a
    /// single `(service, "")` route. Must be called from within a tokio runtime.
    pub fn register_local<S>(&self, pool: &DescriptorPool, server: S) -> Result<(), RouterError>
    where
        S: tower::Service<http::Request<tonic::body::Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        let name = S::NAME;
        let descriptor = pool
            .get_service_by_name(name)
            .ok_or_else(|| RouterError::MissingDescriptor(name.to_string()))?;

        let conn: Arc<dyn ClientConn> =
            Arc::new(GrpcConn::new(in_process_channel(Routes::new(server))));

        let mut table = self.table.write();
        table.add_service(Service::new_unrouted(descriptor))?;
        if let Err(e) = table.add_route(RouteKey::new(name, ""), conn) {
            table.delete_service(name);
            return Err(e);
        }
        drop(table);

        info!(service = %name, "Registered in-process service");
        Ok(())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeConn, get_request, pool, served_by, service};

    fn routed_router() -> (Router, DescriptorPool) {
        let pool = pool();
        let router = Router::default();
        router
            .add_service(router.new_routed_service(service(&pool, "test.Foo")).unwrap())
            .unwrap();
        (router, pool)
    }

    fn resolve(
        router: &Router,
        pool: &DescriptorPool,
        path: &str,
        key: &str,
    ) -> Result<String, RouterError> {
        let method = router.resolve_method(path)?;
        let request = get_request(pool, key);
        let conn = method.resolver.resolve(&request)?;
        Ok(served_by(&conn, &method.descriptor, request))
    }

    #[test]
    fn test_add_service_rejects_duplicates() {
        let (router, pool) = routed_router();

        let err = router
            .add_service(Service::new_unrouted(service(&pool, "test.Foo")))
            .unwrap_err();

        assert_eq!(err, RouterError::ServiceExists("test.Foo".into()));
        assert!(router.get_service("test.Foo").unwrap().is_routed());
    }

    #[test]
    fn test_delete_service_keeps_routes() {
        let (router, _pool) = routed_router();
        router.add_route("test.Foo", "", FakeConn::new("a")).unwrap();

        assert!(router.delete_service("test.Foo"));
        assert!(!router.delete_service("test.Foo"));
        assert!(router.get_service("test.Foo").is_none());
        assert_eq!(router.routes(), vec![RouteKey::new("test.Foo", "")]);
        assert_eq!(
            router.resolve_method("/test.Foo/Get").unwrap_err(),
            RouterError::UnknownService("test.Foo".into())
        );
    }

    #[test]
    fn test_add_route_requires_known_service() {
        let (router, _pool) = routed_router();

        assert_eq!(
            router.add_route("test.Bar", "x", FakeConn::new("a")).unwrap_err(),
            RouterError::UnknownService("test.Bar".into())
        );
        assert!(router.add_route("", "x", FakeConn::new("a")).is_ok());
    }

    #[test]
    fn test_duplicate_route_keeps_first_target() {
        let (router, pool) = routed_router();
        router.add_route("test.Foo", "x", FakeConn::new("first")).unwrap();

        let err = router
            .add_route("test.Foo", "x", FakeConn::new("second"))
            .unwrap_err();

        assert_eq!(err, RouterError::RouteExists(RouteKey::new("test.Foo", "x")));
        assert_eq!(resolve(&router, &pool, "/test.Foo/Get", "x").unwrap(), "first");
    }

    #[test]
    fn test_delete_route_is_idempotent() {
        let (router, _pool) = routed_router();
        router.add_route("test.Foo", "x", FakeConn::new("a")).unwrap();

        assert!(router.delete_route("test.Foo", "x"));
        assert!(!router.delete_route("test.Foo", "x"));
        assert!(router.routes().is_empty());
    }

    #[test]
    fn test_precedence_over_every_subset_of_tiers() {
        let tiers = [("test.Foo", "x"), ("", "x"), ("test.Foo", ""), ("", "")];

        for mask in 0u8..16 {
            let (router, pool) = routed_router();
            for (tier, (service, key)) in tiers.iter().enumerate() {
                if mask & (1 << tier) != 0 {
                    router
                        .add_route(*service, *key, FakeConn::new(&format!("tier{tier}")))
                        .unwrap();
                }
            }

            let expected = (0..tiers.len())
                .find(|tier| mask & (1 << tier) != 0)
                .map(|tier| format!("tier{tier}"));
            let actual = resolve(&router, &pool, "/test.Foo/Get", "x").ok();

            assert_eq!(actual, expected, "routes registered with mask {mask:04b}");
        }
    }

    #[test]
    fn test_unrouted_service_ignores_keyed_routes() {
        let pool = pool();
        let router = Router::default();
        router
            .add_service(Service::new_unrouted(service(&pool, "test.Foo")))
            .unwrap();
        router.add_route("test.Foo", "x", FakeConn::new("keyed")).unwrap();
        router.add_route("", "x", FakeConn::new("any-keyed")).unwrap();

        assert!(matches!(
            resolve(&router, &pool, "/test.Foo/Get", "x"),
            Err(RouterError::NotFound { key: None, .. })
        ));

        router.add_route("", "", FakeConn::new("default")).unwrap();
        assert_eq!(resolve(&router, &pool, "/test.Foo/Get", "x").unwrap(), "default");

        router.add_route("test.Foo", "", FakeConn::new("service")).unwrap();
        assert_eq!(resolve(&router, &pool, "/test.Foo/Get", "x").unwrap(), "service");
    }

    #[test]
    fn test_scenario_keyed_route_with_default() {
        let (router, pool) = routed_router();
        router.add_route("test.Foo", "x", FakeConn::new("connA")).unwrap();
        router.add_route("", "", FakeConn::new("connDefault")).unwrap();

        assert_eq!(resolve(&router, &pool, "/test.Foo/Get", "x").unwrap(), "connA");
        assert_eq!(resolve(&router, &pool, "/test.Foo/Get", "y").unwrap(), "connDefault");
    }

    #[test]
    fn test_scenario_unregistered_service_is_unimplemented() {
        let (router, _pool) = routed_router();
        router.add_route("test.Foo", "", FakeConn::new("connA")).unwrap();

        let err = router.resolve_method("/test.Bar/Get").unwrap_err();

        assert_eq!(err, RouterError::UnknownService("test.Bar".into()));
        assert_eq!(tonic::Status::from(err).code(), tonic::Code::Unimplemented);
    }

    #[test]
    fn test_resolve_method_errors() {
        let (router, _pool) = routed_router();

        assert_eq!(
            router.resolve_method("test.Foo/Get").unwrap_err(),
            RouterError::MissingMethod("test.Foo/Get".into())
        );
        assert_eq!(
            router.resolve_method("/test.Foo/Nope").unwrap_err(),
            RouterError::UnknownMethod {
                service: "test.Foo".into(),
                method: "Nope".into()
            }
        );

        let method = router.resolve_method("/test.Foo/Watch").unwrap();
        assert!(method.descriptor.is_server_streaming());
    }

    #[test]
    fn test_resolution_sees_routes_added_after_resolve_method() {
        let (router, pool) = routed_router();
        let method = router.resolve_method("/test.Foo/Get").unwrap();

        assert!(method.resolver.resolve(&get_request(&pool, "x")).is_err());

        router.add_route("test.Foo", "x", FakeConn::new("late")).unwrap();
        let conn = method.resolver.resolve(&get_request(&pool, "x")).unwrap();
        assert_eq!(served_by(&conn, &method.descriptor, get_request(&pool, "x")), "late");
    }

    #[test]
    fn test_key_interceptor_rewrites_keys() {
        let pool = pool();
        let router = Router::default().with_key_interceptor(|_service, key| {
            if key == "AHU-1" { "ahu-1".to_string() } else { key }
        });
        router
            .add_service(router.new_routed_service(service(&pool, "test.Foo")).unwrap())
            .unwrap();
        router.add_route("test.Foo", "ahu-1", FakeConn::new("ahu")).unwrap();

        assert_eq!(resolve(&router, &pool, "/test.Foo/Get", "AHU-1").unwrap(), "ahu");
    }

    #[test]
    fn test_configured_key_field() {
        let pool = pool();
        let router = Router::new(RouterConfig::builder().key_field("value".to_string()).build());

        let err = router
            .new_routed_service(service(&pool, "test.Foo"))
            .unwrap_err();

        assert!(matches!(err, RouterError::KeyField { ref field, .. } if field == "value"));
        assert_eq!(Router::default().config().key_field, DEFAULT_KEY_FIELD);
    }

    #[test]
    fn test_services_are_listed_sorted() {
        let (router, pool) = routed_router();
        router
            .add_service(Service::new_unrouted(service(&pool, "test.Lister")))
            .unwrap();

        assert_eq!(router.services(), vec!["test.Foo", "test.Lister"]);
    }
}
