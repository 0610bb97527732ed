use std::sync::Arc;

use anyhow::{Context, Result};
use device_router::conn::{ChannelConfig, GrpcConn};
use device_router::handler::TracingInterceptor;
use device_router::{Router, RouterConfig, Service};
use prost_reflect::DescriptorPool;
use tonic::transport::Server;
use tracing::{info, warn};

const LISTEN_ADDR: &str = "[::1]:50051";
const DEFAULT_BACKEND: &str = "http://[::1]:50052";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let descriptor_path =
        std::env::var("DESCRIPTOR_SET").context("DESCRIPTOR_SET must name a descriptor set file")?;
    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| LISTEN_ADDR.to_string());
    let backend = std::env::var("DEFAULT_BACKEND").unwrap_or_else(|_| DEFAULT_BACKEND.to_string());

    let mut config = RouterConfig::default();
    if let Ok(key_field) = std::env::var("KEY_FIELD") {
        config.key_field = key_field;
    }

    let bytes = std::fs::read(&descriptor_path)
        .with_context(|| format!("failed to read {descriptor_path}"))?;
    let pool = DescriptorPool::decode(bytes.as_slice())?;

    let router = Router::new(config);
    for descriptor in pool.services() {
        let name = descriptor.full_name().to_string();
        let service = match router.new_routed_service(descriptor.clone()) {
            Ok(service) => service,
            Err(e) => {
                warn!(service = %name, error = %e, "Service is not key-routable, routing by service only");
                Service::new_unrouted(descriptor)
            }
        };
        router.add_service(service)?;
    }

    let default_conn = GrpcConn::connect(
        &ChannelConfig::builder()
            .endpoint(backend.clone())
            .lazy(true)
            .build(),
    )
    .await?;
    router.add_route("", "", Arc::new(default_conn))?;

    info!(address = %listen_addr, backend = %backend, "Gateway starting");

    let routes = router
        .stream_handler()
        .with_interceptor(TracingInterceptor::new(router.config().key_field.clone()))
        .into_routes();

    Server::builder()
        .add_routes(routes)
        .serve(listen_addr.parse()?)
        .await?;

    Ok(())
}
