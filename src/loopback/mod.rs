//! A client connection that resolves every call through the [`Router`].
//!
//! Unary calls are routed as soon as they are made since the request is at hand. Streams are
//! handed out immediately as [`DeferredStream`]s and only routed once their first message is
//! sent.

use prost_reflect::{DynamicMessage, MethodDescriptor, ReflectMessage};
use tonic::Status;
use tracing::debug;

use crate::conn::{
    AnyMessage, CallContext, ClientConn, ClientStream, into_message, method_path, typed_message,
};
use crate::router::Router;

mod deferred;

pub use deferred::DeferredStream;

/// [`ClientConn`] whose backends are chosen by a [`Router`].
#[derive(Clone)]
pub struct Loopback {
    router: Router,
}

impl Loopback {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Perform a unary call to the method at `path` (`/{service}/{method}`).
    ///
    /// Calls whose context has already ended are not routed.
    pub async fn invoke_path(
        &self,
        ctx: &CallContext,
        path: &str,
        request: AnyMessage,
    ) -> Result<DynamicMessage, Status> {
        if let Some(status) = ctx.err() {
            return Err(status);
        }

        let method = self.router.resolve_method(path)?;
        let request = into_message(request)?;
        let conn = method.resolver.resolve(&request)?;

        debug!(method = %path, "Forwarding unary call");
        conn.invoke(ctx, &method.descriptor, Box::new(request)).await
    }

    /// Perform a unary call with generated message types.
    pub async fn unary<Req, Resp>(
        &self,
        ctx: &CallContext,
        path: &str,
        request: &Req,
    ) -> Result<Resp, Status>
    where
        Req: ReflectMessage,
        Resp: prost::Message + Default,
    {
        let reply = self
            .invoke_path(ctx, path, typed_message(request))
            .await?;
        reply
            .transcode_to::<Resp>()
            .map_err(|e| Status::internal(format!("Failed to decode reply from {path}: {e}")))
    }
}

#[tonic::async_trait]
impl ClientConn for Loopback {
    async fn invoke(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
        request: AnyMessage,
    ) -> Result<DynamicMessage, Status> {
        self.invoke_path(ctx, &method_path(method), request).await
    }

    async fn new_stream(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
    ) -> Result<Box<dyn ClientStream>, Status> {
        let resolved = self.router.resolve_method(&method_path(method))?;
        Ok(Box::new(DeferredStream::new(ctx.clone(), resolved)))
    }
}
