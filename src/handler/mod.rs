//! Server-side catch-all that proxies every call it receives through the [`Router`].
//!
//! The handler is not tied to any service. It looks the method up by request path, decodes the
//! request stream with the method's input type and routes the call on its first message. Every
//! call is proxied as a stream; the method descriptor carries its real streaming shape to the
//! backend.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use prost_reflect::DynamicMessage;
use tonic::codegen::{Body, BoxFuture, Service, StdError, http};
use tonic::server::{Grpc, StreamingService};
use tonic::service::Routes;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conn::{CallContext, ClientStream, DynamicCodec};
use crate::router::{ResolvedMethod, Router};

mod interceptor;

pub use interceptor::{StreamInfo, StreamInterceptor, TracingInterceptor};

type ProxyStream = BoxStream<'static, Result<DynamicMessage, Status>>;

/// A `tower` service answering any gRPC path by proxying it to a routed backend.
#[derive(Clone)]
pub struct StreamHandler {
    router: Router,
    interceptors: Vec<Arc<dyn StreamInterceptor>>,
}

impl StreamHandler {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            interceptors: Vec::new(),
        }
    }

    /// Run `interceptor` on the first message of every stream, after any added before it.
    pub fn with_interceptor(mut self, interceptor: impl StreamInterceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Routes serving every path with this handler.
    pub fn into_routes(self) -> Routes {
        Routes::from(axum::Router::new().fallback_service(self))
    }

    /// Serve paths not matched by `routes` with this handler.
    pub fn attach(self, routes: Routes) -> Routes {
        Routes::from(routes.into_axum_router().fallback_service(self))
    }

    async fn handle<B>(self, request: http::Request<B>) -> http::Response<tonic::body::Body>
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        let full_method = request.uri().path().to_string();

        let method = match self.router.resolve_method(&full_method) {
            Ok(method) => method,
            Err(e) => {
                debug!(method = %full_method, error = %e, "Rejected call");
                return Status::from(e).into_http();
            }
        };

        let codec = DynamicCodec::new(method.descriptor.input());
        let call = ProxyCall {
            handler: self,
            full_method,
            method,
        };

        Grpc::new(codec).streaming(call, request).await
    }
}

impl<B> Service<http::Request<B>> for StreamHandler
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { Ok(handler.handle(request).await) })
    }
}

/// One proxied call, from its first inbound message to the end of the backend's replies.
#[derive(Clone)]
struct ProxyCall {
    handler: StreamHandler,
    full_method: String,
    method: ResolvedMethod,
}

impl ProxyCall {
    async fn proxy(
        self,
        request: Request<Streaming<DynamicMessage>>,
    ) -> Result<Response<ProxyStream>, Status> {
        let (metadata, _, mut inbound) = request.into_parts();
        let stream_id = Uuid::new_v4();

        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("Empty stream"))?;

        let info = StreamInfo {
            full_method: &self.full_method,
            method: &self.method.descriptor,
            metadata: &metadata,
        };
        for interceptor in &self.handler.interceptors {
            interceptor.on_first_message(&info, &first)?;
        }

        let conn = self.method.resolver.resolve(&first)?;

        let ctx = CallContext::from_metadata(metadata);
        let guard = ctx.cancel_on_drop();
        let backend: Arc<dyn ClientStream> =
            Arc::from(conn.new_stream(&ctx, &self.method.descriptor).await?);
        backend.send_msg(Box::new(first)).await?;

        info!(
            stream_id = %stream_id,
            method = %self.full_method,
            deadline = ?ctx.deadline(),
            "Stream started"
        );

        tokio::spawn(forward(
            stream_id,
            inbound,
            Arc::clone(&backend),
            ctx.clone(),
        ));

        let header = backend.header().await?;

        let full_method = self.full_method;
        let outbound = async_stream::stream! {
            let _guard = guard;
            loop {
                match backend.recv_msg().await {
                    Ok(Some(message)) => yield Ok(message),
                    Ok(None) => break,
                    Err(status) => {
                        yield Err(status);
                        break;
                    }
                }
            }
            debug!(stream_id = %stream_id, method = %full_method, "Stream finished");
        };

        let mut response = Response::new(Box::pin(outbound) as ProxyStream);
        *response.metadata_mut() = header;
        Ok(response)
    }
}

impl StreamingService<DynamicMessage> for ProxyCall {
    type Response = DynamicMessage;
    type ResponseStream = ProxyStream;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<DynamicMessage>>) -> Self::Future {
        let call = self.clone();
        Box::pin(call.proxy(request))
    }
}

/// Forward the rest of the client's messages to the backend, half-closing when they end.
async fn forward(
    stream_id: Uuid,
    mut inbound: Streaming<DynamicMessage>,
    backend: Arc<dyn ClientStream>,
    ctx: CallContext,
) {
    loop {
        let next = tokio::select! {
            next = inbound.message() => next,
            _ = ctx.done() => return,
        };

        match next {
            Ok(Some(message)) => {
                if let Err(status) = backend.send_msg(Box::new(message)).await {
                    debug!(stream_id = %stream_id, error = %status, "Backend stopped accepting messages");
                    return;
                }
            }
            Ok(None) => {
                if let Err(status) = backend.close_send().await {
                    debug!(stream_id = %stream_id, error = %status, "Failed to half-close backend");
                }
                return;
            }
            Err(status) => {
                warn!(stream_id = %stream_id, error = %status, "Client stream failed");
                ctx.cancel();
                return;
            }
        }
    }
}
