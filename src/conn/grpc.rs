use std::sync::OnceLock;
use std::time::Duration;

use bon::Builder;
use parking_lot::Mutex;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::conn::codec::DynamicCodec;
use crate::conn::context::CallContext;
use crate::conn::{AnyMessage, ClientConn, ClientStream, into_message, method_path};

/// Messages buffered between a caller's `send_msg` and the HTTP/2 stream.
const OUTBOUND_BUFFER: usize = 32;

/// Configuration for connecting a [`GrpcConn`] to a remote backend.
#[derive(Debug, Clone, Builder)]
pub struct ChannelConfig {
    /// Backend URI (e.g., "http://[::1]:50052").
    pub endpoint: String,

    /// Timeout for establishing the connection.
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,

    /// Connect on first use instead of up front.
    #[builder(default)]
    pub lazy: bool,
}

/// A [`ClientConn`] backed by a tonic [`Channel`].
///
/// Requests and replies are encoded with a [`DynamicCodec`], so any method described by a
/// [`MethodDescriptor`] can be called without generated client code.
#[derive(Debug, Clone)]
pub struct GrpcConn {
    grpc: Grpc<Channel>,
}

impl GrpcConn {
    pub fn new(channel: Channel) -> Self {
        Self {
            grpc: Grpc::new(channel),
        }
    }

    /// Connect to the backend described by `config`.
    pub async fn connect(config: &ChannelConfig) -> Result<Self, tonic::transport::Error> {
        let endpoint =
            Endpoint::from_shared(config.endpoint.clone())?.connect_timeout(config.connect_timeout);

        let channel = if config.lazy {
            endpoint.connect_lazy()
        } else {
            endpoint.connect().await?
        };

        debug!(endpoint = %config.endpoint, lazy = config.lazy, "Backend channel created");

        Ok(Self::new(channel))
    }
}

#[tonic::async_trait]
impl ClientConn for GrpcConn {
    async fn invoke(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
        request: AnyMessage,
    ) -> Result<DynamicMessage, Status> {
        let message = into_message(request)?;
        let path = grpc_path(method)?;
        let codec = DynamicCodec::new(method.output());
        let call = unary(self.grpc.clone(), ctx.request(message), path, codec);

        tokio::select! {
            response = call => response.map(Response::into_inner),
            status = ctx.done() => Err(status),
        }
    }

    async fn new_stream(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
    ) -> Result<Box<dyn ClientStream>, Status> {
        let path = grpc_path(method)?;
        let codec = DynamicCodec::new(method.output());
        let (outbound, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let request = ctx.request(ReceiverStream::new(rx));
        let (mut opened, pending) = oneshot::channel();

        // Response headers may only arrive after the first message is sent, so the call is
        // driven from its own task and the stream hands out the response once it is ready.
        // Dropping the stream before then abandons the call.
        let grpc = self.grpc.clone();
        let call_ctx = ctx.clone();
        tokio::spawn(async move {
            let response = tokio::select! {
                response = streaming(grpc, request, path, codec) => response,
                status = call_ctx.done() => Err(status),
                _ = opened.closed() => return,
            };
            let _ = opened.send(response);
        });

        Ok(Box::new(GrpcClientStream {
            ctx: ctx.clone(),
            outbound: Mutex::new(Some(outbound)),
            inbound: tokio::sync::Mutex::new(Inbound::Pending(pending)),
            header: OnceLock::new(),
            trailer: OnceLock::new(),
        }))
    }
}

async fn unary(
    mut grpc: Grpc<Channel>,
    request: Request<DynamicMessage>,
    path: PathAndQuery,
    codec: DynamicCodec,
) -> Result<Response<DynamicMessage>, Status> {
    grpc.ready()
        .await
        .map_err(|e| Status::unavailable(format!("backend not ready: {e}")))?;
    grpc.unary(request, path, codec).await
}

async fn streaming(
    mut grpc: Grpc<Channel>,
    request: Request<ReceiverStream<DynamicMessage>>,
    path: PathAndQuery,
    codec: DynamicCodec,
) -> Result<Response<Streaming<DynamicMessage>>, Status> {
    grpc.ready()
        .await
        .map_err(|e| Status::unavailable(format!("backend not ready: {e}")))?;
    grpc.streaming(request, path, codec).await
}

fn grpc_path(method: &MethodDescriptor) -> Result<PathAndQuery, Status> {
    let path = method_path(method);
    path.parse()
        .map_err(|e| Status::internal(format!("invalid method path '{path}': {e}")))
}

type PendingResponse = oneshot::Receiver<Result<Response<Streaming<DynamicMessage>>, Status>>;

enum Inbound {
    Pending(PendingResponse),
    Open(Streaming<DynamicMessage>),
    Failed(Status),
    Finished,
}

struct GrpcClientStream {
    ctx: CallContext,
    outbound: Mutex<Option<mpsc::Sender<DynamicMessage>>>,
    inbound: tokio::sync::Mutex<Inbound>,
    header: OnceLock<MetadataMap>,
    trailer: OnceLock<MetadataMap>,
}

impl GrpcClientStream {
    /// Wait for the response to start, recording its headers.
    async fn open<'a>(
        &self,
        inbound: &'a mut Inbound,
    ) -> Result<Option<&'a mut Streaming<DynamicMessage>>, Status> {
        let opened = match inbound {
            Inbound::Pending(pending) => Some(match pending.await {
                Ok(Ok(response)) => {
                    let (metadata, streaming, _) = response.into_parts();
                    let _ = self.header.set(metadata);
                    Inbound::Open(streaming)
                }
                Ok(Err(status)) => Inbound::Failed(status),
                Err(_) => Inbound::Failed(Status::cancelled("stream task ended")),
            }),
            _ => None,
        };
        if let Some(opened) = opened {
            *inbound = opened;
        }

        match inbound {
            Inbound::Open(streaming) => Ok(Some(streaming)),
            Inbound::Failed(status) => Err(status.clone()),
            Inbound::Finished => Ok(None),
            Inbound::Pending(_) => Err(Status::internal("stream response not available")),
        }
    }
}

#[tonic::async_trait]
impl ClientStream for GrpcClientStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    async fn header(&self) -> Result<MetadataMap, Status> {
        let mut inbound = self.inbound.lock().await;
        self.open(&mut inbound).await?;
        Ok(self.header.get().cloned().unwrap_or_default())
    }

    fn trailer(&self) -> MetadataMap {
        self.trailer.get().cloned().unwrap_or_default()
    }

    async fn send_msg(&self, message: AnyMessage) -> Result<(), Status> {
        let message = into_message(message)?;
        let outbound = self.outbound.lock().clone();
        let Some(outbound) = outbound else {
            return Err(Status::failed_precondition("send after close_send"));
        };
        outbound
            .send(message)
            .await
            .map_err(|_| Status::unavailable("stream closed by backend"))
    }

    async fn recv_msg(&self) -> Result<Option<DynamicMessage>, Status> {
        let mut inbound = self.inbound.lock().await;
        let Some(streaming) = self.open(&mut inbound).await? else {
            return Ok(None);
        };

        let next = tokio::select! {
            next = streaming.message() => next,
            status = self.ctx.done() => Err(status),
        };

        match next {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                if let Ok(Some(trailer)) = streaming.trailers().await {
                    let _ = self.trailer.set(trailer);
                }
                *inbound = Inbound::Finished;
                Ok(None)
            }
            Err(status) => {
                *inbound = Inbound::Failed(status.clone());
                Err(status)
            }
        }
    }

    async fn close_send(&self) -> Result<(), Status> {
        self.outbound.lock().take();
        Ok(())
    }
}
