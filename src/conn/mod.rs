//! Connection capabilities the router is written against.
//!
//! Everything the router forwards to implements [`ClientConn`]: the router's own
//! [`Loopback`](crate::loopback::Loopback), a tonic channel wrapped in a [`GrpcConn`], or a
//! driver's in-process implementation. Streams opened on a connection implement
//! [`ClientStream`].
//!
//! Messages cross these traits as [`AnyMessage`] so that a caller can hand over any payload;
//! only [`DynamicMessage`]s are accepted, anything else is rejected with
//! [`RouterError::NonProtoMessage`].

use std::any::Any;

use prost_reflect::{DynamicMessage, MethodDescriptor, ReflectMessage};
use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::error::RouterError;

pub mod codec;
pub mod context;
pub mod grpc;
pub mod local;

pub use codec::DynamicCodec;
pub use context::CallContext;
pub use grpc::{ChannelConfig, GrpcConn};

/// A payload handed to a connection.
pub type AnyMessage = Box<dyn Any + Send>;

/// Box a dynamic message as an [`AnyMessage`].
pub fn message(message: DynamicMessage) -> AnyMessage {
    Box::new(message)
}

/// Transcode a generated message into an [`AnyMessage`].
pub fn typed_message<M: ReflectMessage>(message: &M) -> AnyMessage {
    Box::new(message.transcode_to_dynamic())
}

/// Recover the protobuf message carried by an [`AnyMessage`].
pub fn into_message(payload: AnyMessage) -> Result<DynamicMessage, RouterError> {
    payload
        .downcast::<DynamicMessage>()
        .map(|message| *message)
        .map_err(|_| RouterError::NonProtoMessage)
}

/// A connection able to carry unary and streaming calls.
#[tonic::async_trait]
pub trait ClientConn: Send + Sync + 'static {
    /// Perform a unary call and return the reply.
    async fn invoke(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
        request: AnyMessage,
    ) -> Result<DynamicMessage, Status>;

    /// Open a stream for `method`.
    ///
    /// The streaming shape (client, server or bidirectional) is taken from the descriptor.
    async fn new_stream(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
    ) -> Result<Box<dyn ClientStream>, Status>;
}

/// One side of an open streaming call.
///
/// All operations take `&self` so that sending and receiving can happen from different tasks.
#[tonic::async_trait]
pub trait ClientStream: Send + Sync {
    /// The context the stream was opened with.
    fn context(&self) -> &CallContext;

    /// Wait for and return the response headers.
    async fn header(&self) -> Result<MetadataMap, Status>;

    /// The response trailers.
    ///
    /// Only complete once [`recv_msg`](Self::recv_msg) has returned `Ok(None)` or an error.
    fn trailer(&self) -> MetadataMap;

    /// Send a message on the stream.
    async fn send_msg(&self, message: AnyMessage) -> Result<(), Status>;

    /// Receive the next message, `Ok(None)` once the server has finished.
    async fn recv_msg(&self) -> Result<Option<DynamicMessage>, Status>;

    /// Half-close the sending side.
    async fn close_send(&self) -> Result<(), Status>;
}

/// Full gRPC path of a method, `/{service}/{method}`.
pub fn method_path(method: &MethodDescriptor) -> String {
    format!("/{}/{}", method.parent_service().full_name(), method.name())
}
