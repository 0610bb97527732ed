use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use prost_reflect::DynamicMessage;
use tokio::sync::watch;
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::debug;

use crate::conn::{AnyMessage, CallContext, ClientStream, into_message};
use crate::router::ResolvedMethod;

type Resolution = Result<Box<dyn ClientStream>, Status>;

/// A stream whose backend is chosen when its first message is sent.
///
/// The first [`send_msg`](ClientStream::send_msg) resolves the connection from that message,
/// opens the backend stream and sends the message on it. The outcome is fixed from then on: a
/// failure before the backend stream exists is returned by every later operation, and nothing
/// is retried. Every other operation waits for the first send to finish, or for the call
/// context to end.
///
/// If the first send is dropped before it finishes, the stream resolves to `Cancelled`.
pub struct DeferredStream {
    ctx: CallContext,
    method: ResolvedMethod,
    started: AtomicBool,
    ready: watch::Sender<bool>,
    resolution: OnceLock<Resolution>,
}

impl DeferredStream {
    pub fn new(ctx: CallContext, method: ResolvedMethod) -> Self {
        Self {
            ctx,
            method,
            started: AtomicBool::new(false),
            ready: watch::Sender::new(false),
            resolution: OnceLock::new(),
        }
    }

    /// Whether the backend has been chosen, successfully or not.
    pub fn is_resolved(&self) -> bool {
        self.resolution.get().is_some()
    }

    fn resolve(&self, resolution: Resolution) {
        if let Err(status) = &resolution {
            debug!(
                method = %self.method.descriptor.full_name(),
                code = ?status.code(),
                "Stream resolution failed"
            );
        }
        let _ = self.resolution.set(resolution);
        self.ready.send_replace(true);
    }

    async fn start(&self, message: AnyMessage) -> Result<(), Status> {
        let pending = Pending::new(self);

        let opened = tokio::select! {
            biased;
            status = self.ctx.done() => Err(status),
            opened = self.open(message) => opened,
        };
        let (stream, first) = match opened {
            Ok(opened) => opened,
            Err(status) => {
                pending.finish(Err(status.clone()));
                return Err(status);
            }
        };

        let sent = stream.send_msg(Box::new(first)).await;
        pending.finish(Ok(stream));
        sent
    }

    async fn open(
        &self,
        message: AnyMessage,
    ) -> Result<(Box<dyn ClientStream>, DynamicMessage), Status> {
        let message = into_message(message)?;
        let conn = self.method.resolver.resolve(&message)?;
        let stream = conn.new_stream(&self.ctx, &self.method.descriptor).await?;
        Ok((stream, message))
    }

    /// Wait for the first send to resolve the stream.
    async fn wait(&self) -> Result<&dyn ClientStream, Status> {
        if self.resolution.get().is_none() {
            let mut ready = self.ready.subscribe();
            let resolved = async {
                let _ = ready.wait_for(|ready| *ready).await;
            };

            tokio::select! {
                biased;
                _ = resolved => {}
                status = self.ctx.done() => return Err(status),
            }
        }

        match self.resolution.get() {
            Some(Ok(stream)) => Ok(stream.as_ref()),
            Some(Err(status)) => Err(status.clone()),
            None => Err(Status::internal("stream signalled ready without a resolution")),
        }
    }

    fn resolved(&self, operation: &str) -> &Resolution {
        match self.resolution.get() {
            Some(resolution) => resolution,
            None => panic!("{operation} called on a stream that has not been resolved"),
        }
    }
}

#[tonic::async_trait]
impl ClientStream for DeferredStream {
    /// # Panics
    ///
    /// If called before `recv_msg` or `header` has returned.
    fn context(&self) -> &CallContext {
        match self.resolved("context") {
            Ok(stream) => stream.context(),
            Err(_) => &self.ctx,
        }
    }

    async fn header(&self) -> Result<MetadataMap, Status> {
        self.wait().await?.header().await
    }

    /// # Panics
    ///
    /// If called before `recv_msg` or `header` has returned.
    fn trailer(&self) -> MetadataMap {
        match self.resolved("trailer") {
            Ok(stream) => stream.trailer(),
            Err(_) => MetadataMap::new(),
        }
    }

    async fn send_msg(&self, message: AnyMessage) -> Result<(), Status> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return self.start(message).await;
        }
        self.wait().await?.send_msg(message).await
    }

    async fn recv_msg(&self) -> Result<Option<DynamicMessage>, Status> {
        self.wait().await?.recv_msg().await
    }

    async fn close_send(&self) -> Result<(), Status> {
        self.wait().await?.close_send().await
    }
}

/// Resolves the stream to `Cancelled` unless [`finish`](Self::finish) is reached.
struct Pending<'a> {
    stream: &'a DeferredStream,
    finished: bool,
}

impl<'a> Pending<'a> {
    fn new(stream: &'a DeferredStream) -> Self {
        Self {
            stream,
            finished: false,
        }
    }

    fn finish(mut self, resolution: Resolution) {
        self.finished = true;
        self.stream.resolve(resolution);
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.stream
                .resolve(Err(Status::cancelled("stream abandoned before it was resolved")));
        }
    }
}
