//! Descriptor and connection fixtures shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use prost::Message as _;
use prost_reflect::{DescriptorPool, DynamicMessage, MethodDescriptor, ServiceDescriptor, Value};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
};
use tokio::sync::mpsc;
use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::conn::{AnyMessage, CallContext, ClientConn, ClientStream, into_message, message};

fn field(name: &str, number: i32, r#type: Type, label: Label) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(r#type as i32),
        json_name: Some(name.to_string()),
        ..Default::default()
    }
}

fn message_type(name: &str, field: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field,
        ..Default::default()
    }
}

fn rpc(name: &str, input: &str, output: &str, client: bool, server: bool) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(format!(".test.{input}")),
        output_type: Some(format!(".test.{output}")),
        client_streaming: Some(client),
        server_streaming: Some(server),
        ..Default::default()
    }
}

fn service_type(name: &str, method: Vec<MethodDescriptorProto>) -> ServiceDescriptorProto {
    ServiceDescriptorProto {
        name: Some(name.to_string()),
        method,
        ..Default::default()
    }
}

/// `test.proto`:
///
/// ```text
/// message GetRequest { string name = 1; int32 value = 2; }
/// message GetReply { string name = 1; string served_by = 2; }
/// message ListRequest { int32 page = 1; }
/// message Tagged { repeated string name = 1; }
///
/// service Foo {
///   rpc Get(GetRequest) returns (GetReply);
///   rpc Watch(GetRequest) returns (stream GetReply);
///   rpc Upload(stream GetRequest) returns (GetReply);
///   rpc Chat(stream GetRequest) returns (stream GetReply);
/// }
/// service Bar { rpc Get(GetRequest) returns (GetReply); }
/// service Lister { rpc List(ListRequest) returns (GetReply); rpc Get(GetRequest) returns (GetReply); }
/// service Tags { rpc Tag(Tagged) returns (GetReply); }
/// ```
pub fn pool() -> DescriptorPool {
    let file = FileDescriptorProto {
        name: Some("test.proto".to_string()),
        package: Some("test".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            message_type(
                "GetRequest",
                vec![
                    field("name", 1, Type::String, Label::Optional),
                    field("value", 2, Type::Int32, Label::Optional),
                ],
            ),
            message_type(
                "GetReply",
                vec![
                    field("name", 1, Type::String, Label::Optional),
                    field("served_by", 2, Type::String, Label::Optional),
                ],
            ),
            message_type(
                "ListRequest",
                vec![field("page", 1, Type::Int32, Label::Optional)],
            ),
            message_type(
                "Tagged",
                vec![field("name", 1, Type::String, Label::Repeated)],
            ),
        ],
        service: vec![
            service_type(
                "Foo",
                vec![
                    rpc("Get", "GetRequest", "GetReply", false, false),
                    rpc("Watch", "GetRequest", "GetReply", false, true),
                    rpc("Upload", "GetRequest", "GetReply", true, false),
                    rpc("Chat", "GetRequest", "GetReply", true, true),
                ],
            ),
            service_type("Bar", vec![rpc("Get", "GetRequest", "GetReply", false, false)]),
            service_type(
                "Lister",
                vec![
                    rpc("List", "ListRequest", "GetReply", false, false),
                    rpc("Get", "GetRequest", "GetReply", false, false),
                ],
            ),
            service_type("Tags", vec![rpc("Tag", "Tagged", "GetReply", false, false)]),
        ],
        ..Default::default()
    };

    let set = FileDescriptorSet { file: vec![file] };
    DescriptorPool::decode(set.encode_to_vec().as_slice()).expect("test descriptors are valid")
}

pub fn service(pool: &DescriptorPool, name: &str) -> ServiceDescriptor {
    pool.get_service_by_name(name)
        .unwrap_or_else(|| panic!("no service {name}"))
}

pub fn method(pool: &DescriptorPool, service_name: &str, method: &str) -> MethodDescriptor {
    service(pool, service_name)
        .methods()
        .find(|m| m.name() == method)
        .unwrap_or_else(|| panic!("no method {service_name}/{method}"))
}

pub fn get_request(pool: &DescriptorPool, name: &str) -> DynamicMessage {
    let mut request = DynamicMessage::new(pool.get_message_by_name("test.GetRequest").unwrap());
    request.set_field_by_name("name", Value::String(name.to_string()));
    request
}

pub fn string_field(message: &DynamicMessage, field: &str) -> String {
    message
        .get_field_by_name(field)
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Invoke `method` on `conn` and return the label of the fake that served it.
pub fn served_by(
    conn: &Arc<dyn ClientConn>,
    method: &MethodDescriptor,
    request: DynamicMessage,
) -> String {
    let reply = futures::executor::block_on(conn.invoke(
        &CallContext::new(),
        method,
        message(request),
    ))
    .expect("fake connections answer every call");
    string_field(&reply, "served_by")
}

/// A backend that answers every request with a `GetReply` naming itself.
pub struct FakeConn {
    label: String,
    fail_streams: bool,
    pub invokes: AtomicUsize,
    pub streams: AtomicUsize,
    contexts: Mutex<Vec<CallContext>>,
}

impl FakeConn {
    pub fn new(label: impl Into<String>) -> Arc<FakeConn> {
        Arc::new(Self {
            label: label.into(),
            fail_streams: false,
            invokes: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        })
    }

    /// A backend whose streams cannot be opened.
    pub fn failing(label: impl Into<String>) -> Arc<FakeConn> {
        Arc::new(Self {
            label: label.into(),
            fail_streams: true,
            invokes: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn stream_count(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    /// The context of the most recent call or stream.
    pub fn last_context(&self) -> Option<CallContext> {
        self.contexts.lock().last().cloned()
    }
}

fn reply(method: &MethodDescriptor, request: &DynamicMessage, label: &str) -> DynamicMessage {
    let mut reply = DynamicMessage::new(method.output());
    reply.set_field_by_name("name", Value::String(string_field(request, "name")));
    reply.set_field_by_name("served_by", Value::String(label.to_string()));
    reply
}

#[tonic::async_trait]
impl ClientConn for FakeConn {
    async fn invoke(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
        request: AnyMessage,
    ) -> Result<DynamicMessage, Status> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(ctx.clone());
        let request = into_message(request)?;
        Ok(reply(method, &request, &self.label))
    }

    async fn new_stream(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
    ) -> Result<Box<dyn ClientStream>, Status> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(ctx.clone());
        if self.fail_streams {
            return Err(Status::unavailable(format!("{} is down", self.label)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(EchoStream {
            ctx: ctx.clone(),
            method: method.clone(),
            label: self.label.clone(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }))
    }
}

/// Replies to every message it is sent, finishing once the send side is closed.
struct EchoStream {
    ctx: CallContext,
    method: MethodDescriptor,
    label: String,
    tx: Mutex<Option<mpsc::UnboundedSender<DynamicMessage>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DynamicMessage>>,
}

#[tonic::async_trait]
impl ClientStream for EchoStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    async fn header(&self) -> Result<MetadataMap, Status> {
        let mut header = MetadataMap::new();
        header.insert("x-served-by", self.label.parse().unwrap());
        Ok(header)
    }

    fn trailer(&self) -> MetadataMap {
        MetadataMap::new()
    }

    async fn send_msg(&self, message: AnyMessage) -> Result<(), Status> {
        let request = into_message(message)?;
        let tx = self.tx.lock().clone();
        let tx = tx.ok_or_else(|| Status::failed_precondition("send after close_send"))?;
        tx.send(reply(&self.method, &request, &self.label))
            .map_err(|_| Status::unavailable("stream closed"))
    }

    async fn recv_msg(&self) -> Result<Option<DynamicMessage>, Status> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close_send(&self) -> Result<(), Status> {
        self.tx.lock().take();
        Ok(())
    }
}
