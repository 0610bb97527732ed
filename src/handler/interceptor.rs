use prost_reflect::{DynamicMessage, MethodDescriptor};
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::info;

use crate::router::DEFAULT_KEY_FIELD;

/// What an interceptor knows about a stream when its first message arrives.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo<'a> {
    /// `/{service}/{method}` as received.
    pub full_method: &'a str,
    pub method: &'a MethodDescriptor,
    pub metadata: &'a MetadataMap,
}

/// Hook run on the first message of every stream before it is routed.
///
/// Returning an error rejects the call with that status.
pub trait StreamInterceptor: Send + Sync + 'static {
    fn on_first_message(&self, info: &StreamInfo<'_>, message: &DynamicMessage)
    -> Result<(), Status>;
}

/// Logs the routing key of each proxied stream.
#[derive(Debug, Clone)]
pub struct TracingInterceptor {
    key_field: String,
}

impl TracingInterceptor {
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
        }
    }
}

impl Default for TracingInterceptor {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_FIELD)
    }
}

impl StreamInterceptor for TracingInterceptor {
    fn on_first_message(
        &self,
        info: &StreamInfo<'_>,
        message: &DynamicMessage,
    ) -> Result<(), Status> {
        let key = message
            .get_field_by_name(&self.key_field)
            .and_then(|value| value.as_str().map(str::to_string));

        match key {
            Some(key) => info!(method = %info.full_method, key = %key, "Proxying stream"),
            None => info!(method = %info.full_method, "Proxying stream without key"),
        }
        Ok(())
    }
}
