use thiserror::Error;
use tonic::Status;

use crate::router::RouteKey;

/// Errors produced while registering services and routes or resolving calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// A service with this fully-qualified name is already registered.
    #[error("service '{0}' is already registered")]
    ServiceExists(String),

    /// The named service is not registered with the router.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// A route for this exact (service, key) pair already exists.
    #[error("route {0} already exists")]
    RouteExists(RouteKey),

    /// The full method name is not of the form `/{service}/{method}`.
    #[error("malformed method name '{0}', expected '/{{service}}/{{method}}'")]
    MissingMethod(String),

    /// The service is known but has no method with this name.
    #[error("unknown method '{method}' on service '{service}'")]
    UnknownMethod { service: String, method: String },

    /// No registered route matched the call.
    #[error("no route for service '{service}' with key {key:?}")]
    NotFound { service: String, key: Option<String> },

    /// A payload handed to a connection was not a protobuf message.
    #[error("payload is not a protobuf message")]
    NonProtoMessage,

    /// A method's request type cannot supply a routing key.
    #[error("method '{method}' request '{message}' has no non-repeated string field '{field}'")]
    KeyField {
        method: String,
        message: String,
        field: String,
    },

    /// The routing key could not be read from a request message.
    #[error("cannot read string field '{field}' from message '{message}'")]
    KeyExtraction { message: String, field: String },

    /// A descriptor pool has no service matching a server's name.
    #[error("no descriptor for service '{0}'")]
    MissingDescriptor(String),
}

impl From<RouterError> for Status {
    fn from(err: RouterError) -> Self {
        let message = err.to_string();
        match err {
            RouterError::UnknownService(_) | RouterError::UnknownMethod { .. } => {
                Status::unimplemented(message)
            }
            RouterError::MissingMethod(_) | RouterError::KeyExtraction { .. } => {
                Status::invalid_argument(message)
            }
            RouterError::NotFound { .. } => Status::not_found(message),
            RouterError::NonProtoMessage => Status::internal(message),
            RouterError::ServiceExists(_) | RouterError::RouteExists(_) => {
                Status::already_exists(message)
            }
            RouterError::KeyField { .. } | RouterError::MissingDescriptor(_) => {
                Status::failed_precondition(message)
            }
        }
    }
}
