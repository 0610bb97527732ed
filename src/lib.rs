//! Dynamic routing of RPC calls to device drivers.
//!
//! Drivers register the services they implement with a [`Router`] and add a route per device
//! they own. Callers then reach every device through one of two entry points:
//!
//! * [`Router::loopback`], a [`ClientConn`] that routes unary calls on their request and streams
//!   on their first message.
//! * [`Router::stream_handler`], a catch-all gRPC server handler that proxies whatever it
//!   receives to the routed backend.

pub mod conn;
pub mod error;
pub mod handler;
pub mod loopback;
pub mod router;

#[cfg(test)]
mod test_support;

pub use conn::{AnyMessage, CallContext, ClientConn, ClientStream};
pub use error::RouterError;
pub use handler::StreamHandler;
pub use loopback::Loopback;
pub use router::{Router, RouterConfig, Service};
