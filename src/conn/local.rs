//! In-process hosting of tonic services.
//!
//! A hosted service is served over an in-memory duplex pipe instead of a socket. Each time the
//! channel (re)connects a fresh pipe is created and a server task is spawned for it.

use hyper_util::rt::TokioIo;
use tonic::service::Routes;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tracing::{debug, warn};

/// Size of the in-memory pipe between the channel and the hosted server.
const DUPLEX_BUFFER: usize = 64 * 1024;

/// Authority used for in-process channels; never resolved.
const IN_PROCESS_URI: &str = "http://in-process.local";

/// Create a channel to `routes` served in-process.
///
/// The channel connects lazily, so this must be called from within a tokio runtime but does
/// not wait for anything.
pub fn in_process_channel(routes: Routes) -> Channel {
    let connector = tower::service_fn(move |_: Uri| {
        let routes = routes.clone();
        async move {
            let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);

            tokio::spawn(async move {
                debug!("In-process connection opened");
                let incoming = tokio_stream::once(Ok::<_, std::io::Error>(server));
                if let Err(e) = Server::builder()
                    .add_routes(routes)
                    .serve_with_incoming(incoming)
                    .await
                {
                    warn!(error = %e, "In-process server ended with error");
                }
            });

            Ok::<_, std::io::Error>(TokioIo::new(client))
        }
    });

    Endpoint::from_static(IN_PROCESS_URI).connect_with_connector_lazy(connector)
}
