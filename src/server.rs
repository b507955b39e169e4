use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::TcpListenerStream;
use tonic_health::server::health_reporter;
use tracing::info;

use crate::handler::PingHandler;
use crate::pb::canary_api_server::CanaryApiServer;

/// Serve the canary ping RPC and the standard health service on `listener`
/// until `shutdown` fires.
pub async fn run_canary_server(
    listener: TcpListener,
    handler: Arc<PingHandler>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    let incoming = TcpListenerStream::new(listener);
    run_canary_server_incoming(incoming, handler, shutdown).await?;
    info!(%addr, "canary server stopped");
    Ok(())
}

/// Like [`run_canary_server`] but over an arbitrary connection stream.
pub async fn run_canary_server_incoming<S, IO>(
    incoming: S,
    handler: Arc<PingHandler>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: tokio_stream::Stream<Item = Result<IO, std::io::Error>> + Send + 'static,
    IO: tokio::io::AsyncRead
        + tokio::io::AsyncWrite
        + tonic::transport::server::Connected
        + Send
        + Unpin
        + 'static,
{
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<CanaryApiServer<PingHandler>>()
        .await;

    let server = CanaryApiServer::from_arc(handler);
    tonic::transport::Server::builder()
        .add_service(health_service)
        .add_service(server)
        .serve_with_incoming_shutdown(incoming, async move {
            let _ = shutdown.recv().await;
            info!("graceful shutdown signal received");
        })
        .await?;
    Ok(())
}
