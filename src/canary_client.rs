//! Outbound side of the canary-to-canary ping.
//!
//! Pings are bounded by a single deadline and never retried: a failed or
//! negative ping is itself the measurement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::metadata::MetadataValue;
use tracing::debug;

use crate::pb;
use crate::peer_chooser::{PeerChooser, PeerChooserError};

/// Header carrying the shard key the request is routed by.
pub const SHARD_KEY_HEADER: &str = "x-shard-key";
/// Header carrying the namespace for demultiplexing at the receiving canary.
pub const NAMESPACE_HEADER: &str = "x-shard-distributor-namespace";

#[derive(Debug, thiserror::Error)]
pub enum CanaryClientError {
    #[error("failed to route ping: {0}")]
    Routing(#[from] PeerChooserError),
    #[error("ping to {address} failed: {}: {}", .status.code(), .status.message())]
    Rpc {
        address: String,
        status: tonic::Status,
    },
    #[error("ping timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid ping request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait CanaryClient: Send + Sync {
    /// Ping whichever peer currently owns the request's shard.
    async fn ping(&self, request: pb::PingRequest) -> Result<pb::PingResponse, CanaryClientError>;

    /// Ping a specific peer, bypassing shard routing.
    async fn ping_peer(
        &self,
        address: &str,
        request: pb::PingRequest,
    ) -> Result<pb::PingResponse, CanaryClientError>;
}

/// Canary client that routes by shard key through a [`PeerChooser`].
pub struct RoutedCanaryClient {
    chooser: Arc<PeerChooser>,
    timeout: Duration,
}

impl RoutedCanaryClient {
    pub fn new(chooser: Arc<PeerChooser>, timeout: Duration) -> Self {
        Self { chooser, timeout }
    }

    async fn send(
        &self,
        address: &str,
        request: pb::PingRequest,
    ) -> Result<pb::PingResponse, CanaryClientError> {
        let request = routed_request(request, self.timeout)?;
        let mut client = self.chooser.client_for(address).await?;
        match client.ping(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                if status.code() == tonic::Code::Unavailable {
                    self.chooser.forget(address).await;
                }
                Err(CanaryClientError::Rpc {
                    address: address.to_string(),
                    status,
                })
            }
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, CanaryClientError>>,
    ) -> Result<T, CanaryClientError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| CanaryClientError::Timeout(self.timeout))?
    }
}

/// Wrap a ping in a gRPC request carrying the routing headers and deadline.
pub fn routed_request(
    ping: pb::PingRequest,
    timeout: Duration,
) -> Result<tonic::Request<pb::PingRequest>, CanaryClientError> {
    let shard_key = MetadataValue::try_from(ping.shard_key.as_str())
        .map_err(|e| CanaryClientError::InvalidRequest(format!("shard key: {e}")))?;
    let namespace = MetadataValue::try_from(ping.namespace.as_str())
        .map_err(|e| CanaryClientError::InvalidRequest(format!("namespace: {e}")))?;

    let mut request = tonic::Request::new(ping);
    request.metadata_mut().insert(SHARD_KEY_HEADER, shard_key);
    request.metadata_mut().insert(NAMESPACE_HEADER, namespace);
    request.set_timeout(timeout);
    Ok(request)
}

#[async_trait]
impl CanaryClient for RoutedCanaryClient {
    async fn ping(&self, request: pb::PingRequest) -> Result<pb::PingResponse, CanaryClientError> {
        self.bounded(async {
            let peer = self
                .chooser
                .choose_peer(&request.namespace, &request.shard_key)?;
            debug!(
                namespace = %request.namespace,
                shard_key = %request.shard_key,
                executor_id = %peer.executor_id,
                address = %peer.address,
                "routing ping"
            );
            self.send(&peer.address, request).await
        })
        .await
    }

    async fn ping_peer(
        &self,
        address: &str,
        request: pb::PingRequest,
    ) -> Result<pb::PingResponse, CanaryClientError> {
        self.bounded(self.send(address, request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attaches_routing_headers() {
        let request = routed_request(
            pb::PingRequest {
                namespace: "ns1".to_string(),
                shard_key: "7".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap();
        let md = request.metadata();
        assert_eq!(md.get(SHARD_KEY_HEADER).unwrap().to_str().unwrap(), "7");
        assert_eq!(md.get(NAMESPACE_HEADER).unwrap().to_str().unwrap(), "ns1");
        assert_eq!(request.get_ref().shard_key, "7");
    }

    #[test]
    fn rejects_keys_that_cannot_be_headers() {
        let err = routed_request(
            pb::PingRequest {
                namespace: "ns1".to_string(),
                shard_key: "bad\nkey".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, CanaryClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn ping_fails_before_spectators_are_attached() {
        let client = RoutedCanaryClient::new(Arc::new(PeerChooser::new()), Duration::from_secs(1));
        let err = client
            .ping(pb::PingRequest {
                namespace: "ns1".to_string(),
                shard_key: "1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CanaryClientError::Routing(PeerChooserError::NotInitialized)
        ));
    }
}
