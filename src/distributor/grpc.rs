use async_trait::async_trait;
use futures::StreamExt;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use super::{
    DistributorError, NamespaceStateStream, ShardDistributorClient,
    ShardDistributorExecutorClient,
};
use crate::pb;
use crate::pb::distributor_api_client::DistributorApiClient;
use crate::pb::executor_api_client::ExecutorApiClient;

/// Ensure an address has the http:// scheme prefix
pub fn ensure_http_scheme(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

/// Raw gRPC client for both distributor services over one shared channel.
#[derive(Clone)]
pub struct GrpcDistributorClient {
    distributor: DistributorApiClient<Channel>,
    executor: ExecutorApiClient<Channel>,
}

impl GrpcDistributorClient {
    /// Build a client whose channel connects on first use, so a distributor
    /// that is not up yet surfaces as `Unavailable` on the call itself.
    pub fn connect_lazy(endpoint: &str) -> Result<Self, DistributorError> {
        let url = ensure_http_scheme(endpoint);
        debug!(endpoint = %url, "creating shard distributor channel");
        let channel = Endpoint::from_shared(url.clone())
            .map_err(|e| DistributorError::Connection(format!("{url}: {e}")))?
            .connect_lazy();
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            distributor: DistributorApiClient::new(channel.clone()),
            executor: ExecutorApiClient::new(channel),
        }
    }
}

#[async_trait]
impl ShardDistributorClient for GrpcDistributorClient {
    async fn get_shard_owner(
        &self,
        request: pb::GetShardOwnerRequest,
    ) -> Result<pb::GetShardOwnerResponse, DistributorError> {
        let mut client = self.distributor.clone();
        let response = client.get_shard_owner(request).await?;
        Ok(response.into_inner())
    }

    async fn watch_namespace_state(
        &self,
        request: pb::WatchNamespaceStateRequest,
    ) -> Result<NamespaceStateStream, DistributorError> {
        let mut client = self.distributor.clone();
        let stream = client.watch_namespace_state(request).await?.into_inner();
        Ok(stream.map(|item| item.map_err(DistributorError::from)).boxed())
    }
}

#[async_trait]
impl ShardDistributorExecutorClient for GrpcDistributorClient {
    async fn heartbeat(
        &self,
        request: pb::HeartbeatRequest,
    ) -> Result<pb::HeartbeatResponse, DistributorError> {
        let mut client = self.executor.clone();
        let response = client.heartbeat(request).await?;
        Ok(response.into_inner())
    }
}
