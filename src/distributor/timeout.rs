use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    DistributorError, NamespaceStateStream, ShardDistributorClient,
    ShardDistributorExecutorClient,
};
use crate::pb;

/// Enforces a hard deadline on every call of the wrapped client.
///
/// For streaming calls the deadline covers establishing the stream, not its
/// lifetime.
pub struct TimeoutClient<C: ?Sized> {
    inner: Arc<C>,
    timeout: Duration,
}

impl<C: ?Sized> TimeoutClient<C> {
    pub fn new(inner: Arc<C>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, DistributorError>>,
    ) -> Result<T, DistributorError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| DistributorError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl<C: ShardDistributorClient + ?Sized> ShardDistributorClient for TimeoutClient<C> {
    async fn get_shard_owner(
        &self,
        request: pb::GetShardOwnerRequest,
    ) -> Result<pb::GetShardOwnerResponse, DistributorError> {
        self.bounded(self.inner.get_shard_owner(request)).await
    }

    async fn watch_namespace_state(
        &self,
        request: pb::WatchNamespaceStateRequest,
    ) -> Result<NamespaceStateStream, DistributorError> {
        self.bounded(self.inner.watch_namespace_state(request)).await
    }
}

#[async_trait]
impl<C: ShardDistributorExecutorClient + ?Sized> ShardDistributorExecutorClient
    for TimeoutClient<C>
{
    async fn heartbeat(
        &self,
        request: pb::HeartbeatRequest,
    ) -> Result<pb::HeartbeatResponse, DistributorError> {
        self.bounded(self.inner.heartbeat(request)).await
    }
}
