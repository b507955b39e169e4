use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{
    DistributorError, NamespaceStateStream, ShardDistributorClient,
    ShardDistributorExecutorClient,
};
use crate::metrics::Metrics;
use crate::pb;

/// Records the outcome and latency of every call without changing results.
pub struct MeteredClient<C: ?Sized> {
    inner: Arc<C>,
    metrics: Metrics,
}

impl<C: ?Sized> MeteredClient<C> {
    pub fn new(inner: Arc<C>, metrics: Metrics) -> Self {
        Self { inner, metrics }
    }

    async fn metered<T>(
        &self,
        method: &str,
        fut: impl Future<Output = Result<T, DistributorError>>,
    ) -> Result<T, DistributorError> {
        let start = Instant::now();
        let result = fut.await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        self.metrics
            .record_distributor_request(method, outcome, start.elapsed().as_secs_f64());
        result
    }
}

#[async_trait]
impl<C: ShardDistributorClient + ?Sized> ShardDistributorClient for MeteredClient<C> {
    async fn get_shard_owner(
        &self,
        request: pb::GetShardOwnerRequest,
    ) -> Result<pb::GetShardOwnerResponse, DistributorError> {
        self.metered("GetShardOwner", self.inner.get_shard_owner(request))
            .await
    }

    async fn watch_namespace_state(
        &self,
        request: pb::WatchNamespaceStateRequest,
    ) -> Result<NamespaceStateStream, DistributorError> {
        self.metered(
            "WatchNamespaceState",
            self.inner.watch_namespace_state(request),
        )
        .await
    }
}

#[async_trait]
impl<C: ShardDistributorExecutorClient + ?Sized> ShardDistributorExecutorClient
    for MeteredClient<C>
{
    async fn heartbeat(
        &self,
        request: pb::HeartbeatRequest,
    ) -> Result<pb::HeartbeatResponse, DistributorError> {
        self.metered("Heartbeat", self.inner.heartbeat(request)).await
    }
}
