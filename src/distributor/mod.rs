//! Clients for the shard distributor service.
//!
//! Every outbound call goes through a fixed stack of decorators, each with the
//! same interface as the client it wraps:
//!
//! 1. [`grpc::GrpcDistributorClient`]: raw tonic transport
//! 2. [`timeout::TimeoutClient`]: hard per-call deadline
//! 3. [`metered::MeteredClient`]: outcome and latency metrics
//! 4. [`retryable::RetryableClient`]: capped exponential backoff on transient
//!    errors (spectator-facing calls only)
//!
//! Use [`build_spectator_client`] and [`build_executor_client`] to get the
//! composed stacks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::metrics::Metrics;
use crate::pb;
use crate::retry::RetryPolicy;

pub mod grpc;
pub mod metered;
pub mod retryable;
pub mod timeout;

pub use grpc::GrpcDistributorClient;
pub use metered::MeteredClient;
pub use retryable::RetryableClient;
pub use timeout::TimeoutClient;

/// Error type for shard distributor calls
#[derive(Debug, Clone, thiserror::Error)]
pub enum DistributorError {
    #[error("rpc failed: {}: {}", .0.code(), .0.message())]
    Rpc(tonic::Status),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl DistributorError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DistributorError::Rpc(status) => matches!(
                status.code(),
                tonic::Code::Unavailable
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::ResourceExhausted
                    | tonic::Code::Aborted
                    | tonic::Code::Unknown
                    | tonic::Code::Internal
                    | tonic::Code::Cancelled
            ),
            DistributorError::Connection(_) => true,
            DistributorError::Timeout(_) => true,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DistributorError::Rpc(_) => "rpc_error",
            DistributorError::Connection(_) => "connection_error",
            DistributorError::Timeout(_) => "timeout",
        }
    }
}

impl From<tonic::Status> for DistributorError {
    fn from(status: tonic::Status) -> Self {
        DistributorError::Rpc(status)
    }
}

impl From<tonic::transport::Error> for DistributorError {
    fn from(e: tonic::transport::Error) -> Self {
        DistributorError::Connection(e.to_string())
    }
}

/// Full ownership snapshots for one namespace, as streamed by the distributor.
pub type NamespaceStateStream =
    BoxStream<'static, Result<pb::WatchNamespaceStateResponse, DistributorError>>;

/// Spectator-facing side of the shard distributor.
#[async_trait]
pub trait ShardDistributorClient: Send + Sync {
    /// Resolve (and for ephemeral namespaces, allocate) the owner of a shard.
    async fn get_shard_owner(
        &self,
        request: pb::GetShardOwnerRequest,
    ) -> Result<pb::GetShardOwnerResponse, DistributorError>;

    /// Subscribe to ownership snapshots for a namespace.
    async fn watch_namespace_state(
        &self,
        request: pb::WatchNamespaceStateRequest,
    ) -> Result<NamespaceStateStream, DistributorError>;
}

/// Executor-facing side of the shard distributor.
#[async_trait]
pub trait ShardDistributorExecutorClient: Send + Sync {
    async fn heartbeat(
        &self,
        request: pb::HeartbeatRequest,
    ) -> Result<pb::HeartbeatResponse, DistributorError>;
}

/// Compose timeout, metrics and retry layers around a raw spectator client.
pub fn build_spectator_client(
    raw: Arc<dyn ShardDistributorClient>,
    timeout: Duration,
    metrics: Option<Metrics>,
    retry_policy: RetryPolicy,
) -> Arc<dyn ShardDistributorClient> {
    let mut client: Arc<dyn ShardDistributorClient> = Arc::new(TimeoutClient::new(raw, timeout));
    if let Some(metrics) = metrics {
        client = Arc::new(MeteredClient::new(client, metrics));
    }
    Arc::new(RetryableClient::new(
        client,
        retry_policy,
        DistributorError::is_transient,
    ))
}

/// Compose timeout and metrics layers around a raw executor client.
///
/// Heartbeats are not retried; the next heartbeat interval is the retry.
pub fn build_executor_client(
    raw: Arc<dyn ShardDistributorExecutorClient>,
    timeout: Duration,
    metrics: Option<Metrics>,
) -> Arc<dyn ShardDistributorExecutorClient> {
    let client: Arc<dyn ShardDistributorExecutorClient> =
        Arc::new(TimeoutClient::new(raw, timeout));
    match metrics {
        Some(metrics) => Arc::new(MeteredClient::new(client, metrics)),
        None => client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(DistributorError::Rpc(tonic::Status::unavailable("down")).is_transient());
        assert!(DistributorError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(DistributorError::Connection("refused".into()).is_transient());
        assert!(
            !DistributorError::Rpc(tonic::Status::invalid_argument("bad namespace"))
                .is_transient()
        );
        assert!(!DistributorError::Rpc(tonic::Status::not_found("no such ns")).is_transient());
    }
}
