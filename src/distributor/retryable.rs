use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::{DistributorError, NamespaceStateStream, ShardDistributorClient};
use crate::pb;
use crate::retry::{RetryPolicy, next_retry_delay};

/// Decides whether an error is worth another attempt.
pub type RetryClassifier = fn(&DistributorError) -> bool;

/// Retries calls that fail with a retryable error, sleeping between attempts
/// according to the policy. Other errors are returned immediately.
pub struct RetryableClient<C: ?Sized> {
    inner: Arc<C>,
    policy: RetryPolicy,
    is_retryable: RetryClassifier,
}

impl<C: ?Sized> RetryableClient<C> {
    pub fn new(inner: Arc<C>, policy: RetryPolicy, is_retryable: RetryClassifier) -> Self {
        Self {
            inner,
            policy,
            is_retryable,
        }
    }

    async fn with_retries<T, F, Fut>(&self, method: &str, mut op: F) -> Result<T, DistributorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DistributorError>>,
    {
        let start = Instant::now();
        let mut failures = 0u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !(self.is_retryable)(&err) {
                return Err(err);
            }
            failures += 1;
            let Some(delay) = next_retry_delay(failures, start.elapsed(), &self.policy) else {
                debug!(method, attempts = failures, error = %err, "giving up on distributor call");
                return Err(err);
            };
            debug!(method, attempt = failures, delay_ms = delay.as_millis() as u64, error = %err, "retrying distributor call");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl<C: ShardDistributorClient + ?Sized> ShardDistributorClient for RetryableClient<C> {
    async fn get_shard_owner(
        &self,
        request: pb::GetShardOwnerRequest,
    ) -> Result<pb::GetShardOwnerResponse, DistributorError> {
        self.with_retries("GetShardOwner", || {
            self.inner.get_shard_owner(request.clone())
        })
        .await
    }

    async fn watch_namespace_state(
        &self,
        request: pb::WatchNamespaceStateRequest,
    ) -> Result<NamespaceStateStream, DistributorError> {
        self.with_retries("WatchNamespaceState", || {
            self.inner.watch_namespace_state(request.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` calls with `error`, then succeeds.
    struct Flaky {
        failures: u32,
        error: DistributorError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ShardDistributorClient for Flaky {
        async fn get_shard_owner(
            &self,
            request: pb::GetShardOwnerRequest,
        ) -> Result<pb::GetShardOwnerResponse, DistributorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            Ok(pb::GetShardOwnerResponse {
                owner: "exec-1".to_string(),
                namespace: request.namespace,
                metadata: Default::default(),
            })
        }

        async fn watch_namespace_state(
            &self,
            _request: pb::WatchNamespaceStateRequest,
        ) -> Result<NamespaceStateStream, DistributorError> {
            Err(self.error.clone())
        }
    }

    fn request() -> pb::GetShardOwnerRequest {
        pb::GetShardOwnerRequest {
            namespace: "ns".to_string(),
            shard_key: "1".to_string(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: Some(10),
            initial_interval_ms: Some(10),
            max_interval_ms: Some(40),
            backoff_factor: Some(2.0),
            expiration_ms: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success_use_n_plus_one_attempts() {
        let inner = Arc::new(Flaky {
            failures: 3,
            error: DistributorError::Rpc(tonic::Status::unavailable("down")),
            calls: AtomicU32::new(0),
        });
        let client = RetryableClient::new(inner.clone(), policy(), DistributorError::is_transient);

        let start = Instant::now();
        let resp = client.get_shard_owner(request()).await.unwrap();
        assert_eq!(resp.owner, "exec-1");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
        // 10 + 20 + 40 ms of backoff
        assert_eq!(start.elapsed(), Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_are_not_retried() {
        let inner = Arc::new(Flaky {
            failures: 5,
            error: DistributorError::Rpc(tonic::Status::invalid_argument("unknown namespace")),
            calls: AtomicU32::new(0),
        });
        let client = RetryableClient::new(inner.clone(), policy(), DistributorError::is_transient);

        let err = client.get_shard_owner(request()).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_policy_is_exhausted() {
        let inner = Arc::new(Flaky {
            failures: u32::MAX,
            error: DistributorError::Timeout(Duration::from_secs(1)),
            calls: AtomicU32::new(0),
        });
        let mut p = policy();
        p.max_attempts = Some(3);
        let client = RetryableClient::new(inner.clone(), p, DistributorError::is_transient);

        assert!(client.watch_namespace_state(pb::WatchNamespaceStateRequest {
            namespace: "ns".to_string(),
        })
        .await
        .is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }
}
