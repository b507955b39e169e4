//! A single ownership probe and how its result is reported.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::canary_client::{CanaryClient, CanaryClientError};
use crate::distributor::DistributorError;
use crate::metrics::Metrics;
use crate::pb;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Ping(#[from] CanaryClientError),
    #[error("shard allocation failed: {0}")]
    Allocation(#[from] DistributorError),
    #[error("owner {0} did not advertise a gRPC address")]
    MissingAddress(String),
}

#[derive(Debug)]
pub enum ProbeOutcome {
    /// The peer confirmed it owns the shard.
    Owned { executor_id: String },
    /// The peer answered but does not own the shard.
    NotOwned { executor_id: String },
    /// No answer was obtained.
    Failed(ProbeError),
}

impl ProbeOutcome {
    pub fn from_response(response: pb::PingResponse) -> Self {
        if response.owns_shard {
            ProbeOutcome::Owned {
                executor_id: response.executor_id,
            }
        } else {
            ProbeOutcome::NotOwned {
                executor_id: response.executor_id,
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Owned { .. } => "owned",
            ProbeOutcome::NotOwned { .. } => "not_owned",
            ProbeOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, ProbeOutcome::Owned { .. })
    }
}

/// Ping whichever peer owns `shard_key`, giving up after `timeout`.
pub async fn ping_shard(
    client: &dyn CanaryClient,
    namespace: &str,
    shard_key: &str,
    timeout: Duration,
) -> ProbeOutcome {
    let request = pb::PingRequest {
        namespace: namespace.to_string(),
        shard_key: shard_key.to_string(),
    };
    match tokio::time::timeout(timeout, client.ping(request)).await {
        Ok(Ok(response)) => ProbeOutcome::from_response(response),
        Ok(Err(e)) => ProbeOutcome::Failed(e.into()),
        Err(_) => ProbeOutcome::Failed(CanaryClientError::Timeout(timeout).into()),
    }
}

/// Log a probe result. `expect_owned` is false for shards that may not be
/// allocated yet, where a negative answer is not a finding.
pub fn report(namespace: &str, shard_key: &str, outcome: &ProbeOutcome, expect_owned: bool) {
    match outcome {
        ProbeOutcome::Owned { executor_id } => {
            info!(namespace = %namespace, shard_key = %shard_key, executor_id = %executor_id, "successfully pinged shard owner");
        }
        ProbeOutcome::NotOwned { executor_id } if expect_owned => {
            warn!(namespace = %namespace, shard_key = %shard_key, executor_id = %executor_id, "executor does not own shard");
        }
        ProbeOutcome::NotOwned { executor_id } => {
            info!(namespace = %namespace, shard_key = %shard_key, executor_id = %executor_id, "new shard not yet owned by executor");
        }
        ProbeOutcome::Failed(e) => {
            error!(namespace = %namespace, shard_key = %shard_key, error = %e, "failed to ping shard");
        }
    }
}

pub(crate) fn record(
    metrics: Option<&Metrics>,
    namespace: &str,
    kind: &str,
    outcome: &ProbeOutcome,
    started: Instant,
) {
    if let Some(metrics) = metrics {
        metrics.record_probe(namespace, kind, outcome.label(), started.elapsed().as_secs_f64());
    }
}
