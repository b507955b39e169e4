//! Creates a brand-new shard in each ephemeral namespace every tick.
//!
//! The distributor allocates the shard when asked for its owner; the creator
//! then pings the named owner directly. A negative answer here is expected
//! while the owner has not picked the shard up yet, so it is logged at info.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::info;

use crate::canary_client::{CanaryClient, CanaryClientError};
use crate::distributor::ShardDistributorClient;
use crate::lifecycle::{BackgroundTask, sleep_or_shutdown};
use crate::metrics::Metrics;
use crate::pb;
use crate::probe::{self, ProbeError, ProbeOutcome};
use crate::shard_key::ShardKeyGenerator;
use crate::spectator::ShardOwner;

#[derive(Debug, Clone)]
pub struct ShardCreatorConfig {
    pub namespaces: Vec<String>,
    pub interval: Duration,
    pub ping_timeout: Duration,
}

struct CreatorInner {
    config: ShardCreatorConfig,
    distributor: Arc<dyn ShardDistributorClient>,
    canary: Arc<dyn CanaryClient>,
    metrics: Option<Metrics>,
}

pub struct ShardCreator {
    inner: Arc<CreatorInner>,
    task: Mutex<Option<BackgroundTask>>,
}

impl ShardCreator {
    pub fn new(
        config: ShardCreatorConfig,
        distributor: Arc<dyn ShardDistributorClient>,
        canary: Arc<dyn CanaryClient>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(CreatorInner {
                config,
                distributor,
                canary,
                metrics,
            }),
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(BackgroundTask::spawn("shard-creator", move |shutdown_rx| {
            inner.run(shutdown_rx)
        }));
        info!(namespaces = ?self.inner.config.namespaces, "shard creator started");
    }

    pub async fn stop(&self) {
        let mut slot = self.task.lock().await;
        if let Some(task) = slot.take() {
            task.stop().await;
            info!("shard creator stopped");
        }
    }

    /// Create one shard in `namespace` and probe it.
    pub async fn create_shard(&self, namespace: &str) -> (String, ProbeOutcome) {
        self.inner.create_shard(namespace).await
    }
}

impl CreatorInner {
    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if sleep_or_shutdown(&mut shutdown_rx, self.config.interval).await {
                return;
            }
            // one namespace failing never skips the rest
            for namespace in &self.config.namespaces {
                self.create_shard(namespace).await;
            }
        }
    }

    async fn create_shard(&self, namespace: &str) -> (String, ProbeOutcome) {
        let shard_key = ShardKeyGenerator::Ephemeral.next_key();
        info!(namespace = %namespace, shard_key = %shard_key, "creating shard");

        let started = Instant::now();
        let outcome = match self.allocate(namespace, &shard_key).await {
            Ok(address) => self.ping_owner(&address, namespace, &shard_key).await,
            Err(e) => ProbeOutcome::Failed(e),
        };
        probe::report(namespace, &shard_key, &outcome, false);
        probe::record(
            self.metrics.as_ref(),
            namespace,
            ShardKeyGenerator::Ephemeral.kind(),
            &outcome,
            started,
        );
        (shard_key, outcome)
    }

    /// Ask the distributor for the owner, which allocates the shard.
    async fn allocate(&self, namespace: &str, shard_key: &str) -> Result<String, ProbeError> {
        let response = self
            .distributor
            .get_shard_owner(pb::GetShardOwnerRequest {
                namespace: namespace.to_string(),
                shard_key: shard_key.to_string(),
            })
            .await?;
        let owner = ShardOwner::new(response.owner, response.metadata);
        owner
            .grpc_address()
            .map(str::to_string)
            .ok_or(ProbeError::MissingAddress(owner.executor_id))
    }

    async fn ping_owner(&self, address: &str, namespace: &str, shard_key: &str) -> ProbeOutcome {
        let request = pb::PingRequest {
            namespace: namespace.to_string(),
            shard_key: shard_key.to_string(),
        };
        let timeout = self.config.ping_timeout;
        match tokio::time::timeout(timeout, self.canary.ping_peer(address, request)).await {
            Ok(Ok(response)) => ProbeOutcome::from_response(response),
            Ok(Err(e)) => ProbeOutcome::Failed(e.into()),
            Err(_) => ProbeOutcome::Failed(CanaryClientError::Timeout(timeout).into()),
        }
    }
}
