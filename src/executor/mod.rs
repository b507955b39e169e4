//! Per-namespace executors: the shard processors this canary runs and the
//! heartbeat that keeps them in line with the distributor.
//!
//! The ping handler only needs [`ShardOwnership`]; everything else here exists
//! so that the canary actually holds the shards the distributor assigns it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::distributor::{DistributorError, ShardDistributorExecutorClient};
use crate::lifecycle::{BackgroundTask, sleep_or_shutdown};
use crate::metrics::Metrics;
use crate::pb;
use crate::retry::jittered;
use crate::settings::{MigrationMode, NamespaceConfig};

mod processor;

pub use processor::{ProcessorKind, ShardProcessor};

/// Local knowledge of which shards this process holds in one namespace.
pub trait ShardOwnership: Send + Sync {
    fn namespace(&self) -> &str;

    /// Metadata advertised to the distributor, including the gRPC address.
    fn metadata(&self) -> &HashMap<String, String>;

    /// Whether a live processor exists for `shard_key`. Purely local.
    fn has_shard(&self, shard_key: &str) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("more than one executor registered for namespace {0}")]
    DuplicateNamespace(String),
}

/// Namespace → executor lookup, built once and read-only afterwards.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ShardOwnership>>,
}

impl ExecutorRegistry {
    pub fn new(
        executors: impl IntoIterator<Item = Arc<dyn ShardOwnership>>,
    ) -> Result<Self, RegistryError> {
        let mut map = HashMap::new();
        for executor in executors {
            let namespace = executor.namespace().to_string();
            if map.insert(namespace.clone(), executor).is_some() {
                return Err(RegistryError::DuplicateNamespace(namespace));
            }
        }
        Ok(Self { executors: map })
    }

    /// Exact-match lookup.
    pub fn get(&self, namespace: &str) -> Option<&Arc<dyn ShardOwnership>> {
        self.executors.get(namespace)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// Static settings for one executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub namespace: String,
    pub executor_id: String,
    pub migration_mode: MigrationMode,
    pub heartbeat_interval: Duration,
    pub metadata: HashMap<String, String>,
    pub processor_kind: ProcessorKind,
}

impl ExecutorConfig {
    pub fn from_namespace(
        ns: &NamespaceConfig,
        executor_id: impl Into<String>,
        metadata: HashMap<String, String>,
        processor_kind: ProcessorKind,
    ) -> Self {
        Self {
            namespace: ns.name.clone(),
            executor_id: executor_id.into(),
            migration_mode: ns.migration_mode,
            heartbeat_interval: ns.heartbeat_interval(),
            metadata,
            processor_kind,
        }
    }
}

struct ExecutorInner {
    config: ExecutorConfig,
    mode: RwLock<MigrationMode>,
    client: Arc<dyn ShardDistributorExecutorClient>,
    metrics: Option<Metrics>,
    processors: RwLock<HashMap<String, Arc<ShardProcessor>>>,
}

pub struct Executor {
    inner: Arc<ExecutorInner>,
    task: Mutex<Option<BackgroundTask>>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        client: Arc<dyn ShardDistributorExecutorClient>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                mode: RwLock::new(config.migration_mode),
                config,
                client,
                metrics,
                processors: RwLock::new(HashMap::new()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn executor_id(&self) -> &str {
        &self.inner.config.executor_id
    }

    pub fn migration_mode(&self) -> MigrationMode {
        self.inner.mode()
    }

    /// Shard keys with a live processor, sorted.
    pub fn shard_keys(&self) -> Vec<String> {
        self.inner.processors_read().keys().cloned().collect::<BTreeSet<_>>().into_iter().collect()
    }

    /// Start the heartbeat loop. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(BackgroundTask::spawn("executor-heartbeat", move |shutdown_rx| {
            inner.heartbeat_loop(shutdown_rx)
        }));
        info!(
            namespace = %self.inner.config.namespace,
            executor_id = %self.inner.config.executor_id,
            migration_mode = %self.inner.mode(),
            "executor started"
        );
    }

    /// Stop heartbeating, tell the distributor we are draining, then stop
    /// every processor. Idempotent.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        if let Some(running) = task.take() {
            running.stop().await;
            if self.inner.mode().heartbeats()
                && let Err(e) = self.inner.heartbeat_once(pb::ExecutorStatus::Draining).await
            {
                warn!(namespace = %self.inner.config.namespace, error = %e, "draining heartbeat failed");
            }
        }

        let drained: Vec<Arc<ShardProcessor>> =
            self.inner.processors_write().drain().map(|(_, p)| p).collect();
        join_all(drained.iter().map(|p| p.stop())).await;
        self.inner.record_owned();
        info!(namespace = %self.inner.config.namespace, "executor stopped");
    }

    /// Send one heartbeat and apply the answer.
    pub async fn heartbeat(&self) -> Result<(), DistributorError> {
        self.inner.heartbeat_once(pb::ExecutorStatus::Active).await
    }

    /// Start processors for shards assigned outside the distributor. Only
    /// meaningful in passthrough and shadow modes; under ONBOARDED or
    /// DISTRIBUTED_PASSTHROUGH the next heartbeat reconciles the set against
    /// the distributor.
    pub fn assign_shards_locally(&self, shard_keys: impl IntoIterator<Item = String>) {
        self.inner.start_processors(shard_keys);
    }

    pub async fn remove_shards_locally(&self, shard_keys: impl IntoIterator<Item = String>) {
        self.inner.stop_processors(shard_keys).await;
    }
}

impl ShardOwnership for Executor {
    fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.inner.config.metadata
    }

    fn has_shard(&self, shard_key: &str) -> bool {
        self.inner.processors_read().contains_key(shard_key)
    }
}

impl ExecutorInner {
    fn mode(&self) -> MigrationMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn processors_read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ShardProcessor>>> {
        self.processors.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn processors_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ShardProcessor>>> {
        self.processors.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        loop {
            if sleep_or_shutdown(&mut shutdown_rx, jittered(self.config.heartbeat_interval, 0.1)).await {
                return;
            }
            if !self.mode().heartbeats() {
                continue;
            }
            if let Err(e) = self.heartbeat_once(pb::ExecutorStatus::Active).await {
                warn!(
                    namespace = %self.config.namespace,
                    executor_id = %self.config.executor_id,
                    error = %e,
                    "heartbeat failed"
                );
            }
        }
    }

    async fn heartbeat_once(&self, status: pb::ExecutorStatus) -> Result<(), DistributorError> {
        let shard_status_reports = self
            .processors_read()
            .iter()
            .map(|(key, p)| (key.clone(), p.status_report()))
            .collect();
        let request = pb::HeartbeatRequest {
            namespace: self.config.namespace.clone(),
            executor_id: self.config.executor_id.clone(),
            status: status as i32,
            shard_status_reports,
            metadata: self.config.metadata.clone(),
        };
        let response = self.client.heartbeat(request).await?;
        if status == pb::ExecutorStatus::Active {
            self.apply_heartbeat_response(response).await;
        }
        Ok(())
    }

    async fn apply_heartbeat_response(&self, response: pb::HeartbeatResponse) {
        if let Some(mode) = MigrationMode::from_proto(response.migration_mode())
            && mode != self.mode()
        {
            info!(
                namespace = %self.config.namespace,
                from = %self.mode(),
                to = %mode,
                "migration mode changed"
            );
            *self.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
        }

        let assigned: HashSet<String> = response
            .shard_assignments
            .iter()
            .filter(|(_, a)| a.status() == pb::AssignmentStatus::Ready)
            .map(|(key, _)| key.clone())
            .collect();
        let local: HashSet<String> = self.processors_read().keys().cloned().collect();

        let mode = self.mode();
        if mode.is_shadow() {
            let missing: BTreeSet<&String> = assigned.difference(&local).collect();
            let unexpected: BTreeSet<&String> = local.difference(&assigned).collect();
            if !missing.is_empty() || !unexpected.is_empty() {
                warn!(
                    namespace = %self.config.namespace,
                    missing_locally = ?missing,
                    unexpected_locally = ?unexpected,
                    "distributor assignment differs from local assignment"
                );
            }
        }
        if !mode.distributor_authoritative() {
            return;
        }

        let to_start: Vec<String> = assigned.difference(&local).cloned().collect();
        let to_stop: Vec<String> = local.difference(&assigned).cloned().collect();
        if !to_start.is_empty() || !to_stop.is_empty() {
            debug!(
                namespace = %self.config.namespace,
                starting = to_start.len(),
                stopping = to_stop.len(),
                "applying shard assignment"
            );
        }
        self.start_processors(to_start);
        self.stop_processors(to_stop).await;
    }

    fn start_processors(&self, shard_keys: impl IntoIterator<Item = String>) {
        {
            let mut processors = self.processors_write();
            for key in shard_keys {
                if processors.contains_key(&key) {
                    continue;
                }
                let processor =
                    ShardProcessor::start(&self.config.namespace, key.clone(), self.config.processor_kind);
                processors.insert(key, Arc::new(processor));
            }
        }
        self.record_owned();
    }

    async fn stop_processors(&self, shard_keys: impl IntoIterator<Item = String>) {
        let removed: Vec<Arc<ShardProcessor>> = {
            let mut processors = self.processors_write();
            shard_keys
                .into_iter()
                .filter_map(|key| processors.remove(&key))
                .collect()
        };
        join_all(removed.iter().map(|p| p.stop())).await;
        self.record_owned();
    }

    fn record_owned(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_executor_shards_owned(&self.config.namespace, self.processors_read().len());
        }
    }
}
