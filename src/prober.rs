//! Periodic ownership prober.
//!
//! Each tick draws one shard key, pings its owner and logs what happened.
//! Ticks are sequential, so at most one probe per prober is in flight, and the
//! wait between ticks is re-jittered every time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::info;

use crate::canary_client::CanaryClient;
use crate::lifecycle::{BackgroundTask, sleep_or_shutdown};
use crate::metrics::Metrics;
use crate::probe::{self, ProbeOutcome};
use crate::retry::jittered;
use crate::settings::CanaryConfig;
use crate::shard_key::ShardKeyGenerator;

#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub namespace: String,
    pub keys: ShardKeyGenerator,
    pub interval: Duration,
    /// Fraction of `interval` by which each wait is perturbed
    pub jitter: f64,
    pub ping_timeout: Duration,
}

impl ProberConfig {
    /// Prober over the fixed shard pool.
    pub fn fixed(canary: &CanaryConfig) -> Self {
        Self {
            namespace: canary.fixed_namespace.clone(),
            keys: ShardKeyGenerator::fixed(canary.num_fixed_shards),
            interval: canary.ping_interval(),
            jitter: canary.ping_jitter,
            ping_timeout: canary.ping_timeout(),
        }
    }
}

struct ProberInner {
    config: ProberConfig,
    client: Arc<dyn CanaryClient>,
    metrics: Option<Metrics>,
}

pub struct Prober {
    inner: Arc<ProberInner>,
    task: Mutex<Option<BackgroundTask>>,
}

impl Prober {
    pub fn new(config: ProberConfig, client: Arc<dyn CanaryClient>, metrics: Option<Metrics>) -> Self {
        Self {
            inner: Arc::new(ProberInner {
                config,
                client,
                metrics,
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the probe loop. It keeps running after the caller returns, until
    /// [`Prober::stop`]. Starting twice is a no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(BackgroundTask::spawn("prober", move |shutdown_rx| {
            inner.run(shutdown_rx)
        }));
        info!(namespace = %self.inner.config.namespace, "prober started");
    }

    /// Stop the loop and wait for it to exit. Safe to call more than once;
    /// a later `start` runs a fresh loop.
    pub async fn stop(&self) {
        let mut slot = self.task.lock().await;
        if let Some(task) = slot.take() {
            task.stop().await;
            info!(namespace = %self.inner.config.namespace, "prober stopped");
        }
    }

    /// Probe one shard right now.
    pub async fn probe_once(&self, shard_key: &str) -> ProbeOutcome {
        self.inner.probe(shard_key).await
    }
}

impl ProberInner {
    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let wait = jittered(self.config.interval, self.config.jitter);
            if sleep_or_shutdown(&mut shutdown_rx, wait).await {
                return;
            }
            let shard_key = self.config.keys.next_key();
            self.probe(&shard_key).await;
        }
    }

    async fn probe(&self, shard_key: &str) -> ProbeOutcome {
        let started = Instant::now();
        let outcome = probe::ping_shard(
            self.client.as_ref(),
            &self.config.namespace,
            shard_key,
            self.config.ping_timeout,
        )
        .await;
        probe::report(&self.config.namespace, shard_key, &outcome, true);
        probe::record(
            self.metrics.as_ref(),
            &self.config.namespace,
            self.config.keys.kind(),
            &outcome,
            started,
        );
        outcome
    }
}
