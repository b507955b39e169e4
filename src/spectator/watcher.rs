use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use super::{DEFAULT_WATCH_BACKOFF, OwnershipView, ShardOwner, Spectator, SpectatorError};
use crate::distributor::{DistributorError, NamespaceStateStream, ShardDistributorClient};
use crate::lifecycle::{BackgroundTask, sleep_or_shutdown, wait_for_shutdown};
use crate::metrics::Metrics;
use crate::pb;
use crate::retry::jittered;

/// Delays between resubscription attempts after the ownership stream breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchBackoff {
    pub initial: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone)]
enum ViewState {
    Pending,
    Ready(Arc<OwnershipView>),
    Failed(DistributorError),
    Stopped,
}

struct Inner {
    namespace: String,
    client: Arc<dyn ShardDistributorClient>,
    metrics: Option<Metrics>,
    backoff: WatchBackoff,
    // single writer: the refresh task (and stop(), after the task has exited)
    state_tx: watch::Sender<ViewState>,
}

/// Spectator backed by the distributor's `WatchNamespaceState` stream.
pub struct SpectatorImpl {
    inner: Arc<Inner>,
    task: Mutex<Option<BackgroundTask>>,
}

impl SpectatorImpl {
    pub fn new(
        namespace: impl Into<String>,
        client: Arc<dyn ShardDistributorClient>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self::with_backoff(namespace, client, metrics, DEFAULT_WATCH_BACKOFF)
    }

    pub fn with_backoff(
        namespace: impl Into<String>,
        client: Arc<dyn ShardDistributorClient>,
        metrics: Option<Metrics>,
        backoff: WatchBackoff,
    ) -> Self {
        let (state_tx, _) = watch::channel(ViewState::Pending);
        Self {
            inner: Arc::new(Inner {
                namespace: namespace.into(),
                client,
                metrics,
                backoff,
                state_tx,
            }),
            task: Mutex::new(None),
        }
    }

    /// The current view, if one has been received.
    pub fn view(&self) -> Option<Arc<OwnershipView>> {
        match &*self.inner.state_tx.borrow() {
            ViewState::Ready(view) => Some(view.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl Spectator for SpectatorImpl {
    fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    async fn start(&self) -> Result<(), SpectatorError> {
        {
            let mut task = self.task.lock().await;
            if matches!(*self.inner.state_tx.borrow(), ViewState::Stopped) {
                return Err(SpectatorError::ShuttingDown {
                    namespace: self.inner.namespace.clone(),
                });
            }
            if task.is_none() {
                let inner = self.inner.clone();
                *task = Some(BackgroundTask::spawn("spectator", move |shutdown_rx| {
                    inner.run(shutdown_rx)
                }));
            }
        }

        let mut state_rx = self.inner.state_tx.subscribe();
        let state = match state_rx
            .wait_for(|s| !matches!(s, ViewState::Pending))
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => ViewState::Stopped,
        };
        match state {
            ViewState::Ready(view) => {
                info!(
                    namespace = %self.inner.namespace,
                    shards = view.shard_count(),
                    "spectator ready"
                );
                Ok(())
            }
            ViewState::Failed(source) => Err(SpectatorError::Startup {
                namespace: self.inner.namespace.clone(),
                source,
            }),
            ViewState::Stopped | ViewState::Pending => Err(SpectatorError::ShuttingDown {
                namespace: self.inner.namespace.clone(),
            }),
        }
    }

    async fn stop(&self) {
        let task = self.task.lock().await;
        if let Some(task) = task.as_ref() {
            task.stop().await;
        }
        self.inner.state_tx.send_replace(ViewState::Stopped);
        debug!(namespace = %self.inner.namespace, "spectator stopped");
    }

    fn get_shard_owner(&self, shard_key: &str) -> Result<Arc<ShardOwner>, SpectatorError> {
        match &*self.inner.state_tx.borrow() {
            ViewState::Ready(view) => {
                view.owner(shard_key)
                    .cloned()
                    .ok_or_else(|| SpectatorError::ShardNotFound {
                        namespace: self.inner.namespace.clone(),
                        shard_key: shard_key.to_string(),
                    })
            }
            ViewState::Pending | ViewState::Failed(_) => Err(SpectatorError::NotReady {
                namespace: self.inner.namespace.clone(),
            }),
            ViewState::Stopped => Err(SpectatorError::ShuttingDown {
                namespace: self.inner.namespace.clone(),
            }),
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = self.backoff.initial;
        loop {
            let request = pb::WatchNamespaceStateRequest {
                namespace: self.namespace.clone(),
            };
            let subscribed = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => return,
                r = self.client.watch_namespace_state(request) => r,
            };

            match subscribed {
                Ok(stream) => {
                    let Some(applied) = self.consume(stream, &mut shutdown_rx).await else {
                        return;
                    };
                    if applied > 0 {
                        backoff = self.backoff.initial;
                    }
                }
                Err(e) => {
                    self.record_refresh("subscribe_error");
                    if !e.is_transient() && self.is_pending() {
                        error!(namespace = %self.namespace, error = %e, "ownership subscription failed");
                        self.state_tx.send_replace(ViewState::Failed(e));
                        return;
                    }
                    warn!(namespace = %self.namespace, error = %e, "failed to subscribe to ownership updates");
                }
            }

            if sleep_or_shutdown(&mut shutdown_rx, jittered(backoff, 0.1)).await {
                return;
            }
            backoff = (backoff * 2).min(self.backoff.max);
        }
    }

    /// Apply snapshots until the stream ends. Returns `None` on shutdown,
    /// otherwise how many snapshots were applied.
    async fn consume(
        &self,
        mut stream: NamespaceStateStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<usize> {
        let mut applied = 0;
        loop {
            let item = tokio::select! {
                _ = wait_for_shutdown(shutdown_rx) => return None,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(snapshot)) => {
                    if self.apply(&snapshot) {
                        applied += 1;
                    }
                }
                Some(Err(e)) => {
                    self.record_refresh("stream_error");
                    warn!(namespace = %self.namespace, error = %e, "ownership stream failed");
                    return Some(applied);
                }
                None => {
                    debug!(namespace = %self.namespace, "ownership stream closed");
                    return Some(applied);
                }
            }
        }
    }

    fn apply(&self, snapshot: &pb::WatchNamespaceStateResponse) -> bool {
        match OwnershipView::from_snapshot(snapshot) {
            Ok(view) => {
                debug!(
                    namespace = %self.namespace,
                    shards = view.shard_count(),
                    executors = view.executor_count(),
                    "ownership view updated"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_spectator_refresh(&self.namespace, "success");
                    metrics.set_spectator_known_shards(&self.namespace, view.shard_count());
                }
                self.state_tx.send_replace(ViewState::Ready(Arc::new(view)));
                true
            }
            Err(e) => {
                self.record_refresh("rejected");
                warn!(namespace = %self.namespace, error = %e, "rejecting ownership snapshot, keeping previous view");
                false
            }
        }
    }

    fn is_pending(&self) -> bool {
        matches!(*self.state_tx.borrow(), ViewState::Pending)
    }

    fn record_refresh(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_spectator_refresh(&self.namespace, outcome);
        }
    }
}
