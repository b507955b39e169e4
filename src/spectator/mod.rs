//! Cached, continuously refreshed views of shard ownership.
//!
//! One [`Spectator`] runs per namespace. It subscribes to the distributor's
//! ownership snapshots and answers "who owns shard K" from memory.
//! [`Spectators`] groups them so that startup failures are collected per
//! namespace instead of aborting at the first one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info};

use crate::distributor::{DistributorError, ShardDistributorClient};
use crate::metrics::Metrics;
use crate::settings::{MigrationMode, NamespaceConfig};

mod view;
mod watcher;

pub use view::{OwnershipView, ShardOwner, SnapshotError};
pub use watcher::{SpectatorImpl, WatchBackoff};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SpectatorError {
    #[error("ownership view for namespace {namespace} is not ready")]
    NotReady { namespace: String },
    #[error("no owner known for shard {shard_key} in namespace {namespace}")]
    ShardNotFound { namespace: String, shard_key: String },
    #[error("spectator for namespace {namespace} is shutting down")]
    ShuttingDown { namespace: String },
    #[error("no spectator for namespace {0}")]
    NamespaceNotFound(String),
    #[error("spectator for namespace {namespace} failed to start: {source}")]
    Startup {
        namespace: String,
        #[source]
        source: DistributorError,
    },
}

/// Read side of one namespace's ownership view.
#[async_trait]
pub trait Spectator: Send + Sync {
    fn namespace(&self) -> &str;

    /// Begin refreshing and wait for the first view. Returns an error if the
    /// subscription fails fatally or the spectator is stopped while waiting.
    async fn start(&self) -> Result<(), SpectatorError>;

    /// Halt refreshing and wait for the refresh task to exit. Idempotent.
    async fn stop(&self);

    /// Look up a shard in the current view. Never performs I/O.
    fn get_shard_owner(&self, shard_key: &str) -> Result<Arc<ShardOwner>, SpectatorError>;
}

/// Every failure from [`Spectators::start`], keyed by namespace.
#[derive(Debug, thiserror::Error)]
pub struct SpectatorsStartError {
    pub failures: Vec<(String, SpectatorError)>,
}

impl std::fmt::Display for SpectatorsStartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} spectator(s) failed to start:", self.failures.len())?;
        for (namespace, err) in &self.failures {
            write!(f, " [{namespace}: {err}]")?;
        }
        Ok(())
    }
}

/// The set of spectators, one per namespace the distributor manages.
#[derive(Clone, Default)]
pub struct Spectators {
    by_namespace: HashMap<String, Arc<dyn Spectator>>,
}

impl Spectators {
    pub fn new(spectators: impl IntoIterator<Item = Arc<dyn Spectator>>) -> Self {
        Self {
            by_namespace: spectators
                .into_iter()
                .map(|s| (s.namespace().to_string(), s))
                .collect(),
        }
    }

    /// Build a watching spectator for every namespace the distributor is
    /// consulted for. Pure local-passthrough namespaces are skipped.
    pub fn from_config(
        namespaces: &[NamespaceConfig],
        client: Arc<dyn ShardDistributorClient>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self::new(
            namespaces
                .iter()
                .filter(|ns| ns.migration_mode != MigrationMode::LocalPassthrough)
                .map(|ns| {
                    Arc::new(SpectatorImpl::new(
                        ns.name.clone(),
                        client.clone(),
                        metrics.clone(),
                    )) as Arc<dyn Spectator>
                }),
        )
    }

    pub fn for_namespace(&self, namespace: &str) -> Result<&Arc<dyn Spectator>, SpectatorError> {
        self.by_namespace
            .get(namespace)
            .ok_or_else(|| SpectatorError::NamespaceNotFound(namespace.to_string()))
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.by_namespace.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_namespace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_namespace.is_empty()
    }

    /// Start all spectators concurrently. One namespace failing does not stop
    /// the others from starting; every failure is reported.
    pub async fn start(&self) -> Result<(), SpectatorsStartError> {
        let results = join_all(self.by_namespace.iter().map(|(ns, s)| async move {
            debug!(namespace = %ns, "starting spectator");
            (ns.clone(), s.start().await)
        }))
        .await;

        let mut failures: Vec<(String, SpectatorError)> = results
            .into_iter()
            .filter_map(|(ns, r)| r.err().map(|e| (ns, e)))
            .collect();
        if failures.is_empty() {
            info!(count = self.by_namespace.len(), "spectators started");
            return Ok(());
        }
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        Err(SpectatorsStartError { failures })
    }

    pub async fn stop(&self) {
        join_all(self.by_namespace.values().map(|s| s.stop())).await;
    }
}

/// Resubscribe delays used when the ownership stream breaks.
pub(crate) const DEFAULT_WATCH_BACKOFF: WatchBackoff = WatchBackoff {
    initial: Duration::from_millis(100),
    max: Duration::from_secs(5),
};
