use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::lifecycle::{BackgroundTask, sleep_or_shutdown};
use crate::pb;
use crate::retry::jittered;

/// How often a fixed processor reports that it is alive.
const PROCESS_INTERVAL: Duration = Duration::from_secs(10);

/// What kind of work a processor does for its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    /// Runs until the shard is taken away.
    Fixed,
    /// Finishes after roughly `lifetime` and reports the shard as done so the
    /// distributor can reclaim it.
    Ephemeral { lifetime: Duration },
}

impl ProcessorKind {
    pub const DEFAULT_EPHEMERAL_LIFETIME: Duration = Duration::from_secs(30);

    pub fn ephemeral() -> Self {
        ProcessorKind::Ephemeral {
            lifetime: Self::DEFAULT_EPHEMERAL_LIFETIME,
        }
    }
}

/// The live unit of work for one shard on this executor.
pub struct ShardProcessor {
    shard_key: String,
    done: Arc<AtomicBool>,
    task: BackgroundTask,
}

impl ShardProcessor {
    pub fn start(namespace: &str, shard_key: impl Into<String>, kind: ProcessorKind) -> Self {
        let shard_key = shard_key.into();
        let done = Arc::new(AtomicBool::new(false));
        let task = {
            let namespace = namespace.to_string();
            let shard_key = shard_key.clone();
            let done = done.clone();
            BackgroundTask::spawn("shard-processor", move |mut shutdown_rx| async move {
                debug!(namespace = %namespace, shard_key = %shard_key, "shard processor started");
                match kind {
                    ProcessorKind::Fixed => {
                        while !sleep_or_shutdown(&mut shutdown_rx, PROCESS_INTERVAL).await {
                            debug!(namespace = %namespace, shard_key = %shard_key, "processing shard");
                        }
                    }
                    ProcessorKind::Ephemeral { lifetime } => {
                        if !sleep_or_shutdown(&mut shutdown_rx, jittered(lifetime, 0.5)).await {
                            done.store(true, Ordering::Release);
                            info!(namespace = %namespace, shard_key = %shard_key, "ephemeral shard finished");
                        }
                    }
                }
            })
        };
        Self {
            shard_key,
            done,
            task,
        }
    }

    pub fn shard_key(&self) -> &str {
        &self.shard_key
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn status_report(&self) -> pb::ShardStatusReport {
        if self.is_done() {
            pb::ShardStatusReport {
                status: pb::ShardStatus::Done as i32,
                shard_load: 0.0,
            }
        } else {
            pb::ShardStatusReport {
                status: pb::ShardStatus::Ready as i32,
                shard_load: 1.0,
            }
        }
    }

    pub async fn stop(&self) {
        self.task.stop().await;
    }
}
