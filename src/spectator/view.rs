use std::collections::HashMap;
use std::sync::Arc;

use crate::pb;
use crate::settings::GRPC_ADDRESS_METADATA_KEY;

/// The executor the distributor says holds a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardOwner {
    pub executor_id: String,
    pub metadata: HashMap<String, String>,
}

impl ShardOwner {
    pub fn new(executor_id: impl Into<String>, metadata: HashMap<String, String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            metadata,
        }
    }

    /// Address the owner's canary gRPC server listens on, if it advertised one.
    pub fn grpc_address(&self) -> Option<&str> {
        self.metadata
            .get(GRPC_ADDRESS_METADATA_KEY)
            .map(String::as_str)
            .filter(|addr| !addr.is_empty())
    }
}

/// Immutable shard key → owner mapping for one namespace.
///
/// A view is built whole from a distributor snapshot and swapped in
/// atomically, so readers never see a half-applied update.
#[derive(Debug, Default)]
pub struct OwnershipView {
    owners: HashMap<String, Arc<ShardOwner>>,
    executors: usize,
}

/// Reasons a snapshot is refused. The previous view stays in place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("executor with empty id in snapshot")]
    EmptyExecutorId,
    #[error("shard {shard_key} assigned to both {first} and {second}")]
    DuplicateOwner {
        shard_key: String,
        first: String,
        second: String,
    },
}

impl OwnershipView {
    pub fn from_snapshot(snapshot: &pb::WatchNamespaceStateResponse) -> Result<Self, SnapshotError> {
        let mut owners: HashMap<String, Arc<ShardOwner>> = HashMap::new();
        for executor in &snapshot.executors {
            if executor.executor_id.is_empty() {
                return Err(SnapshotError::EmptyExecutorId);
            }
            let owner = Arc::new(ShardOwner::new(
                executor.executor_id.clone(),
                executor.metadata.clone(),
            ));
            for shard_key in &executor.assigned_shards {
                if let Some(existing) = owners.insert(shard_key.clone(), owner.clone())
                    && existing.executor_id != owner.executor_id
                {
                    return Err(SnapshotError::DuplicateOwner {
                        shard_key: shard_key.clone(),
                        first: existing.executor_id.clone(),
                        second: owner.executor_id.clone(),
                    });
                }
            }
        }
        Ok(Self {
            owners,
            executors: snapshot.executors.len(),
        })
    }

    pub fn owner(&self, shard_key: &str) -> Option<&Arc<ShardOwner>> {
        self.owners.get(shard_key)
    }

    pub fn shard_count(&self) -> usize {
        self.owners.len()
    }

    pub fn executor_count(&self) -> usize {
        self.executors
    }
}
