#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use shardcanary::canary_client::{CanaryClient, CanaryClientError};
use shardcanary::distributor::{
    DistributorError, NamespaceStateStream, ShardDistributorClient,
    ShardDistributorExecutorClient,
};
use shardcanary::executor::ShardOwnership;
use shardcanary::pb;
use shardcanary::settings::GRPC_ADDRESS_METADATA_KEY;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type SnapshotSender = mpsc::UnboundedSender<Result<pb::WatchNamespaceStateResponse, DistributorError>>;

/// Build a snapshot from `(executor_id, grpc_address, shards)` triples.
pub fn snapshot(executors: &[(&str, &str, &[&str])]) -> pb::WatchNamespaceStateResponse {
    pb::WatchNamespaceStateResponse {
        executors: executors
            .iter()
            .map(|(id, addr, shards)| pb::ExecutorShardAssignment {
                executor_id: id.to_string(),
                metadata: address_metadata(addr),
                assigned_shards: shards.iter().map(|s| s.to_string()).collect(),
            })
            .collect(),
    }
}

pub fn address_metadata(addr: &str) -> HashMap<String, String> {
    HashMap::from([(GRPC_ADDRESS_METADATA_KEY.to_string(), addr.to_string())])
}

/// In-memory distributor. Ownership streams are fed by the test through
/// [`FakeDistributor::publish`].
#[derive(Default)]
pub struct FakeDistributor {
    streams: Mutex<HashMap<String, Vec<SnapshotSender>>>,
    subscribe_errors: Mutex<VecDeque<DistributorError>>,
    pub subscribe_calls: AtomicU32,

    owners: Mutex<HashMap<String, pb::GetShardOwnerResponse>>,
    owner_errors: Mutex<HashMap<String, DistributorError>>,
    pub owner_requests: Mutex<Vec<pb::GetShardOwnerRequest>>,

    pub heartbeats: Mutex<Vec<pb::HeartbeatRequest>>,
    heartbeat_response: Mutex<pb::HeartbeatResponse>,
    heartbeat_errors: Mutex<VecDeque<DistributorError>>,
}

impl FakeDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next subscription attempts fail, in order.
    pub fn fail_subscriptions(&self, errors: impl IntoIterator<Item = DistributorError>) {
        self.subscribe_errors.lock().unwrap().extend(errors);
    }

    /// Send a snapshot to every open stream for `namespace`.
    pub fn publish(&self, namespace: &str, snapshot: pb::WatchNamespaceStateResponse) {
        if let Some(senders) = self.streams.lock().unwrap().get_mut(namespace) {
            senders.retain(|tx| tx.send(Ok(snapshot.clone())).is_ok());
        }
    }

    /// Fail every open stream for `namespace` with `error`.
    pub fn break_streams(&self, namespace: &str, error: DistributorError) {
        if let Some(senders) = self.streams.lock().unwrap().remove(namespace) {
            for tx in senders {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    pub fn open_streams(&self, namespace: &str) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(namespace)
            .map(|s| s.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Owner returned for every shard in `namespace`.
    pub fn set_owner(&self, namespace: &str, executor_id: &str, addr: &str) {
        self.owners.lock().unwrap().insert(
            namespace.to_string(),
            pb::GetShardOwnerResponse {
                owner: executor_id.to_string(),
                namespace: namespace.to_string(),
                metadata: address_metadata(addr),
            },
        );
    }

    pub fn fail_owner_lookups(&self, namespace: &str, error: DistributorError) {
        self.owner_errors
            .lock()
            .unwrap()
            .insert(namespace.to_string(), error);
    }

    pub fn set_heartbeat_response(&self, response: pb::HeartbeatResponse) {
        *self.heartbeat_response.lock().unwrap() = response;
    }

    pub fn fail_heartbeats(&self, errors: impl IntoIterator<Item = DistributorError>) {
        self.heartbeat_errors.lock().unwrap().extend(errors);
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.lock().unwrap().len()
    }

    pub fn last_heartbeat(&self) -> Option<pb::HeartbeatRequest> {
        self.heartbeats.lock().unwrap().last().cloned()
    }
}

/// Heartbeat response assigning `shards` in the given migration mode.
pub fn assignment(shards: &[&str], mode: pb::MigrationMode) -> pb::HeartbeatResponse {
    pb::HeartbeatResponse {
        shard_assignments: shards
            .iter()
            .map(|s| {
                (
                    s.to_string(),
                    pb::ShardAssignment {
                        status: pb::AssignmentStatus::Ready as i32,
                    },
                )
            })
            .collect(),
        migration_mode: mode as i32,
    }
}

#[async_trait]
impl ShardDistributorClient for FakeDistributor {
    async fn get_shard_owner(
        &self,
        request: pb::GetShardOwnerRequest,
    ) -> Result<pb::GetShardOwnerResponse, DistributorError> {
        self.owner_requests.lock().unwrap().push(request.clone());
        if let Some(err) = self.owner_errors.lock().unwrap().get(&request.namespace) {
            return Err(err.clone());
        }
        self.owners
            .lock()
            .unwrap()
            .get(&request.namespace)
            .cloned()
            .ok_or_else(|| DistributorError::Rpc(tonic::Status::not_found("namespace not found")))
    }

    async fn watch_namespace_state(
        &self,
        request: pb::WatchNamespaceStateRequest,
    ) -> Result<NamespaceStateStream, DistributorError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.subscribe_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .unwrap()
            .entry(request.namespace)
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl ShardDistributorExecutorClient for FakeDistributor {
    async fn heartbeat(
        &self,
        request: pb::HeartbeatRequest,
    ) -> Result<pb::HeartbeatResponse, DistributorError> {
        self.heartbeats.lock().unwrap().push(request);
        if let Some(err) = self.heartbeat_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.heartbeat_response.lock().unwrap().clone())
    }
}

/// How the mock canary client answers pings.
#[derive(Debug, Clone)]
pub enum PingBehavior {
    /// Answer with the given ownership.
    Respond { executor_id: String, owns_shard: bool },
    /// Fail with an RPC error.
    Fail(tonic::Code),
    /// Never answer.
    Hang,
}

pub struct MockCanaryClient {
    behavior: Mutex<PingBehavior>,
    pub pings: Mutex<Vec<pb::PingRequest>>,
    pub peer_pings: Mutex<Vec<(String, pb::PingRequest)>>,
    pub calls: AtomicU32,
}

impl MockCanaryClient {
    pub fn new(behavior: PingBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            pings: Mutex::new(Vec::new()),
            peer_pings: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn owning(executor_id: &str) -> Self {
        Self::new(PingBehavior::Respond {
            executor_id: executor_id.to_string(),
            owns_shard: true,
        })
    }

    pub fn set_behavior(&self, behavior: PingBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pinged_keys(&self) -> Vec<String> {
        self.pings
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.shard_key.clone())
            .collect()
    }

    async fn answer(&self, request: &pb::PingRequest) -> Result<pb::PingResponse, CanaryClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            PingBehavior::Respond {
                executor_id,
                owns_shard,
            } => Ok(pb::PingResponse {
                executor_id,
                owns_shard,
                shard_key: request.shard_key.clone(),
            }),
            PingBehavior::Fail(code) => Err(CanaryClientError::Rpc {
                address: "mock".to_string(),
                status: tonic::Status::new(code, "mock failure"),
            }),
            PingBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(CanaryClientError::Timeout(Duration::from_secs(3600)))
            }
        }
    }
}

#[async_trait]
impl CanaryClient for MockCanaryClient {
    async fn ping(&self, request: pb::PingRequest) -> Result<pb::PingResponse, CanaryClientError> {
        self.pings.lock().unwrap().push(request.clone());
        self.answer(&request).await
    }

    async fn ping_peer(
        &self,
        address: &str,
        request: pb::PingRequest,
    ) -> Result<pb::PingResponse, CanaryClientError> {
        self.peer_pings
            .lock()
            .unwrap()
            .push((address.to_string(), request.clone()));
        self.answer(&request).await
    }
}

/// Executor stand-in holding a fixed set of shards.
pub struct StaticOwnership {
    pub namespace: String,
    pub metadata: HashMap<String, String>,
    pub shards: HashSet<String>,
}

impl StaticOwnership {
    pub fn new(namespace: &str, addr: &str, shards: &[&str]) -> Self {
        Self {
            namespace: namespace.to_string(),
            metadata: address_metadata(addr),
            shards: shards.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ShardOwnership for StaticOwnership {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn has_shard(&self, shard_key: &str) -> bool {
        self.shards.contains(shard_key)
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// In-process distributor served over real gRPC.
///
/// Executors register by heartbeating. Shards named in
/// [`DistributorServer::preassign`] go to the first executor that heartbeats
/// in their namespace; any other shard is allocated on `GetShardOwner` to the
/// lowest executor id.
#[derive(Clone, Default)]
pub struct DistributorServer {
    namespaces: std::sync::Arc<Mutex<HashMap<String, ServerNamespace>>>,
}

struct ServerNamespace {
    executors: std::collections::BTreeMap<String, HashMap<String, String>>,
    pending: std::collections::BTreeSet<String>,
    owners: std::collections::BTreeMap<String, String>,
    tx: tokio::sync::watch::Sender<pb::WatchNamespaceStateResponse>,
}

impl Default for ServerNamespace {
    fn default() -> Self {
        let (tx, _) = tokio::sync::watch::channel(pb::WatchNamespaceStateResponse::default());
        Self {
            executors: Default::default(),
            pending: Default::default(),
            owners: Default::default(),
            tx,
        }
    }
}

impl ServerNamespace {
    fn publish(&self) {
        let executors = self
            .executors
            .iter()
            .map(|(id, metadata)| pb::ExecutorShardAssignment {
                executor_id: id.clone(),
                metadata: metadata.clone(),
                assigned_shards: self
                    .owners
                    .iter()
                    .filter(|(_, owner)| *owner == id)
                    .map(|(shard, _)| shard.clone())
                    .collect(),
            })
            .collect();
        self.tx
            .send_replace(pb::WatchNamespaceStateResponse { executors });
    }

    fn assigned_to(&self, executor_id: &str) -> HashMap<String, pb::ShardAssignment> {
        self.owners
            .iter()
            .filter(|(_, owner)| *owner == executor_id)
            .map(|(shard, _)| {
                (
                    shard.clone(),
                    pb::ShardAssignment {
                        status: pb::AssignmentStatus::Ready as i32,
                    },
                )
            })
            .collect()
    }
}

impl DistributorServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preassign(&self, namespace: &str, shards: impl IntoIterator<Item = String>) {
        let mut namespaces = self.namespaces.lock().unwrap();
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .pending
            .extend(shards);
    }

    pub fn owner_of(&self, namespace: &str, shard_key: &str) -> Option<String> {
        self.namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .and_then(|ns| ns.owners.get(shard_key).cloned())
    }

    pub fn executor_ids(&self, namespace: &str) -> Vec<String> {
        self.namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .map(|ns| ns.executors.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Serve on an ephemeral port until `shutdown` fires.
    pub async fn spawn(
        self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(pb::distributor_api_server::DistributorApiServer::new(
                    self.clone(),
                ))
                .add_service(pb::executor_api_server::ExecutorApiServer::new(self))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::TcpListenerStream::new(listener),
                    async {
                        let _ = shutdown.await;
                    },
                )
                .await
                .unwrap();
        });
        (addr, handle)
    }
}

#[tonic::async_trait]
impl pb::distributor_api_server::DistributorApi for DistributorServer {
    type WatchNamespaceStateStream =
        futures::stream::BoxStream<'static, Result<pb::WatchNamespaceStateResponse, tonic::Status>>;

    async fn get_shard_owner(
        &self,
        request: tonic::Request<pb::GetShardOwnerRequest>,
    ) -> Result<tonic::Response<pb::GetShardOwnerResponse>, tonic::Status> {
        let request = request.into_inner();
        let mut namespaces = self.namespaces.lock().unwrap();
        let ns = namespaces.entry(request.namespace.clone()).or_default();
        let owner = match ns.owners.get(&request.shard_key) {
            Some(owner) => owner.clone(),
            None => {
                let Some(owner) = ns.executors.keys().next().cloned() else {
                    return Err(tonic::Status::unavailable("no executors registered"));
                };
                ns.owners.insert(request.shard_key.clone(), owner.clone());
                ns.publish();
                owner
            }
        };
        let metadata = ns.executors.get(&owner).cloned().unwrap_or_default();
        Ok(tonic::Response::new(pb::GetShardOwnerResponse {
            owner,
            namespace: request.namespace,
            metadata,
        }))
    }

    async fn watch_namespace_state(
        &self,
        request: tonic::Request<pb::WatchNamespaceStateRequest>,
    ) -> Result<tonic::Response<Self::WatchNamespaceStateStream>, tonic::Status> {
        let rx = self
            .namespaces
            .lock()
            .unwrap()
            .entry(request.into_inner().namespace)
            .or_default()
            .tx
            .subscribe();
        let stream = tokio_stream::wrappers::WatchStream::new(rx).map(Ok).boxed();
        Ok(tonic::Response::new(stream))
    }
}

#[tonic::async_trait]
impl pb::executor_api_server::ExecutorApi for DistributorServer {
    async fn heartbeat(
        &self,
        request: tonic::Request<pb::HeartbeatRequest>,
    ) -> Result<tonic::Response<pb::HeartbeatResponse>, tonic::Status> {
        let request = request.into_inner();
        let mut namespaces = self.namespaces.lock().unwrap();
        let ns = namespaces.entry(request.namespace.clone()).or_default();

        if request.status() == pb::ExecutorStatus::Draining {
            ns.executors.remove(&request.executor_id);
            ns.owners.retain(|_, owner| *owner != request.executor_id);
            ns.publish();
            return Ok(tonic::Response::new(pb::HeartbeatResponse::default()));
        }

        ns.executors
            .insert(request.executor_id.clone(), request.metadata.clone());
        for (shard, report) in &request.shard_status_reports {
            if report.status() == pb::ShardStatus::Done {
                ns.owners.remove(shard);
            }
        }
        for shard in std::mem::take(&mut ns.pending) {
            ns.owners.insert(shard, request.executor_id.clone());
        }
        ns.publish();

        Ok(tonic::Response::new(pb::HeartbeatResponse {
            shard_assignments: ns.assigned_to(&request.executor_id),
            migration_mode: pb::MigrationMode::Onboarded as i32,
        }))
    }
}
