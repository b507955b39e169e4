use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::canary_client::NAMESPACE_HEADER;
use crate::executor::ExecutorRegistry;
use crate::metrics::Metrics;
use crate::pb;
use crate::pb::canary_api_server::CanaryApi;
use crate::settings::GRPC_ADDRESS_METADATA_KEY;

/// Answers "do you own shard K in namespace N" from local executor state.
///
/// The answer is always a response, never an error: an unknown namespace
/// yields an empty executor id and `owns_shard = false`.
pub struct PingHandler {
    registry: ExecutorRegistry,
    metrics: Option<Metrics>,
}

impl PingHandler {
    pub fn new(registry: ExecutorRegistry, metrics: Option<Metrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn check_ownership(&self, request: &pb::PingRequest) -> pb::PingResponse {
        let namespace = request.namespace.as_str();
        let Some(executor) = self.registry.get(namespace) else {
            warn!(namespace = %namespace, shard_key = %request.shard_key, "namespace executor not found");
            if let Some(metrics) = &self.metrics {
                metrics.record_ping_handled(namespace, false);
            }
            return pb::PingResponse {
                executor_id: String::new(),
                owns_shard: false,
                shard_key: request.shard_key.clone(),
            };
        };

        let owns_shard = executor.has_shard(&request.shard_key);
        let executor_id = executor
            .metadata()
            .get(GRPC_ADDRESS_METADATA_KEY)
            .cloned()
            .unwrap_or_default();

        if let Some(metrics) = &self.metrics {
            metrics.record_ping_handled(namespace, owns_shard);
        }
        info!(
            namespace = %namespace,
            shard_key = %request.shard_key,
            owns_shard,
            executor_id = %executor_id,
            "responding to ping"
        );
        pb::PingResponse {
            executor_id,
            owns_shard,
            shard_key: request.shard_key.clone(),
        }
    }
}

#[tonic::async_trait]
impl CanaryApi for PingHandler {
    async fn ping(
        &self,
        request: Request<pb::PingRequest>,
    ) -> Result<Response<pb::PingResponse>, Status> {
        let header_namespace = request
            .metadata()
            .get(NAMESPACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut ping = request.into_inner();
        if ping.namespace.is_empty()
            && let Some(namespace) = header_namespace
        {
            ping.namespace = namespace;
        }
        Ok(Response::new(self.check_ownership(&ping)))
    }
}
