//! Process wiring for one canary node.
//!
//! Components are built with their dependencies passed in explicitly and
//! started in dependency order; shutdown runs in reverse and waits for every
//! task to exit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::canary_client::{CanaryClient, RoutedCanaryClient};
use crate::distributor::{
    GrpcDistributorClient, ShardDistributorClient, ShardDistributorExecutorClient,
    build_executor_client, build_spectator_client,
};
use crate::executor::{
    Executor, ExecutorConfig, ExecutorRegistry, ProcessorKind, ShardOwnership,
};
use crate::handler::PingHandler;
use crate::metrics::{self, Metrics};
use crate::peer_chooser::PeerChooser;
use crate::prober::{Prober, ProberConfig};
use crate::retry::RetryPolicy;
use crate::server::run_canary_server;
use crate::settings::{AppConfig, GRPC_ADDRESS_METADATA_KEY};
use crate::shard_creator::{ShardCreator, ShardCreatorConfig};
use crate::spectator::Spectators;

/// A running canary: server, spectators, executors and probers.
pub struct CanaryNode {
    grpc_addr: SocketAddr,
    spectators: Arc<Spectators>,
    executors: Vec<Arc<Executor>>,
    prober: Prober,
    shard_creator: ShardCreator,
    shutdown_tx: broadcast::Sender<()>,
    server_task: JoinHandle<()>,
    metrics_task: Option<JoinHandle<()>>,
}

impl CanaryNode {
    pub async fn start(cfg: &AppConfig, metrics: Metrics) -> anyhow::Result<Self> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let metrics_task = match &cfg.server.metrics_addr {
            Some(addr) => {
                let addr: SocketAddr = addr
                    .parse()
                    .with_context(|| format!("invalid metrics address {addr}"))?;
                let metrics = metrics.clone();
                let shutdown_rx = shutdown_tx.subscribe();
                Some(tokio::spawn(async move {
                    if let Err(e) = metrics::run_metrics_server(addr, metrics, shutdown_rx).await {
                        error!(error = %e, "metrics server failed");
                    }
                }))
            }
            None => None,
        };

        // distributor clients
        let raw = Arc::new(
            GrpcDistributorClient::connect_lazy(&cfg.distributor.endpoint)
                .context("invalid shard distributor endpoint")?,
        );
        let spectator_client = build_spectator_client(
            raw.clone() as Arc<dyn ShardDistributorClient>,
            Duration::from_millis(cfg.distributor.timeout_ms),
            Some(metrics.clone()),
            RetryPolicy::from_config(&cfg.distributor.retry),
        );
        let executor_client = build_executor_client(
            raw as Arc<dyn ShardDistributorExecutorClient>,
            Duration::from_millis(cfg.distributor.executor_timeout_ms),
            Some(metrics.clone()),
        );

        let spectators = Arc::new(Spectators::from_config(
            &cfg.namespaces,
            spectator_client.clone(),
            Some(metrics.clone()),
        ));

        // the chooser is attached to the spectators once the server is up
        let chooser = Arc::new(PeerChooser::new());
        let canary_client: Arc<dyn CanaryClient> = Arc::new(RoutedCanaryClient::new(
            chooser.clone(),
            cfg.canary.ping_timeout(),
        ));

        let listener = TcpListener::bind(&cfg.server.grpc_addr)
            .await
            .with_context(|| format!("failed to bind canary gRPC address {}", cfg.server.grpc_addr))?;
        let grpc_addr = listener.local_addr()?;

        let executors = build_executors(cfg, grpc_addr, executor_client, &metrics);
        let registry = ExecutorRegistry::new(
            executors
                .iter()
                .map(|e| e.clone() as Arc<dyn ShardOwnership>),
        )?;

        let handler = Arc::new(PingHandler::new(registry, Some(metrics.clone())));
        let server_shutdown = shutdown_tx.subscribe();
        let server_task = tokio::spawn(async move {
            if let Err(e) = run_canary_server(listener, handler, server_shutdown).await {
                error!(error = %e, "canary server failed");
            }
        });
        info!(addr = %grpc_addr, "canary server listening");

        chooser.set_spectators(spectators.clone())?;

        let prober = Prober::new(
            ProberConfig::fixed(&cfg.canary),
            canary_client.clone(),
            Some(metrics.clone()),
        );
        let shard_creator = ShardCreator::new(
            ShardCreatorConfig {
                namespaces: vec![cfg.canary.ephemeral_namespace.clone()],
                interval: cfg.canary.shard_creation_interval(),
                ping_timeout: cfg.canary.ping_timeout(),
            },
            spectator_client,
            canary_client,
            Some(metrics),
        );

        let node = Self {
            grpc_addr,
            spectators,
            executors,
            prober,
            shard_creator,
            shutdown_tx,
            server_task,
            metrics_task,
        };

        if let Err(e) = node.spectators.start().await {
            node.shutdown().await;
            return Err(e).context("failed to start spectators");
        }
        for executor in &node.executors {
            executor.start().await;
        }
        node.prober.start().await;
        node.shard_creator.start().await;

        info!(addr = %grpc_addr, "canary started");
        Ok(node)
    }

    /// Address the canary gRPC server is bound to.
    pub fn grpc_addr(&self) -> SocketAddr {
        self.grpc_addr
    }

    pub fn spectators(&self) -> &Arc<Spectators> {
        &self.spectators
    }

    pub fn executor(&self, namespace: &str) -> Option<&Arc<Executor>> {
        self.executors.iter().find(|e| e.namespace() == namespace)
    }

    pub async fn shutdown(self) {
        self.shard_creator.stop().await;
        self.prober.stop().await;
        for executor in &self.executors {
            executor.stop().await;
        }
        self.spectators.stop().await;

        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.server_task.await {
            error!(error = %e, "canary server task panicked");
        }
        if let Some(task) = self.metrics_task
            && let Err(e) = task.await
        {
            error!(error = %e, "metrics server task panicked");
        }
        info!("canary stopped");
    }
}

fn build_executors(
    cfg: &AppConfig,
    grpc_addr: SocketAddr,
    client: Arc<dyn ShardDistributorExecutorClient>,
    metrics: &Metrics,
) -> Vec<Arc<Executor>> {
    let metadata = HashMap::from([(GRPC_ADDRESS_METADATA_KEY.to_string(), grpc_addr.to_string())]);
    cfg.namespaces
        .iter()
        .map(|ns| {
            let kind = if ns.name == cfg.canary.ephemeral_namespace {
                ProcessorKind::ephemeral()
            } else {
                ProcessorKind::Fixed
            };
            let config = ExecutorConfig::from_namespace(
                ns,
                Uuid::new_v4().to_string(),
                metadata.clone(),
                kind,
            );
            Arc::new(Executor::new(config, client.clone(), Some(metrics.clone())))
        })
        .collect()
}
