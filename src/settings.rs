use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::pb;

pub const LOCAL_PASSTHROUGH_NAMESPACE: &str = "test-local-passthrough";
pub const LOCAL_PASSTHROUGH_SHADOW_NAMESPACE: &str = "test-local-passthrough-shadow";
pub const DISTRIBUTED_PASSTHROUGH_NAMESPACE: &str = "test-distributed-passthrough";
pub const EXTERNAL_ASSIGNMENT_NAMESPACE: &str = "test-external-assignment";

/// Metadata key under which an executor advertises its canary gRPC address.
pub const GRPC_ADDRESS_METADATA_KEY: &str = "grpc_address";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("namespace not configured: {0}")]
    NamespaceNotConfigured(String),
    #[error("duplicate namespace in config: {0}")]
    DuplicateNamespace(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub distributor: DistributorConfig,
    #[serde(default)]
    pub canary: CanaryConfig,
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<NamespaceConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the canary serves the ping RPC on, e.g. 127.0.0.1:7953
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: String,
    /// Prometheus endpoint; disabled when unset
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            metrics_addr: None,
        }
    }
}

fn default_grpc_addr() -> String {
    "127.0.0.1:7953".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DistributorConfig {
    #[serde(default = "default_distributor_endpoint")]
    pub endpoint: String,
    /// Per-call budget for spectator-facing distributor calls
    #[serde(default = "default_distributor_timeout_ms")]
    pub timeout_ms: u64,
    /// Per-call budget for executor heartbeats
    #[serde(default = "default_executor_timeout_ms")]
    pub executor_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_distributor_endpoint(),
            timeout_ms: default_distributor_timeout_ms(),
            executor_timeout_ms: default_executor_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_distributor_endpoint() -> String {
    "127.0.0.1:7943".to_string()
}

fn default_distributor_timeout_ms() -> u64 {
    10_000
}

fn default_executor_timeout_ms() -> u64 {
    1_000
}

/// Backoff settings for retried distributor calls. Unset fields fall back to
/// the defaults in [`crate::retry::RetryPolicy`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub expiration_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CanaryConfig {
    #[serde(default = "default_fixed_namespace")]
    pub fixed_namespace: String,
    #[serde(default = "default_ephemeral_namespace")]
    pub ephemeral_namespace: String,
    #[serde(default = "default_num_fixed_shards")]
    pub num_fixed_shards: u32,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_ping_jitter")]
    pub ping_jitter: f64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_shard_creation_interval_ms")]
    pub shard_creation_interval_ms: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            fixed_namespace: default_fixed_namespace(),
            ephemeral_namespace: default_ephemeral_namespace(),
            num_fixed_shards: default_num_fixed_shards(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_jitter: default_ping_jitter(),
            ping_timeout_ms: default_ping_timeout_ms(),
            shard_creation_interval_ms: default_shard_creation_interval_ms(),
        }
    }
}

impl CanaryConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn shard_creation_interval(&self) -> Duration {
        Duration::from_millis(self.shard_creation_interval_ms)
    }
}

fn default_fixed_namespace() -> String {
    "shard-distributor-canary".to_string()
}

fn default_ephemeral_namespace() -> String {
    "shard-distributor-canary-ephemeral".to_string()
}

fn default_num_fixed_shards() -> u32 {
    32
}

fn default_ping_interval_ms() -> u64 {
    1_000
}

fn default_ping_jitter() -> f64 {
    0.1
}

fn default_ping_timeout_ms() -> u64 {
    5_000
}

fn default_shard_creation_interval_ms() -> u64 {
    1_000
}

/// How shard assignment for a namespace is resolved while it migrates onto
/// the distributor.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationMode {
    /// Assignments are local; the distributor is not consulted.
    LocalPassthrough,
    /// Assignments are local; the distributor is heartbeated and compared.
    LocalPassthroughShadow,
    /// The distributor relays externally decided assignments.
    DistributedPassthrough,
    /// The distributor relays assignments and local state is compared.
    DistributedPassthroughShadow,
    /// The distributor owns assignment.
    Onboarded,
}

impl MigrationMode {
    /// Whether executors in this mode heartbeat the distributor.
    pub fn heartbeats(self) -> bool {
        !matches!(self, MigrationMode::LocalPassthrough)
    }

    /// Whether distributor assignments decide which shards run locally.
    /// Shadow modes never do; they only compare.
    pub fn distributor_authoritative(self) -> bool {
        matches!(
            self,
            MigrationMode::Onboarded | MigrationMode::DistributedPassthrough
        )
    }

    /// Whether differences between local and distributor state are logged.
    pub fn is_shadow(self) -> bool {
        matches!(
            self,
            MigrationMode::LocalPassthroughShadow | MigrationMode::DistributedPassthroughShadow
        )
    }

    pub fn from_proto(mode: pb::MigrationMode) -> Option<Self> {
        match mode {
            pb::MigrationMode::Invalid => None,
            pb::MigrationMode::LocalPassthrough => Some(MigrationMode::LocalPassthrough),
            pb::MigrationMode::LocalPassthroughShadow => {
                Some(MigrationMode::LocalPassthroughShadow)
            }
            pb::MigrationMode::DistributedPassthrough => {
                Some(MigrationMode::DistributedPassthrough)
            }
            pb::MigrationMode::Onboarded => Some(MigrationMode::Onboarded),
        }
    }
}

impl std::fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationMode::LocalPassthrough => write!(f, "LOCAL_PASSTHROUGH"),
            MigrationMode::LocalPassthroughShadow => write!(f, "LOCAL_PASSTHROUGH_SHADOW"),
            MigrationMode::DistributedPassthrough => write!(f, "DISTRIBUTED_PASSTHROUGH"),
            MigrationMode::DistributedPassthroughShadow => {
                write!(f, "DISTRIBUTED_PASSTHROUGH_SHADOW")
            }
            MigrationMode::Onboarded => write!(f, "ONBOARDED"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_migration_mode")]
    pub migration_mode: MigrationMode,
}

impl NamespaceConfig {
    pub fn new(name: impl Into<String>, migration_mode: MigrationMode) -> Self {
        Self {
            name: name.into(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            migration_mode,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_migration_mode() -> MigrationMode {
    MigrationMode::Onboarded
}

fn default_namespaces() -> Vec<NamespaceConfig> {
    vec![
        NamespaceConfig::new(default_fixed_namespace(), MigrationMode::Onboarded),
        NamespaceConfig::new(default_ephemeral_namespace(), MigrationMode::Onboarded),
        NamespaceConfig::new(LOCAL_PASSTHROUGH_NAMESPACE, MigrationMode::LocalPassthrough),
        NamespaceConfig::new(
            LOCAL_PASSTHROUGH_SHADOW_NAMESPACE,
            MigrationMode::LocalPassthroughShadow,
        ),
        NamespaceConfig::new(
            DISTRIBUTED_PASSTHROUGH_NAMESPACE,
            MigrationMode::DistributedPassthrough,
        ),
        NamespaceConfig::new(
            EXTERNAL_ASSIGNMENT_NAMESPACE,
            MigrationMode::DistributedPassthrough,
        ),
    ]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            distributor: DistributorConfig::default(),
            canary: CanaryConfig::default(),
            namespaces: default_namespaces(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let cfg = match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                toml::from_str::<Self>(&data)?
            }
            None => Self::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.canary.num_fixed_shards == 0 {
            return Err(ConfigError::Invalid(
                "canary.num_fixed_shards must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.canary.ping_jitter) {
            return Err(ConfigError::Invalid(
                "canary.ping_jitter must be in [0, 1)".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for ns in &self.namespaces {
            if ns.name.is_empty() {
                return Err(ConfigError::Invalid("namespace name is empty".to_string()));
            }
            if !seen.insert(ns.name.as_str()) {
                return Err(ConfigError::DuplicateNamespace(ns.name.clone()));
            }
        }
        self.namespace(&self.canary.fixed_namespace)?;
        self.namespace(&self.canary.ephemeral_namespace)?;
        Ok(())
    }

    /// Look up a namespace by exact name.
    pub fn namespace(&self, name: &str) -> Result<&NamespaceConfig, ConfigError> {
        self.namespaces
            .iter()
            .find(|ns| ns.name == name)
            .ok_or_else(|| ConfigError::NamespaceNotConfigured(name.to_string()))
    }

    /// Rename the fixed namespace, carrying its namespace entry along.
    pub fn set_fixed_namespace(&mut self, name: &str) {
        let old = std::mem::replace(&mut self.canary.fixed_namespace, name.to_string());
        self.rename_namespace(&old, name);
    }

    /// Rename the ephemeral namespace, carrying its namespace entry along.
    pub fn set_ephemeral_namespace(&mut self, name: &str) {
        let old = std::mem::replace(&mut self.canary.ephemeral_namespace, name.to_string());
        self.rename_namespace(&old, name);
    }

    fn rename_namespace(&mut self, old: &str, new: &str) {
        if let Some(ns) = self.namespaces.iter_mut().find(|ns| ns.name == old) {
            ns.name = new.to_string();
        }
    }
}
