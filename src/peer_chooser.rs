//! Routing of canary pings to the peer that owns a shard.
//!
//! The chooser is built before the spectators exist (the canary client needs
//! it, and the spectators are started only once the canary server is up), so
//! it starts uninitialized and is wired up later with
//! [`PeerChooser::set_spectators`]. Until then every routing attempt fails with
//! [`PeerChooserError::NotInitialized`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::distributor::grpc::ensure_http_scheme;
use crate::pb::canary_api_client::CanaryApiClient;
use crate::spectator::{SpectatorError, Spectators};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum PeerChooserError {
    #[error("peer chooser has no spectators attached yet")]
    NotInitialized,
    #[error("spectators already attached to peer chooser")]
    AlreadyInitialized,
    #[error("no owner for shard {shard_key} in namespace {namespace}: {source}")]
    NoOwner {
        namespace: String,
        shard_key: String,
        #[source]
        source: SpectatorError,
    },
    #[error("owner {executor_id} of shard {shard_key} did not advertise a gRPC address")]
    MissingAddress {
        executor_id: String,
        shard_key: String,
    },
    #[error("failed to connect to peer at {address}: {message}")]
    Connection { address: String, message: String },
}

enum ChooserState {
    Uninitialized,
    Ready(Arc<Spectators>),
}

/// A peer selected for a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub executor_id: String,
    pub address: String,
}

pub struct PeerChooser {
    state: RwLock<ChooserState>,
    /// Cache of gRPC clients to peer canaries, keyed by URL
    connections: tokio::sync::RwLock<HashMap<String, CanaryApiClient<Channel>>>,
}

impl Default for PeerChooser {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerChooser {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ChooserState::Uninitialized),
            connections: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Attach the spectators. May only be called once.
    pub fn set_spectators(&self, spectators: Arc<Spectators>) -> Result<(), PeerChooserError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, ChooserState::Ready(_)) {
            return Err(PeerChooserError::AlreadyInitialized);
        }
        *state = ChooserState::Ready(spectators);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(PoisonError::into_inner),
            ChooserState::Ready(_)
        )
    }

    /// Pick the peer currently believed to own `shard_key` in `namespace`.
    pub fn choose_peer(&self, namespace: &str, shard_key: &str) -> Result<Peer, PeerChooserError> {
        let spectators = match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            ChooserState::Uninitialized => return Err(PeerChooserError::NotInitialized),
            ChooserState::Ready(spectators) => spectators.clone(),
        };

        let no_owner = |source| PeerChooserError::NoOwner {
            namespace: namespace.to_string(),
            shard_key: shard_key.to_string(),
            source,
        };
        let owner = spectators
            .for_namespace(namespace)
            .map_err(no_owner)?
            .get_shard_owner(shard_key)
            .map_err(no_owner)?;

        let address = owner
            .grpc_address()
            .ok_or_else(|| PeerChooserError::MissingAddress {
                executor_id: owner.executor_id.clone(),
                shard_key: shard_key.to_string(),
            })?;
        Ok(Peer {
            executor_id: owner.executor_id.clone(),
            address: address.to_string(),
        })
    }

    /// Get or create a client for the peer at `address`.
    pub async fn client_for(
        &self,
        address: &str,
    ) -> Result<CanaryApiClient<Channel>, PeerChooserError> {
        let url = ensure_http_scheme(address);

        {
            let cache = self.connections.read().await;
            if let Some(client) = cache.get(&url) {
                return Ok(client.clone());
            }
        }

        debug!(address = %url, "connecting to peer canary");
        let connection_error = |e: &dyn std::fmt::Display| PeerChooserError::Connection {
            address: url.clone(),
            message: e.to_string(),
        };
        let channel = Endpoint::from_shared(url.clone())
            .map_err(|e| connection_error(&e))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await
            .map_err(|e| connection_error(&e))?;
        let client = CanaryApiClient::new(channel);

        // another task may have connected while we were connecting
        let mut cache = self.connections.write().await;
        if let Some(existing) = cache.get(&url) {
            return Ok(existing.clone());
        }
        cache.insert(url, client.clone());
        Ok(client)
    }

    /// Drop a cached client, e.g. after the peer went away.
    pub async fn forget(&self, address: &str) {
        self.connections
            .write()
            .await
            .remove(&ensure_http_scheme(address));
    }
}
