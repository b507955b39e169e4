pub mod app;
pub mod canary_client;
pub mod distributor;
pub mod executor;
pub mod handler;
pub mod lifecycle;
pub mod metrics;
pub mod peer_chooser;
pub mod probe;
pub mod prober;
pub mod retry;
pub mod server;
pub mod settings;
pub mod shard_creator;
pub mod shard_key;
pub mod spectator;
pub mod trace;

pub mod pb {
    tonic::include_proto!("sharddistributor.v1");
}

pub use shardcanary_macros::test;
