use rand::Rng;
use uuid::Uuid;

/// Produces the shard key to probe on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKeyGenerator {
    /// Uniform draw from `[0, num_shards)` rendered as text. Every tick draws
    /// again, so coverage of the pool is uneven over time.
    Fixed { num_shards: u32 },
    /// A fresh UUID per tick; never reused.
    Ephemeral,
}

impl ShardKeyGenerator {
    /// Fixed pool of `num_shards` keys. A pool of zero is clamped to one.
    pub fn fixed(num_shards: u32) -> Self {
        ShardKeyGenerator::Fixed {
            num_shards: num_shards.max(1),
        }
    }

    pub fn next_key(&self) -> String {
        match self {
            ShardKeyGenerator::Fixed { num_shards } => {
                // thread_rng is per-thread, so concurrent probers don't share state
                rand::thread_rng().gen_range(0..(*num_shards).max(1)).to_string()
            }
            ShardKeyGenerator::Ephemeral => Uuid::new_v4().to_string(),
        }
    }

    /// Metrics label for probes driven by this generator.
    pub fn kind(&self) -> &'static str {
        match self {
            ShardKeyGenerator::Fixed { .. } => "fixed",
            ShardKeyGenerator::Ephemeral => "ephemeral",
        }
    }
}
