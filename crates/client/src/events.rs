// Notifications published by the shard manager.

use decksync_common::types::ShardId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEvent {
    /// The first batch requested by `initialize` settled. `ready` lists the
    /// shards that loaded; the rest failed or timed out.
    Initialized { ready: Vec<ShardId> },
    ShardLoaded { shard_id: ShardId, element_count: usize },
    ShardError { shard_id: ShardId, error: String },
    ShardEvicted { shard_id: ShardId },
}

impl ShardEvent {
    pub fn shard_id(&self) -> Option<&ShardId> {
        match self {
            Self::Initialized { .. } => None,
            Self::ShardLoaded { shard_id, .. }
            | Self::ShardError { shard_id, .. }
            | Self::ShardEvicted { shard_id } => Some(shard_id),
        }
    }
}
