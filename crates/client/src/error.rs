use decksync_common::crdt::DocumentError;
use decksync_common::types::ShardId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid relay url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("failed to read frame: {0}")]
    Receive(String),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("shard {0} is not active")]
    NotActive(ShardId),
    #[error("timed out waiting for the initial sync of shard {0}")]
    HandshakeTimeout(ShardId),
    #[error("gave up reconnecting shard {shard_id} after {attempts} attempts")]
    ReconnectExhausted { shard_id: ShardId, attempts: u32 },
    #[error("relay closed shard {0} before the initial sync")]
    ClosedDuringHandshake(ShardId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}
