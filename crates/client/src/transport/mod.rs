// Per-shard transport: one bidirectional link per loaded shard.
//
// Sessions only see the `ShardConnector`/`ShardLink` traits so tests can
// drive them over in-memory channels.

pub mod ws;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use decksync_common::types::ShardId;

use crate::error::TransportError;

pub use ws::WsConnector;

pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    Binary(Vec<u8>),
    Text(String),
}

pub trait ShardLink: Send {
    fn send(&mut self, message: LinkMessage) -> TransportFuture<'_, ()>;

    /// Next data frame. `Ok(None)` means the peer closed the link.
    /// Must be cancel-safe: sessions race it against local commands.
    fn recv(&mut self) -> TransportFuture<'_, Option<LinkMessage>>;

    fn close(&mut self) -> TransportFuture<'_, ()>;
}

pub trait ShardConnector: Send + Sync {
    fn connect<'a>(&'a self, shard_id: &'a ShardId) -> TransportFuture<'a, Box<dyn ShardLink>>;
}

/// Reconnection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: u32::MAX, // retry indefinitely
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
