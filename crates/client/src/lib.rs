// decksync-client: shard manager, relay transport and presence for deck editors.

pub mod config;
pub mod error;
pub mod events;
pub mod presence;
pub mod shard;
pub mod transport;

pub use config::ClientConfig;
pub use error::{ShardError, TransportError};
pub use events::ShardEvent;
pub use presence::{PresenceEntry, PresenceStore};
pub use shard::{ShardManager, ShardStatus};
pub use transport::{LinkMessage, ReconnectPolicy, ShardConnector, ShardLink, WsConnector};
