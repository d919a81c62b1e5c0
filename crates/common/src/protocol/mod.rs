pub mod frame;
pub mod presence;

pub use frame::{FrameError, InboundFrame, PresenceFrame, SyncFrame, SYNC_REQUEST_SENTINEL};
pub use presence::{PresenceKind, PresenceLeave, PresenceMessage, PresenceUser, TextMessage};
