// Client-side presence: remote cursors keyed by client id, plus the local
// cursor throttle.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use decksync_common::protocol::{PresenceKind, PresenceMessage, PresenceUser};
use decksync_common::types::ShardId;

const PALETTE: [&str; 12] = [
    "#e53935", "#d81b60", "#8e24aa", "#5e35b1", "#3949ab", "#1e88e5", "#00897b", "#43a047",
    "#7cb342", "#fdd835", "#fb8c00", "#6d4c41",
];

/// Stable colour for a client id.
pub fn color_for_client(client_id: &str) -> &'static str {
    // FNV-1a keeps the mapping identical across processes and platforms.
    let hash = client_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
        });
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub client_id: String,
    pub shard_id: String,
    pub user: PresenceUser,
    pub x: f64,
    pub y: f64,
    /// Sender-side (or relay-stamped) time, milliseconds since the epoch.
    pub timestamp: Option<i64>,
    /// Local receipt time; expiry is measured from here.
    pub received_at: Instant,
}

/// Remote presence, one entry per client. A client shows up on one shard at
/// a time; the latest message wins.
#[derive(Debug)]
pub struct PresenceStore {
    entries: HashMap<String, PresenceEntry>,
    ttl: Duration,
}

impl PresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: HashMap::new(), ttl }
    }

    pub fn upsert(&mut self, message: PresenceMessage, now: Instant) {
        let entry = PresenceEntry {
            client_id: message.client_id.clone(),
            shard_id: message.shard_id,
            user: message.user,
            x: message.x,
            y: message.y,
            timestamp: message.timestamp,
            received_at: now,
        };
        self.entries.insert(message.client_id, entry);
    }

    pub fn remove(&mut self, client_id: &str) -> bool {
        self.entries.remove(client_id).is_some()
    }

    /// Drop entries not refreshed within the ttl. Returns how many went.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| !is_expired(entry, ttl, now));
        before - self.entries.len()
    }

    /// Live entries on `shard_id`, ordered by client id.
    pub fn users_for_shard(&self, shard_id: &ShardId, now: Instant) -> Vec<PresenceEntry> {
        let mut users: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.shard_id == shard_id.as_str())
            .filter(|entry| !is_expired(entry, self.ttl, now))
            .cloned()
            .collect();
        users.sort_by(|left, right| left.client_id.cmp(&right.client_id));
        users
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn is_expired(entry: &PresenceEntry, ttl: Duration, now: Instant) -> bool {
    now.saturating_duration_since(entry.received_at) > ttl
}

/// This client's identity as broadcast to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub client_id: String,
    pub user: PresenceUser,
}

impl LocalIdentity {
    pub fn new(client_id: String, display_name: String, color: Option<String>) -> Self {
        let color = color.unwrap_or_else(|| color_for_client(&client_id).to_string());
        let user = PresenceUser { id: client_id.clone(), name: display_name, color };
        Self { client_id, user }
    }

    pub fn cursor_message(&self, cursor: &CursorPosition, timestamp: i64) -> PresenceMessage {
        PresenceMessage {
            kind: PresenceKind::Cursor,
            client_id: self.client_id.clone(),
            shard_id: cursor.shard_id.to_string(),
            x: cursor.x,
            y: cursor.y,
            user: self.user.clone(),
            timestamp: Some(timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorPosition {
    pub shard_id: ShardId,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleDecision {
    SendNow(CursorPosition),
    /// Held back; the caller must call `flush` after the delay.
    ScheduleFlush(Duration),
    /// Replaced a position that is already waiting for a flush.
    Coalesced,
}

/// At most one cursor send per interval, with the latest position delivered
/// on the trailing edge.
#[derive(Debug)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<CursorPosition>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_sent: None, pending: None }
    }

    pub fn offer(&mut self, position: CursorPosition, now: Instant) -> ThrottleDecision {
        if self.pending.is_some() {
            self.pending = Some(position);
            return ThrottleDecision::Coalesced;
        }
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                self.pending = Some(position);
                ThrottleDecision::ScheduleFlush(self.interval - now.saturating_duration_since(last))
            }
            _ => {
                self.last_sent = Some(now);
                ThrottleDecision::SendNow(position)
            }
        }
    }

    /// Trailing edge: hand out the held position, if any.
    pub fn flush(&mut self, now: Instant) -> Option<CursorPosition> {
        let position = self.pending.take()?;
        self.last_sent = Some(now);
        Some(position)
    }
}
