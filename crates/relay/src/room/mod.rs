// Rooms: one task per shard id owning the authoritative document.
//
// Sockets never touch a document. They hold a `RoomHandle` and push
// commands into the room's inbox; the room task is the single writer.

pub mod guard;
mod task;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use decksync_common::crdt::DeckDocument;
use decksync_common::protocol::InboundFrame;
use decksync_common::types::ShardId;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::RoomConfig;
use crate::metrics::RelayMetrics;
use crate::snapshot::SnapshotStore;

pub type MemberId = u64;

/// Frames a room pushes to one member's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Text(String),
}

#[derive(Debug)]
pub(crate) enum RoomCommand {
    Join { member: MemberId, sender: mpsc::UnboundedSender<Outbound> },
    Leave { member: MemberId },
    Inbound { member: MemberId, frame: InboundFrame },
    Shutdown,
}

/// Cheap, cloneable reference to a running room.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    shard_id: ShardId,
    commands: mpsc::UnboundedSender<RoomCommand>,
    pending: Arc<AtomicUsize>,
}

impl RoomHandle {
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Queue a frame received from `member`. Returns false once the room has
    /// stopped.
    pub fn send_inbound(&self, member: MemberId, frame: InboundFrame) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.commands.send(RoomCommand::Inbound { member, frame }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn send(&self, command: RoomCommand) {
        if self.commands.send(command).is_err() {
            debug!(shard_id = %self.shard_id, "room inbox closed");
        }
    }
}

/// A socket's seat in a room.
pub struct Membership {
    pub member: MemberId,
    pub room: RoomHandle,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

struct RoomEntry {
    handle: RoomHandle,
    members: usize,
}

/// Shard id → running room. The lock only guards lookup and member
/// counting; join and leave commands are queued while it is held so a room
/// can never be destroyed between a lookup and a join.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<ShardId, RoomEntry>>,
    next_member: AtomicU64,
    pending: Arc<AtomicUsize>,
    store: Arc<dyn SnapshotStore>,
    metrics: Arc<RelayMetrics>,
    config: RoomConfig,
}

impl RoomRegistry {
    pub fn new(
        config: RoomConfig,
        store: Arc<dyn SnapshotStore>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            next_member: AtomicU64::new(1),
            pending: Arc::new(AtomicUsize::new(0)),
            store,
            metrics,
            config,
        }
    }

    /// Add a member to the room for `shard_id`, creating the room if needed.
    /// Must be called from within a tokio runtime.
    pub fn join(&self, shard_id: &ShardId) -> Membership {
        let member = self.next_member.fetch_add(1, Ordering::SeqCst);
        let (sender, outbound) = mpsc::unbounded_channel();

        let mut rooms = self.rooms.lock().expect("room registry lock poisoned");
        let entry = rooms.entry(shard_id.clone()).or_insert_with(|| {
            info!(shard_id = %shard_id, "creating room");
            RoomEntry { handle: self.spawn_room(shard_id.clone()), members: 0 }
        });
        entry.members += 1;
        entry.handle.send(RoomCommand::Join { member, sender });
        let room = entry.handle.clone();
        self.publish_gauges(&rooms);

        Membership { member, room, outbound }
    }

    /// Remove a member. The last member out stops the room and discards its
    /// document after the final snapshot.
    pub fn leave(&self, shard_id: &ShardId, member: MemberId) {
        let mut rooms = self.rooms.lock().expect("room registry lock poisoned");
        let Some(entry) = rooms.get_mut(shard_id) else {
            return;
        };
        entry.handle.send(RoomCommand::Leave { member });
        entry.members = entry.members.saturating_sub(1);
        if entry.members == 0 {
            if let Some(entry) = rooms.remove(shard_id) {
                info!(shard_id = %shard_id, "destroying room");
                entry.handle.send(RoomCommand::Shutdown);
            }
        }
        self.publish_gauges(&rooms);
    }

    pub fn connected_shards(&self) -> usize {
        self.rooms.lock().expect("room registry lock poisoned").len()
    }

    pub fn connected_clients(&self) -> usize {
        let rooms = self.rooms.lock().expect("room registry lock poisoned");
        rooms.values().map(|entry| entry.members).sum()
    }

    /// Inbound frames queued to rooms but not yet processed.
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn has_room(&self, shard_id: &ShardId) -> bool {
        self.rooms.lock().expect("room registry lock poisoned").contains_key(shard_id)
    }

    fn spawn_room(&self, shard_id: ShardId) -> RoomHandle {
        let (commands, inbox) = mpsc::unbounded_channel();
        let handle =
            RoomHandle { shard_id: shard_id.clone(), commands, pending: Arc::clone(&self.pending) };
        let room = task::Room::<DeckDocument>::new(
            shard_id,
            &self.config,
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            Arc::clone(&self.pending),
        );
        tokio::spawn(room.run(inbox));
        handle
    }

    fn publish_gauges(&self, rooms: &HashMap<ShardId, RoomEntry>) {
        self.metrics.set_active_rooms(rooms.len());
        self.metrics.set_active_connections(rooms.values().map(|entry| entry.members).sum());
    }
}
