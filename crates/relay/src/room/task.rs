// Room actor: the single serialization point for one shard's document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use decksync_common::crdt::{is_empty_update, DeckDocument, DocumentError, Replica};
use decksync_common::protocol::frame::{encode_sync_step1, encode_sync_step2};
use decksync_common::protocol::presence::{announced_client_id, stamp_timestamp};
use decksync_common::protocol::{InboundFrame, PresenceFrame, PresenceLeave, SyncFrame};
use decksync_common::types::ShardId;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use yrs::sync::AwarenessUpdate;
use yrs::updates::decoder::Decode;

use super::guard::{guarded_apply, GuardOutcome};
use super::{MemberId, Outbound, RoomCommand};
use crate::config::RoomConfig;
use crate::metrics::RelayMetrics;
use crate::snapshot::{SnapshotPolicy, SnapshotStore};

/// What a room needs from the document it owns.
pub(super) trait RoomDocument: Replica + Default + Send + 'static {
    fn encode_state_vector(&self) -> Vec<u8>;

    fn encode_diff(&self, peer_vector: &[u8]) -> Result<Vec<u8>, DocumentError>;

    fn element_count(&self) -> usize;
}

impl RoomDocument for DeckDocument {
    fn encode_state_vector(&self) -> Vec<u8> {
        DeckDocument::encode_state_vector(self)
    }

    fn encode_diff(&self, peer_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        DeckDocument::encode_diff(self, peer_vector)
    }

    fn element_count(&self) -> usize {
        DeckDocument::element_count(self)
    }
}

struct Member {
    sender: mpsc::UnboundedSender<Outbound>,
    client_id: Option<String>,
    /// Latest presence text, replayed to members that join later.
    last_presence: Option<String>,
}

pub(super) struct Room<D = DeckDocument> {
    shard_id: ShardId,
    document: D,
    members: HashMap<MemberId, Member>,
    store: Arc<dyn SnapshotStore>,
    metrics: Arc<RelayMetrics>,
    pending: Arc<AtomicUsize>,
    policy: SnapshotPolicy,
    updates_since_save: u64,
    dirty: bool,
}

impl<D: RoomDocument> Room<D> {
    pub(super) fn new(
        shard_id: ShardId,
        config: &RoomConfig,
        store: Arc<dyn SnapshotStore>,
        metrics: Arc<RelayMetrics>,
        pending: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            shard_id,
            document: D::default(),
            members: HashMap::new(),
            store,
            metrics,
            pending,
            policy: SnapshotPolicy { every_updates: config.snapshot_every_updates },
            updates_since_save: 0,
            dirty: false,
        }
    }

    pub(super) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<RoomCommand>) {
        self.load_snapshot().await;

        while let Some(command) = inbox.recv().await {
            match command {
                RoomCommand::Join { member, sender } => self.handle_join(member, sender),
                RoomCommand::Leave { member } => self.handle_leave(member),
                RoomCommand::Inbound { member, frame } => {
                    self.handle_inbound(member, frame).await;
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                RoomCommand::Shutdown => break,
            }
        }

        if self.dirty {
            self.save_snapshot().await;
        }
        info!(shard_id = %self.shard_id, "room stopped");
    }

    async fn load_snapshot(&mut self) {
        let stored = match self.store.load(&self.shard_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(error) => {
                self.metrics.record_snapshot_failure();
                warn!(shard_id = %self.shard_id, error = %error, "failed to load snapshot");
                return;
            }
        };
        if is_empty_update(&stored.payload) {
            return;
        }

        match guarded_apply(&mut self.document, &encode_sync_step2(&stored.payload)) {
            GuardOutcome::Applied => {
                info!(
                    shard_id = %self.shard_id,
                    version = stored.version,
                    elements = self.document.element_count(),
                    "restored room from snapshot"
                );
            }
            outcome => {
                self.metrics.record_snapshot_failure();
                self.document = D::default();
                warn!(
                    shard_id = %self.shard_id,
                    version = stored.version,
                    outcome = ?outcome,
                    "ignoring corrupt stored snapshot"
                );
            }
        }
    }

    async fn save_snapshot(&mut self) {
        match self.store.save(&self.shard_id, self.document.encode_full()).await {
            Ok(version) => {
                self.updates_since_save = 0;
                self.dirty = false;
                debug!(shard_id = %self.shard_id, version, "saved snapshot");
            }
            Err(error) => {
                self.metrics.record_snapshot_failure();
                warn!(shard_id = %self.shard_id, error = %error, "failed to save snapshot");
            }
        }
    }

    fn handle_join(&mut self, member: MemberId, sender: mpsc::UnboundedSender<Outbound>) {
        let _ = sender.send(Outbound::Binary(self.full_state_frame()));
        let _ = sender
            .send(Outbound::Binary(encode_sync_step1(&self.document.encode_state_vector())));
        for peer in self.members.values() {
            if let Some(presence) = &peer.last_presence {
                let _ = sender.send(Outbound::Text(presence.clone()));
            }
        }

        self.members.insert(member, Member { sender, client_id: None, last_presence: None });
        debug!(shard_id = %self.shard_id, member, members = self.members.len(), "member joined");
    }

    fn handle_leave(&mut self, member: MemberId) {
        let Some(left) = self.members.remove(&member) else {
            return;
        };
        debug!(shard_id = %self.shard_id, member, members = self.members.len(), "member left");

        let Some(client_id) = left.client_id else {
            return;
        };
        match PresenceLeave::new(client_id, self.shard_id.as_str(), now_ms()).to_json() {
            Ok(leave) => self.broadcast_excluding(member, Outbound::Text(leave)),
            Err(error) => {
                warn!(
                    shard_id = %self.shard_id,
                    member,
                    error = %error,
                    "failed to encode leave notice"
                );
            }
        }
    }

    async fn handle_inbound(&mut self, member: MemberId, frame: InboundFrame) {
        match frame {
            InboundFrame::SyncRequest { state_vector } => {
                self.metrics.record_sync_request();
                let reply = match state_vector {
                    Some(sv) => match self.document.encode_diff(&sv) {
                        Ok(diff) => encode_sync_step2(&diff),
                        Err(error) => {
                            debug!(
                                shard_id = %self.shard_id,
                                member,
                                error = %error,
                                "unreadable state vector"
                            );
                            self.full_state_frame()
                        }
                    },
                    None => self.full_state_frame(),
                };
                self.send_to(member, Outbound::Binary(reply));
            }
            InboundFrame::Presence(PresenceFrame::Text(text)) => {
                let Some(stamped) = self.stamp(member, &text) else {
                    return;
                };
                if let Some(state) = self.members.get_mut(&member) {
                    state.last_presence = Some(stamped.clone());
                }
                self.metrics.record_presence_message();
                self.broadcast_excluding(member, Outbound::Text(stamped));
            }
            InboundFrame::Presence(PresenceFrame::Awareness(bytes)) => {
                let decoded = match SyncFrame::decode(&bytes) {
                    Ok(SyncFrame::Awareness(payload)) => {
                        AwarenessUpdate::decode_v1(&payload).is_ok()
                    }
                    _ => false,
                };
                if !decoded {
                    debug!(
                        shard_id = %self.shard_id,
                        member,
                        bytes = bytes.len(),
                        "dropping malformed awareness frame"
                    );
                    return;
                }
                self.metrics.record_presence_message();
                self.broadcast_excluding(member, Outbound::Binary(bytes));
            }
            InboundFrame::Control(text) => {
                if let Some(stamped) = self.stamp(member, &text) {
                    self.broadcast_excluding(member, Outbound::Text(stamped));
                }
            }
            InboundFrame::DocumentUpdate(bytes) => self.handle_update(member, bytes).await,
        }
    }

    async fn handle_update(&mut self, member: MemberId, bytes: Vec<u8>) {
        match guarded_apply(&mut self.document, &bytes) {
            GuardOutcome::Applied => {
                self.metrics.record_relayed_update();
                self.broadcast_excluding(member, Outbound::Binary(bytes));
                self.dirty = true;
                self.updates_since_save += 1;
                if self.policy.should_snapshot(self.updates_since_save) {
                    self.save_snapshot().await;
                }
            }
            GuardOutcome::Rejected(reason) => {
                self.metrics.record_rejected_update(reason.reason());
                warn!(
                    shard_id = %self.shard_id,
                    member,
                    bytes = bytes.len(),
                    reason = reason.reason(),
                    "rejected update, resyncing sender"
                );
                let resync = self.full_state_frame();
                self.send_to(member, Outbound::Binary(resync));
            }
            GuardOutcome::RolledBack(apply_error) => {
                self.metrics.record_rollback();
                warn!(
                    shard_id = %self.shard_id,
                    member,
                    error = %apply_error,
                    "update failed to apply, rolled back"
                );
                let resync = self.full_state_frame();
                self.send_to(member, Outbound::Binary(resync));
            }
            GuardOutcome::Reset { apply_error, restore_error } => {
                self.metrics.record_data_loss_reset();
                error!(
                    shard_id = %self.shard_id,
                    member,
                    apply_error = %apply_error,
                    restore_error = %restore_error,
                    members = self.members.len(),
                    "rollback failed, document reset to empty; resyncing all members"
                );
                self.dirty = true;
                let resync = self.full_state_frame();
                for state in self.members.values() {
                    let _ = state.sender.send(Outbound::Binary(resync.clone()));
                }
            }
        }
    }

    /// Stamp a text frame and remember the first client id the member
    /// announces. Later ids are ignored so a member cannot take over another
    /// client's presence. `None` means the frame is dropped.
    fn stamp(&mut self, member: MemberId, text: &str) -> Option<String> {
        let stamped = match stamp_timestamp(text, now_ms()) {
            Ok(stamped) => stamped.into_owned(),
            Err(error) => {
                debug!(shard_id = %self.shard_id, member, error = %error, "dropping text frame");
                return None;
            }
        };
        if let Some(state) = self.members.get_mut(&member) {
            if state.client_id.is_none() {
                state.client_id = announced_client_id(&stamped);
            }
        }
        Some(stamped)
    }

    fn full_state_frame(&self) -> Vec<u8> {
        encode_sync_step2(&self.document.encode_full())
    }

    fn send_to(&self, member: MemberId, message: Outbound) {
        if let Some(state) = self.members.get(&member) {
            let _ = state.sender.send(message);
        }
    }

    fn broadcast_excluding(&self, excluded: MemberId, message: Outbound) {
        for (member, state) in &self.members {
            if *member != excluded {
                let _ = state.sender.send(message.clone());
            }
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
