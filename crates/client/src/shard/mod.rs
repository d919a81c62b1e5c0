// Shard manager: decides which shards are loaded, owns their documents and
// routes local edits to the right session.
//
// State machine per shard: unloaded → loading → active → evicting → unloaded,
// with loading/active → error on handshake or reconnect failure. The caller
// retries an errored shard by making it visible again.

pub mod lru;
mod session;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use chrono::Utc;
use decksync_common::crdt::{DeckDocument, DeckView};
use decksync_common::types::ShardId;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ShardError, TransportError};
use crate::events::ShardEvent;
use crate::presence::{
    CursorPosition, CursorThrottle, LocalIdentity, PresenceEntry, PresenceStore, ThrottleDecision,
};
use crate::transport::{ShardConnector, WsConnector};

pub use lru::ShardLru;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    Unloaded,
    Loading,
    Active,
    Evicting,
    Error,
}

#[derive(Debug)]
pub(crate) enum Mutation {
    Add { element_id: String, fields: Map<String, Value> },
    Update { element_id: String, fields: Map<String, Value> },
    Remove { element_id: String },
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Mutate(Mutation),
    SendText(String),
    Close,
}

struct ShardEntry {
    status: ShardStatus,
    /// Distinguishes a reloaded shard from the session it replaced.
    generation: u64,
    document: Arc<Mutex<DeckDocument>>,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

#[derive(Default)]
struct ManagerState {
    shards: HashMap<ShardId, ShardEntry>,
    visible: BTreeSet<ShardId>,
    lru: ShardLru,
    manifest: Vec<ShardId>,
    next_generation: u64,
}

pub(crate) struct Shared {
    config: ClientConfig,
    identity: LocalIdentity,
    connector: Arc<dyn ShardConnector>,
    state: Mutex<ManagerState>,
    presence: Mutex<PresenceStore>,
    throttle: Mutex<CursorThrottle>,
    events: broadcast::Sender<ShardEvent>,
}

impl Shared {
    fn emit(&self, event: ShardEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().expect("shard manager state lock poisoned")
    }

    /// Called by a session once its first full state arrived. Returns false
    /// when the session is stale and should shut down.
    fn mark_active(&self, shard_id: &ShardId, generation: u64, element_count: usize) -> bool {
        let mut state = self.lock_state();
        let Some(entry) = state.shards.get_mut(shard_id) else {
            return false;
        };
        if entry.generation != generation || entry.status != ShardStatus::Loading {
            return false;
        }
        entry.status = ShardStatus::Active;
        info!(shard_id = %shard_id, element_count, "shard loaded");
        self.emit(ShardEvent::ShardLoaded { shard_id: shard_id.clone(), element_count });
        true
    }

    fn mark_failed(&self, shard_id: &ShardId, generation: u64, error: &ShardError) {
        let mut state = self.lock_state();
        let Some(entry) = state.shards.get_mut(shard_id) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        if entry.status == ShardStatus::Evicting {
            state.shards.remove(shard_id);
            return;
        }
        entry.status = ShardStatus::Error;
        state.lru.remove(shard_id);
        warn!(shard_id = %shard_id, error = %error, "shard failed");
        self.emit(ShardEvent::ShardError { shard_id: shard_id.clone(), error: error.to_string() });
    }

    /// Session exit: an evicting shard becomes unloaded.
    fn finish_session(&self, shard_id: &ShardId, generation: u64) {
        let mut state = self.lock_state();
        let finished = state.shards.get(shard_id).is_some_and(|entry| {
            entry.generation == generation && entry.status == ShardStatus::Evicting
        });
        if finished {
            state.shards.remove(shard_id);
            debug!(shard_id = %shard_id, "shard unloaded");
        }
    }

    fn send_command(&self, shard_id: &ShardId, command: SessionCommand) -> Result<(), ShardError> {
        let mut state = self.lock_state();
        let sent = match state.shards.get(shard_id) {
            Some(entry) if entry.status == ShardStatus::Active => entry.commands.send(command).is_ok(),
            _ => false,
        };
        if !sent {
            return Err(ShardError::NotActive(shard_id.clone()));
        }
        state.lru.touch(shard_id);
        Ok(())
    }

    fn send_cursor(&self, position: CursorPosition) {
        let message = self.identity.cursor_message(&position, Utc::now().timestamp_millis());
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(error) => {
                debug!(error = %error, "failed to encode cursor");
                return;
            }
        };
        if let Err(error) = self.send_command(&position.shard_id, SessionCommand::SendText(text)) {
            debug!(error = %error, "cursor dropped");
        }
    }
}

/// Client entry point: loads visible shards, keeps a bounded LRU of recently
/// visible ones and exposes their documents and presence.
pub struct ShardManager {
    shared: Arc<Shared>,
    sweeper: JoinHandle<()>,
}

impl ShardManager {
    /// Must be called from within a tokio runtime.
    pub fn new(config: ClientConfig, connector: Arc<dyn ShardConnector>) -> Self {
        let client_id = Uuid::new_v4().to_string();
        let identity = LocalIdentity::new(
            client_id,
            config.identity.display_name.clone(),
            config.identity.color.clone(),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            identity,
            connector,
            state: Mutex::new(ManagerState::default()),
            presence: Mutex::new(PresenceStore::new(config.presence_ttl())),
            throttle: Mutex::new(CursorThrottle::new(config.presence_throttle())),
            events,
            config,
        });
        let sweeper = tokio::spawn(sweep_presence(Arc::downgrade(&shared)));
        Self { shared, sweeper }
    }

    /// Manager talking to `config.relay_url` over WebSockets.
    pub fn connect(config: ClientConfig) -> Result<Self, TransportError> {
        let connector = WsConnector::new(&config.relay_url)?;
        Ok(Self::new(config, Arc::new(connector)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShardEvent> {
        self.shared.events.subscribe()
    }

    pub fn client_id(&self) -> &str {
        &self.shared.identity.client_id
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.shared.identity
    }

    /// Record the deck's shard list, load the first batch and wait for it
    /// (bounded by the handshake timeout). Returns the shards that loaded.
    pub async fn initialize(&self, manifest: Vec<ShardId>) -> Vec<ShardId> {
        let batch: Vec<ShardId> =
            manifest.iter().take(self.shared.config.initial_batch).cloned().collect();
        let mut events = self.subscribe();
        self.shared.lock_state().manifest = manifest;
        self.set_visible_shards(batch.clone());

        let mut waiting: BTreeSet<ShardId> = batch
            .iter()
            .filter(|shard_id| self.shard_status(shard_id) == ShardStatus::Loading)
            .cloned()
            .collect();
        let deadline = tokio::time::Instant::now() + self.shared.config.handshake_timeout();
        while !waiting.is_empty() {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(ShardEvent::ShardLoaded { shard_id, .. }))
                | Ok(Ok(ShardEvent::ShardError { shard_id, .. })) => {
                    waiting.remove(&shard_id);
                }
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    waiting.retain(|shard_id| self.shard_status(shard_id) == ShardStatus::Loading);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
            }
        }

        let ready: Vec<ShardId> = batch
            .into_iter()
            .filter(|shard_id| self.shard_status(shard_id) == ShardStatus::Active)
            .collect();
        info!(ready = ready.len(), "initial shards settled");
        self.shared.emit(ShardEvent::Initialized { ready: ready.clone() });
        ready
    }

    pub fn manifest(&self) -> Vec<ShardId> {
        self.shared.lock_state().manifest.clone()
    }

    /// Replace the visible set. New shards start loading, shards that left
    /// the set stay cached until more than `max_loaded_documents` of them
    /// pile up; the least recently referenced go first.
    pub fn set_visible_shards<I>(&self, shard_ids: I)
    where
        I: IntoIterator<Item = ShardId>,
    {
        let visible: BTreeSet<ShardId> = shard_ids.into_iter().collect();
        let mut state = self.shared.lock_state();

        let hidden: Vec<ShardId> = state.visible.difference(&visible).cloned().collect();
        for shard_id in &hidden {
            state.lru.set_pinned(shard_id, false);
        }

        for shard_id in &visible {
            state.lru.touch(shard_id);
            state.lru.set_pinned(shard_id, true);
            let needs_load = match state.shards.get(shard_id).map(|entry| entry.status) {
                Some(ShardStatus::Loading | ShardStatus::Active) => false,
                Some(ShardStatus::Unloaded | ShardStatus::Evicting | ShardStatus::Error) | None => {
                    true
                }
            };
            if needs_load {
                start_load(&self.shared, &mut state, shard_id.clone());
            }
        }
        state.visible = visible;

        let evicted = state.lru.evict_over(self.shared.config.max_loaded_documents);
        for shard_id in evicted {
            begin_eviction(&self.shared, &mut state, &shard_id);
        }
    }

    pub fn shard_status(&self, shard_id: &ShardId) -> ShardStatus {
        self.shared
            .lock_state()
            .shards
            .get(shard_id)
            .map_or(ShardStatus::Unloaded, |entry| entry.status)
    }

    pub fn active_shards(&self) -> Vec<ShardId> {
        let state = self.shared.lock_state();
        let mut active: Vec<ShardId> = state
            .shards
            .iter()
            .filter(|(_, entry)| entry.status == ShardStatus::Active)
            .map(|(shard_id, _)| shard_id.clone())
            .collect();
        active.sort();
        active
    }

    pub fn visible_shards(&self) -> Vec<ShardId> {
        self.shared.lock_state().visible.iter().cloned().collect()
    }

    /// Flattened content of an active shard.
    pub fn view(&self, shard_id: &ShardId) -> Option<DeckView> {
        let document = {
            let state = self.shared.lock_state();
            let entry = state.shards.get(shard_id)?;
            if entry.status != ShardStatus::Active {
                return None;
            }
            Arc::clone(&entry.document)
        };
        let view = document.lock().expect("shard document lock poisoned").flatten();
        Some(view)
    }

    /// Presence on an active shard; empty for anything else.
    pub fn get_users_for_shard(&self, shard_id: &ShardId) -> Vec<PresenceEntry> {
        if self.shard_status(shard_id) != ShardStatus::Active {
            return Vec::new();
        }
        self.shared
            .presence
            .lock()
            .expect("presence lock poisoned")
            .users_for_shard(shard_id, Instant::now())
    }

    pub fn add_component(
        &self,
        shard_id: &ShardId,
        element_id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), ShardError> {
        let mutation = Mutation::Add { element_id: element_id.to_string(), fields };
        self.mutate(shard_id, mutation)
    }

    pub fn update_component(
        &self,
        shard_id: &ShardId,
        element_id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), ShardError> {
        let mutation = Mutation::Update { element_id: element_id.to_string(), fields };
        self.mutate(shard_id, mutation)
    }

    pub fn remove_component(&self, shard_id: &ShardId, element_id: &str) -> Result<(), ShardError> {
        self.mutate(shard_id, Mutation::Remove { element_id: element_id.to_string() })
    }

    /// Broadcast the local cursor, at most once per throttle interval.
    pub fn update_cursor(&self, shard_id: &ShardId, x: f64, y: f64) -> Result<(), ShardError> {
        if self.shard_status(shard_id) != ShardStatus::Active {
            return Err(ShardError::NotActive(shard_id.clone()));
        }
        let position = CursorPosition { shard_id: shard_id.clone(), x, y };
        let decision = self
            .shared
            .throttle
            .lock()
            .expect("cursor throttle lock poisoned")
            .offer(position, Instant::now());
        match decision {
            ThrottleDecision::SendNow(position) => self.shared.send_cursor(position),
            ThrottleDecision::ScheduleFlush(delay) => {
                let shared = Arc::downgrade(&self.shared);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(shared) = shared.upgrade() else {
                        return;
                    };
                    let pending = shared
                        .throttle
                        .lock()
                        .expect("cursor throttle lock poisoned")
                        .flush(Instant::now());
                    if let Some(position) = pending {
                        shared.send_cursor(position);
                    }
                });
            }
            ThrottleDecision::Coalesced => {}
        }
        Ok(())
    }

    /// Close every session. The manager stays usable; shards reload when
    /// made visible again.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock_state();
        for (shard_id, entry) in state.shards.drain() {
            let _ = entry.commands.send(SessionCommand::Close);
            debug!(shard_id = %shard_id, "closing shard session");
        }
        state.visible.clear();
        state.lru = ShardLru::new();
    }

    fn mutate(&self, shard_id: &ShardId, mutation: Mutation) -> Result<(), ShardError> {
        self.shared.send_command(shard_id, SessionCommand::Mutate(mutation)).inspect_err(|_| {
            warn!(shard_id = %shard_id, "mutation dropped: shard is not active");
        })
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        self.shutdown();
        self.sweeper.abort();
    }
}

fn start_load(shared: &Arc<Shared>, state: &mut ManagerState, shard_id: ShardId) {
    state.next_generation += 1;
    let generation = state.next_generation;
    let document = Arc::new(Mutex::new(DeckDocument::new()));
    let (commands, inbox) = mpsc::unbounded_channel();

    debug!(shard_id = %shard_id, generation, "loading shard");
    state.shards.insert(
        shard_id.clone(),
        ShardEntry {
            status: ShardStatus::Loading,
            generation,
            document: Arc::clone(&document),
            commands,
        },
    );
    let context =
        session::SessionContext { shared: Arc::clone(shared), shard_id, generation, document };
    tokio::spawn(session::run(context, inbox));
}

fn begin_eviction(shared: &Shared, state: &mut ManagerState, shard_id: &ShardId) {
    let Some(entry) = state.shards.get_mut(shard_id) else {
        return;
    };
    entry.status = ShardStatus::Evicting;
    if entry.commands.send(SessionCommand::Close).is_err() {
        state.shards.remove(shard_id);
    }
    info!(shard_id = %shard_id, "evicting shard");
    shared.emit(ShardEvent::ShardEvicted { shard_id: shard_id.clone() });
}

async fn sweep_presence(shared: Weak<Shared>) {
    let period = match shared.upgrade() {
        Some(shared) => shared.config.presence_sweep_interval(),
        None => return,
    };
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let removed =
            shared.presence.lock().expect("presence lock poisoned").sweep(Instant::now());
        if removed > 0 {
            debug!(removed, "expired presence entries");
        }
    }
}
