// One task per loaded shard: connects, performs the initial sync, then keeps
// the local document and the relay in step until evicted.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use decksync_common::crdt::{is_empty_update, DeckDocument, DocumentError};
use decksync_common::protocol::frame::{encode_sync_step1, encode_sync_step2, encode_update};
use decksync_common::protocol::presence::parse_text;
use decksync_common::protocol::{SyncFrame, TextMessage, SYNC_REQUEST_SENTINEL};
use decksync_common::types::ShardId;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant as Deadline};
use tracing::{debug, info, warn};

use super::{Mutation, SessionCommand, Shared};
use crate::error::{ShardError, TransportError};
use crate::transport::{LinkMessage, ShardLink};

pub(super) struct SessionContext {
    pub(super) shared: Arc<Shared>,
    pub(super) shard_id: ShardId,
    pub(super) generation: u64,
    pub(super) document: Arc<Mutex<DeckDocument>>,
}

enum Drive {
    Closed,
    LinkLost(String),
}

pub(super) async fn run(ctx: SessionContext, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
    let mut link = match establish(&ctx, &mut commands).await {
        Ok(Some(link)) => link,
        Ok(None) => {
            ctx.shared.finish_session(&ctx.shard_id, ctx.generation);
            return;
        }
        Err(error) => {
            ctx.shared.mark_failed(&ctx.shard_id, ctx.generation, &error);
            return;
        }
    };

    let element_count = ctx.document.lock().expect("shard document lock poisoned").element_count();
    if !ctx.shared.mark_active(&ctx.shard_id, ctx.generation, element_count) {
        let _ = link.close().await;
        ctx.shared.finish_session(&ctx.shard_id, ctx.generation);
        return;
    }

    loop {
        match drive(&ctx, link.as_mut(), &mut commands).await {
            Drive::Closed => {
                let _ = link.close().await;
                break;
            }
            Drive::LinkLost(reason) => {
                warn!(shard_id = %ctx.shard_id, reason = %reason, "shard link lost, reconnecting");
                match reconnect(&ctx, &mut commands).await {
                    Ok(Some(next)) => link = next,
                    Ok(None) => break,
                    Err(error) => {
                        ctx.shared.mark_failed(&ctx.shard_id, ctx.generation, &error);
                        return;
                    }
                }
            }
        }
    }
    ctx.shared.finish_session(&ctx.shard_id, ctx.generation);
}

/// Connect, send our state vector and wait for the relay's full state, all
/// within one handshake timeout. `Ok(None)` means the session was closed
/// while waiting.
async fn establish(
    ctx: &SessionContext,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> Result<Option<Box<dyn ShardLink>>, ShardError> {
    let deadline = Deadline::now() + ctx.shared.config.handshake_timeout();
    let timed_out = || ShardError::HandshakeTimeout(ctx.shard_id.clone());

    let mut link = timeout_at(deadline, ctx.shared.connector.connect(&ctx.shard_id))
        .await
        .map_err(|_| timed_out())??;

    let state_vector =
        ctx.document.lock().expect("shard document lock poisoned").encode_state_vector();
    link.send(LinkMessage::Binary(encode_sync_step1(&state_vector))).await?;

    loop {
        tokio::select! {
            received = link.recv() => {
                let Some(message) = received? else {
                    return Err(ShardError::ClosedDuringHandshake(ctx.shard_id.clone()));
                };
                if handle_remote(ctx, link.as_mut(), message).await? {
                    return Ok(Some(link));
                }
            }
            command = commands.recv() => match command {
                Some(SessionCommand::Close) | None => {
                    let _ = link.close().await;
                    return Ok(None);
                }
                Some(command) => apply_offline(ctx, command),
            },
            _ = sleep_until(deadline) => return Err(timed_out()),
        }
    }
}

async fn drive(
    ctx: &SessionContext,
    link: &mut dyn ShardLink,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> Drive {
    loop {
        tokio::select! {
            command = commands.recv() => {
                let outgoing = match command {
                    Some(SessionCommand::Close) | None => return Drive::Closed,
                    Some(SessionCommand::Mutate(mutation)) => {
                        apply_mutation(ctx, mutation).map(|update| {
                            LinkMessage::Binary(encode_update(&update))
                        })
                    }
                    Some(SessionCommand::SendText(text)) => Some(LinkMessage::Text(text)),
                };
                if let Some(message) = outgoing {
                    if let Err(error) = link.send(message).await {
                        return Drive::LinkLost(error.to_string());
                    }
                }
            }
            received = link.recv() => match received {
                Ok(Some(message)) => {
                    if let Err(error) = handle_remote(ctx, link, message).await {
                        return Drive::LinkLost(error.to_string());
                    }
                }
                Ok(None) => return Drive::LinkLost("closed by relay".into()),
                Err(error) => return Drive::LinkLost(error.to_string()),
            },
        }
    }
}

/// Back off and reconnect. Local edits keep landing in the document while
/// offline; the state-vector exchange on reconnect ships them.
async fn reconnect(
    ctx: &SessionContext,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> Result<Option<Box<dyn ShardLink>>, ShardError> {
    let policy = ctx.shared.config.reconnect.policy();
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        if !policy.allows_attempt(attempt) {
            return Err(ShardError::ReconnectExhausted {
                shard_id: ctx.shard_id.clone(),
                attempts: attempt - 1,
            });
        }

        let wake = Deadline::now() + policy.delay_for_attempt(attempt);
        loop {
            tokio::select! {
                _ = sleep_until(wake) => break,
                command = commands.recv() => match command {
                    Some(SessionCommand::Close) | None => return Ok(None),
                    Some(command) => apply_offline(ctx, command),
                },
            }
        }

        match establish(ctx, commands).await {
            Ok(Some(link)) => {
                info!(shard_id = %ctx.shard_id, attempt, "shard link re-established");
                return Ok(Some(link));
            }
            Ok(None) => return Ok(None),
            Err(error) => {
                debug!(shard_id = %ctx.shard_id, attempt, error = %error, "reconnect attempt failed");
            }
        }
    }
}

/// Handle one frame from the relay. Returns true for a full-state frame,
/// which completes the handshake.
async fn handle_remote(
    ctx: &SessionContext,
    link: &mut dyn ShardLink,
    message: LinkMessage,
) -> Result<bool, TransportError> {
    match message {
        LinkMessage::Binary(frame) => handle_sync_frame(ctx, link, &frame).await,
        LinkMessage::Text(text) => {
            handle_text(ctx, &text);
            Ok(false)
        }
    }
}

async fn handle_sync_frame(
    ctx: &SessionContext,
    link: &mut dyn ShardLink,
    frame: &[u8],
) -> Result<bool, TransportError> {
    let decoded = match SyncFrame::decode(frame) {
        Ok(decoded) => decoded,
        Err(error) => {
            debug!(shard_id = %ctx.shard_id, reason = error.reason(), "ignoring unreadable frame");
            return Ok(false);
        }
    };

    match decoded {
        SyncFrame::Step2(update) => {
            if apply_remote(ctx, &update).is_ok() {
                return Ok(true);
            }
            link.send(LinkMessage::Binary(SYNC_REQUEST_SENTINEL.to_vec())).await?;
        }
        SyncFrame::Update(update) => {
            if apply_remote(ctx, &update).is_err() {
                link.send(LinkMessage::Binary(SYNC_REQUEST_SENTINEL.to_vec())).await?;
            }
        }
        SyncFrame::Step1(state_vector) => {
            let diff = ctx
                .document
                .lock()
                .expect("shard document lock poisoned")
                .encode_diff(&state_vector);
            match diff {
                Ok(diff) if !is_empty_update(&diff) => {
                    link.send(LinkMessage::Binary(encode_sync_step2(&diff))).await?;
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(shard_id = %ctx.shard_id, error = %error, "unreadable relay state vector");
                }
            }
        }
        SyncFrame::Awareness(_) => {}
    }
    Ok(false)
}

fn apply_remote(ctx: &SessionContext, update: &[u8]) -> Result<(), DocumentError> {
    let result = ctx.document.lock().expect("shard document lock poisoned").apply_update(update);
    if let Err(error) = &result {
        warn!(
            shard_id = %ctx.shard_id,
            bytes = update.len(),
            error = %error,
            "remote update failed to apply, requesting resync"
        );
    }
    result
}

fn handle_text(ctx: &SessionContext, text: &str) {
    match parse_text(text) {
        Ok(TextMessage::Presence(message)) => {
            if message.client_id == ctx.shared.identity.client_id {
                return;
            }
            ctx.shared.presence.lock().expect("presence lock poisoned").upsert(message, Instant::now());
        }
        Ok(TextMessage::Leave(leave)) => {
            ctx.shared.presence.lock().expect("presence lock poisoned").remove(&leave.client_id);
        }
        Ok(TextMessage::Other(value)) => {
            debug!(shard_id = %ctx.shard_id, message = %value, "ignoring control message");
        }
        Err(error) => {
            debug!(shard_id = %ctx.shard_id, error = %error, "dropping malformed text frame");
        }
    }
}

/// Apply a local edit; returns the update to ship, if there is one.
fn apply_mutation(ctx: &SessionContext, mutation: Mutation) -> Option<Vec<u8>> {
    let result = {
        let document = ctx.document.lock().expect("shard document lock poisoned");
        match &mutation {
            Mutation::Add { element_id, fields } => {
                document.add_element(ctx.shard_id.as_str(), element_id, fields)
            }
            Mutation::Update { element_id, fields } => document.update_element(element_id, fields),
            Mutation::Remove { element_id } => document.remove_element(element_id),
        }
    };
    match result {
        Ok(update) if is_empty_update(&update) => None,
        Ok(update) => Some(update),
        Err(error) => {
            warn!(shard_id = %ctx.shard_id, mutation = ?mutation, error = %error, "local edit failed");
            None
        }
    }
}

/// Commands received with no link: edits apply locally, cursors are dropped.
fn apply_offline(ctx: &SessionContext, command: SessionCommand) {
    match command {
        SessionCommand::Mutate(mutation) => {
            let _ = apply_mutation(ctx, mutation);
        }
        SessionCommand::SendText(_) | SessionCommand::Close => {}
    }
}
