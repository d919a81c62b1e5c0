use std::sync::Arc;
use std::time::{Duration, Instant};

use decksync_client::{ClientConfig, ShardEvent, ShardManager, ShardStatus};
use decksync_common::types::ShardId;
use decksync_relay::{build_router, config::RoomConfig, snapshot::MemorySnapshotStore, AppState};
use serde_json::json;
use tokio::net::TcpListener;

async fn spawn_relay() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    let state = AppState::new(RoomConfig::default(), Arc::new(MemorySnapshotStore::new()));
    let app = build_router(state);
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("relay server should run");
    });
    (format!("ws://{addr}"), server_task)
}

fn client_config(relay_url: &str, name: &str) -> ClientConfig {
    let mut config = ClientConfig { relay_url: relay_url.to_string(), ..ClientConfig::default() };
    config.identity.display_name = name.to_string();
    config.handshake_timeout_ms = 2_000;
    config
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn two_managers_share_edits_and_cursors_through_the_relay() {
    let (relay_url, server_task) = spawn_relay().await;
    let page = ShardId::new("page-1").expect("shard id should be valid");

    let alice = ShardManager::connect(client_config(&relay_url, "Alice")).expect("valid url");
    let bob = ShardManager::connect(client_config(&relay_url, "Bob")).expect("valid url");

    let ready = alice.initialize(vec![page.clone()]).await;
    assert_eq!(ready, vec![page.clone()]);
    bob.set_visible_shards([page.clone()]);
    wait_until(|| bob.shard_status(&page) == ShardStatus::Active, "bob to load").await;

    let fields = json!({ "kind": "text", "body": "hello" }).as_object().cloned().unwrap();
    alice.add_component(&page, "E1", fields).expect("alice's shard is active");
    wait_until(
        || bob.view(&page).is_some_and(|view| view.element("E1").is_some()),
        "bob to see E1",
    )
    .await;

    let edit = json!({ "body": "hello, world" }).as_object().cloned().unwrap();
    bob.update_component(&page, "E1", edit).expect("bob's shard is active");
    wait_until(
        || {
            alice.view(&page).is_some_and(|view| {
                view.element("E1").and_then(|fields| fields.get("body"))
                    == Some(&json!("hello, world"))
            })
        },
        "alice to see bob's edit",
    )
    .await;

    alice.update_cursor(&page, 0.5, 0.25).expect("cursor on active shard");
    wait_until(|| !bob.get_users_for_shard(&page).is_empty(), "bob to see alice's cursor").await;
    let users = bob.get_users_for_shard(&page);
    assert_eq!(users[0].client_id, alice.client_id());
    assert_eq!(users[0].user.name, "Alice");
    assert!(users[0].timestamp.is_some());

    drop(alice);
    wait_until(|| bob.get_users_for_shard(&page).is_empty(), "alice's presence to leave").await;

    server_task.abort();
}

#[tokio::test]
async fn late_joiner_receives_existing_content() {
    let (relay_url, server_task) = spawn_relay().await;
    let page = ShardId::new("page-2").expect("shard id should be valid");

    let writer = ShardManager::connect(client_config(&relay_url, "Writer")).expect("valid url");
    writer.set_visible_shards([page.clone()]);
    wait_until(|| writer.shard_status(&page) == ShardStatus::Active, "writer to load").await;
    for index in 0..3 {
        let fields = json!({ "index": index }).as_object().cloned().unwrap();
        writer.add_component(&page, &format!("E{index}"), fields).expect("active shard");
    }

    let reader = ShardManager::connect(client_config(&relay_url, "Reader")).expect("valid url");
    let mut events = reader.subscribe();
    // Give the writer's edits time to reach the room before the reader joins.
    tokio::time::sleep(Duration::from_millis(100)).await;
    reader.set_visible_shards([page.clone()]);

    let loaded = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(ShardEvent::ShardLoaded { shard_id, element_count }) = events.recv().await {
                if shard_id == page {
                    return element_count;
                }
            }
        }
    })
    .await
    .expect("reader should load the shard");
    assert_eq!(loaded, 3);

    server_task.abort();
}
