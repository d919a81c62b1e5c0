// Snapshot boundary: rooms hand full-state blobs to an external store.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Mutex,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use decksync_common::types::ShardId;

pub type SnapshotStoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Opaque full-state blob plus the bookkeeping the store attaches to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub shard_id: ShardId,
    /// Strictly increasing per shard.
    pub version: u64,
    pub saved_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

pub trait SnapshotStore: Send + Sync {
    fn load<'a>(&'a self, shard_id: &'a ShardId) -> SnapshotStoreFuture<'a, Option<StoredSnapshot>>;

    /// Persist `payload` and return the version assigned to it.
    fn save<'a>(&'a self, shard_id: &'a ShardId, payload: Vec<u8>) -> SnapshotStoreFuture<'a, u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Accepted updates between saves; 0 saves only on room shutdown.
    pub every_updates: u64,
}

impl SnapshotPolicy {
    pub fn should_snapshot(&self, updates_since_save: u64) -> bool {
        self.every_updates > 0 && updates_since_save >= self.every_updates
    }
}

/// Keeps the latest snapshot per shard in process memory.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<ShardId, StoredSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, shard_id: &ShardId) -> Option<StoredSnapshot> {
        self.snapshots.lock().expect("snapshot store lock poisoned").get(shard_id).cloned()
    }

    /// Seed a snapshot directly (used to stage recovery scenarios).
    pub fn insert(&self, shard_id: ShardId, payload: Vec<u8>) -> u64 {
        let mut snapshots = self.snapshots.lock().expect("snapshot store lock poisoned");
        store_next(&mut snapshots, shard_id, payload)
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load<'a>(
        &'a self,
        shard_id: &'a ShardId,
    ) -> SnapshotStoreFuture<'a, Option<StoredSnapshot>> {
        Box::pin(async move { Ok(self.latest(shard_id)) })
    }

    fn save<'a>(&'a self, shard_id: &'a ShardId, payload: Vec<u8>) -> SnapshotStoreFuture<'a, u64> {
        Box::pin(async move { Ok(self.insert(shard_id.clone(), payload)) })
    }
}

fn store_next(
    snapshots: &mut HashMap<ShardId, StoredSnapshot>,
    shard_id: ShardId,
    payload: Vec<u8>,
) -> u64 {
    let version = snapshots.get(&shard_id).map_or(1, |previous| previous.version + 1);
    snapshots.insert(
        shard_id.clone(),
        StoredSnapshot { shard_id, version, saved_at: Utc::now(), payload },
    );
    version
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: &str) -> ShardId {
        ShardId::new(id).expect("test shard id should be valid")
    }

    #[tokio::test]
    async fn versions_increase_per_shard() {
        let store = MemorySnapshotStore::new();
        let page_1 = shard("page-1");
        let page_2 = shard("page-2");

        assert_eq!(store.save(&page_1, vec![1]).await.unwrap(), 1);
        assert_eq!(store.save(&page_1, vec![2]).await.unwrap(), 2);
        assert_eq!(store.save(&page_2, vec![3]).await.unwrap(), 1);

        let latest = store.load(&page_1).await.unwrap().expect("snapshot should exist");
        assert_eq!(latest.version, 2);
        assert_eq!(latest.payload, vec![2]);
    }

    #[tokio::test]
    async fn missing_shard_loads_none() {
        let store = MemorySnapshotStore::new();
        assert!(store.load(&shard("nothing")).await.unwrap().is_none());
    }

    #[test]
    fn policy_triggers_on_threshold_only() {
        let policy = SnapshotPolicy { every_updates: 3 };
        assert!(!policy.should_snapshot(2));
        assert!(policy.should_snapshot(3));
        assert!(!SnapshotPolicy { every_updates: 0 }.should_snapshot(10_000));
    }
}
