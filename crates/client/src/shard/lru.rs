// Recency bookkeeping for loaded shards. Visible shards are pinned and never
// offered for eviction.

use std::collections::HashMap;

use decksync_common::types::ShardId;

#[derive(Debug, Clone, Copy)]
struct LruEntry {
    last_ref: u64,
    pinned: bool,
}

#[derive(Debug)]
pub struct ShardLru {
    entries: HashMap<ShardId, LruEntry>,
    next_tick: u64,
}

impl Default for ShardLru {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardLru {
    pub fn new() -> Self {
        Self { entries: HashMap::new(), next_tick: 1 }
    }

    /// Record a reference, inserting the shard if it is new.
    pub fn touch(&mut self, shard_id: &ShardId) {
        let tick = self.bump_tick();
        self.entries
            .entry(shard_id.clone())
            .and_modify(|entry| entry.last_ref = tick)
            .or_insert(LruEntry { last_ref: tick, pinned: false });
    }

    pub fn set_pinned(&mut self, shard_id: &ShardId, pinned: bool) {
        if let Some(entry) = self.entries.get_mut(shard_id) {
            entry.pinned = pinned;
        }
    }

    pub fn remove(&mut self, shard_id: &ShardId) -> bool {
        self.entries.remove(shard_id).is_some()
    }

    pub fn contains(&self, shard_id: &ShardId) -> bool {
        self.entries.contains_key(shard_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn unpinned_len(&self) -> usize {
        self.entries.values().filter(|entry| !entry.pinned).count()
    }

    /// Unpinned shards, least recently referenced first. Ties go to the
    /// smaller shard id.
    pub fn unpinned_by_recency(&self) -> Vec<ShardId> {
        let mut candidates: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.pinned)
            .map(|(shard_id, entry)| (entry.last_ref, shard_id.clone()))
            .collect();
        candidates.sort();
        candidates.into_iter().map(|(_, shard_id)| shard_id).collect()
    }

    /// Remove and return the shards to evict so that at most `capacity`
    /// unpinned shards remain.
    pub fn evict_over(&mut self, capacity: usize) -> Vec<ShardId> {
        let candidates = self.unpinned_by_recency();
        let excess = candidates.len().saturating_sub(capacity);
        let evicted: Vec<_> = candidates.into_iter().take(excess).collect();
        for shard_id in &evicted {
            self.entries.remove(shard_id);
        }
        evicted
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick = self.next_tick.saturating_add(1);
        tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: &str) -> ShardId {
        ShardId::new(id).unwrap()
    }

    #[test]
    fn evicts_least_recent_unpinned_first() {
        let mut lru = ShardLru::new();
        for id in ["a", "b", "c", "d"] {
            lru.touch(&shard(id));
        }
        lru.touch(&shard("a"));
        lru.set_pinned(&shard("b"), true);

        assert_eq!(lru.unpinned_by_recency(), vec![shard("c"), shard("d"), shard("a")]);
        assert_eq!(lru.evict_over(1), vec![shard("c"), shard("d")]);
        assert!(lru.contains(&shard("a")));
        assert!(lru.contains(&shard("b")));
        assert_eq!(lru.unpinned_len(), 1);
    }

    #[test]
    fn pinned_shards_survive_any_pressure() {
        let mut lru = ShardLru::new();
        for id in ["a", "b", "c"] {
            lru.touch(&shard(id));
            lru.set_pinned(&shard(id), true);
        }
        assert!(lru.evict_over(0).is_empty());
        assert_eq!(lru.len(), 3);
    }

    #[test]
    fn remove_forgets_shard() {
        let mut lru = ShardLru::new();
        lru.touch(&shard("a"));
        assert!(lru.remove(&shard("a")));
        assert!(!lru.remove(&shard("a")));
        assert_eq!(lru.len(), 0);
    }
}
