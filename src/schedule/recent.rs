use std::collections::HashMap;

use parking_lot::Mutex;

/// Fixed-capacity record of which shards recently had slots scheduled.
///
/// Operational visibility only, never load-bearing: entries expire on
/// read, and when full the stalest entry is evicted. Deliberately not a
/// caching-library dependency.
pub struct RecentShardCache {
    capacity: usize,
    ttl_millis: u64,
    entries: Mutex<HashMap<i32, u64>>,
}

impl RecentShardCache {
    pub fn new(capacity: usize, ttl_millis: u64) -> RecentShardCache {
        RecentShardCache {
            capacity,
            ttl_millis,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `shard` had work scheduled at `now`.
    pub fn put(&self, shard: i32, now: u64) {
        let mut entries = self.entries.lock();
        entries.insert(shard, now);
        if entries.len() > self.capacity {
            if let Some(stalest) = entries
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(shard, _)| *shard)
            {
                entries.remove(&stalest);
            }
        }
    }

    /// The shards scheduled within the TTL as of `now`, sorted. Expired
    /// entries are dropped as a side effect.
    pub fn shards(&self, now: u64) -> Vec<i32> {
        let mut entries = self.entries.lock();
        entries.retain(|_, at| now.saturating_sub(*at) <= self.ttl_millis);
        let mut shards: Vec<i32> = entries.keys().copied().collect();
        shards.sort_unstable();
        shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_expire_on_read() {
        let cache = RecentShardCache::new(8, 1_000);
        cache.put(0, 10_000);
        cache.put(1, 10_500);

        assert_eq!(cache.shards(10_900), vec![0, 1]);
        assert_eq!(cache.shards(11_100), vec![1]);
        assert_eq!(cache.shards(12_000), Vec::<i32>::new());
    }

    #[test]
    fn test_reinsert_refreshes_expiry() {
        let cache = RecentShardCache::new(8, 1_000);
        cache.put(0, 10_000);
        cache.put(0, 11_000);
        assert_eq!(cache.shards(11_900), vec![0]);
    }

    #[test]
    fn test_capacity_evicts_stalest() {
        let cache = RecentShardCache::new(2, 60_000);
        cache.put(0, 100);
        cache.put(1, 200);
        cache.put(2, 300);
        assert_eq!(cache.shards(300), vec![1, 2]);
    }
}
