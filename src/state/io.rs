use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::rollup::Granularity;
use crate::state::SlotState;

/// Persistence seam for shard state.
///
/// The backing store is written concurrently by every process in the
/// fleet; last-writer-wins at row granularity is acceptable because
/// readers reconcile through the merge rules in
/// [`ShardStateManager::update_slot_on_read`](crate::state::ShardStateManager::update_slot_on_read).
#[async_trait]
pub trait ShardStateIo: Send + Sync {
    /// Reads all persisted slot rows for one shard.
    async fn get_shard_state(&self, shard: i32) -> Result<Vec<SlotState>>;

    /// Persists slot rows for one shard.
    async fn put_shard_state(&self, shard: i32, slots: &[SlotState]) -> Result<()>;
}

/// In-memory shard state store: the standalone/single-node backing and
/// the test substrate. Rows are keyed by (granularity, slot) per shard,
/// newest write wins, like the real store's column semantics.
#[derive(Default)]
pub struct MemoryShardStateIo {
    rows: Mutex<HashMap<i32, HashMap<(Granularity, i32), SlotState>>>,
    fail_reads: Mutex<bool>,
    fail_writes: Mutex<bool>,
}

impl MemoryShardStateIo {
    pub fn new() -> MemoryShardStateIo {
        MemoryShardStateIo::default()
    }

    /// Makes subsequent reads or writes fail, for exercising the error
    /// paths.
    pub fn set_fail_reads(&self, fail: bool) {
        *self.fail_reads.lock() = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    /// Number of rows currently stored for a shard.
    pub fn row_count(&self, shard: i32) -> usize {
        self.rows.lock().get(&shard).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl ShardStateIo for MemoryShardStateIo {
    async fn get_shard_state(&self, shard: i32) -> Result<Vec<SlotState>> {
        if *self.fail_reads.lock() {
            bail!("shard state store unavailable");
        }
        Ok(self
            .rows
            .lock()
            .get(&shard)
            .map(|rows| rows.values().copied().collect())
            .unwrap_or_default())
    }

    async fn put_shard_state(&self, shard: i32, slots: &[SlotState]) -> Result<()> {
        if *self.fail_writes.lock() {
            bail!("shard state store unavailable");
        }
        let mut rows = self.rows.lock();
        let shard_rows = rows.entry(shard).or_default();
        for slot in slots {
            shard_rows.insert((slot.granularity, slot.slot), *slot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StampState;

    #[tokio::test]
    async fn test_round_trip_latest_write_wins() {
        let io = MemoryShardStateIo::new();
        let first = SlotState::new(Granularity::Min5, 4, StampState::Active)
            .with_timestamp(1_234_000)
            .with_last_updated(1_234_000);
        let second = SlotState::new(Granularity::Min5, 4, StampState::Rolled)
            .with_timestamp(1_234_000)
            .with_last_updated(1_500_000);

        io.put_shard_state(0, &[first]).await.expect("put");
        io.put_shard_state(0, &[second]).await.expect("put");

        let rows = io.get_shard_state(0).await.expect("get");
        assert_eq!(rows, vec![second]);
        assert_eq!(io.row_count(0), 1);
    }

    #[tokio::test]
    async fn test_unknown_shard_reads_empty() {
        let io = MemoryShardStateIo::new();
        assert!(io.get_shard_state(9).await.expect("get").is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let io = MemoryShardStateIo::new();
        io.set_fail_reads(true);
        assert!(io.get_shard_state(0).await.is_err());
        io.set_fail_reads(false);
        assert!(io.get_shard_state(0).await.is_ok());

        io.set_fail_writes(true);
        assert!(io.put_shard_state(0, &[]).await.is_err());
    }
}
