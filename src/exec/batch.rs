use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::context::RollupExecutionContext;
use super::io::{RollupWriter, SingleRollupWriteContext};

/// Buffers computed rollups and dispatches them to the bounded write
/// pool in size-bounded batches.
///
/// Dispatch happens once `min_batch_size` results are buffered and the
/// write pool has a free worker; a saturated pool lets the buffer grow
/// up to `max_batch_size`, at which point a batch is dispatched
/// regardless (it queues on the pool). The execution context's write
/// counter tracks every buffered result from enqueue until its batch's
/// write completes, so the drain predicate never observes a lull
/// between buffering and dispatch.
pub struct RollupBatchWriter {
    queue: Mutex<VecDeque<SingleRollupWriteContext>>,
    writer: Arc<dyn RollupWriter>,
    write_pool: Arc<Semaphore>,
    execution_context: Arc<RollupExecutionContext>,
    min_batch_size: usize,
    max_batch_size: usize,
}

impl RollupBatchWriter {
    pub fn new(
        writer: Arc<dyn RollupWriter>,
        write_pool: Arc<Semaphore>,
        execution_context: Arc<RollupExecutionContext>,
        min_batch_size: usize,
        max_batch_size: usize,
    ) -> RollupBatchWriter {
        RollupBatchWriter {
            queue: Mutex::new(VecDeque::new()),
            writer,
            write_pool,
            execution_context,
            min_batch_size: min_batch_size.max(1),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Buffers one result, dispatching a batch when the thresholds say
    /// so.
    pub fn enqueue_rollup_for_write(&self, rollup: SingleRollupWriteContext) {
        let len = {
            let mut queue = self.queue.lock();
            queue.push_back(rollup);
            queue.len()
        };
        self.execution_context.increment_write_counter();

        if len >= self.min_batch_size
            && (self.write_pool.available_permits() > 0 || len >= self.max_batch_size)
        {
            self.drain_batch();
        }
    }

    /// Dispatches up to `max_batch_size` buffered results as one write
    /// task. No-op on an empty buffer, so the drain loop can call it
    /// repeatedly.
    pub fn drain_batch(&self) {
        let batch: Vec<SingleRollupWriteContext> = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(self.max_batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "dispatching rollup write batch");

        let writer = Arc::clone(&self.writer);
        let pool = Arc::clone(&self.write_pool);
        let execution_context = Arc::clone(&self.execution_context);
        tokio::spawn(async move {
            let batch_len = batch.len();
            let _permit = match pool.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Pool closed during shutdown; account and bail.
                    execution_context.decrement_write_counter_by(batch_len);
                    return;
                }
            };
            if let Err(e) = writer.insert_rollups(&batch).await {
                warn!(error = %e, count = batch_len, "rollup batch write failed");
                execution_context.mark_unsuccessful(&e);
            }
            execution_context.decrement_write_counter_by(batch_len);
        });
    }

    /// Buffered results not yet dispatched.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::io::{Locator, MemoryLocatorStore, RollupValue};
    use crate::rollup::Granularity;
    use std::time::Duration;

    fn write_context(slot: i32) -> SingleRollupWriteContext {
        SingleRollupWriteContext {
            locator: Locator::new("t1", "cpu.user"),
            granularity: Granularity::Min5,
            slot,
            rollup: RollupValue {
                point_count: 1,
                payload: vec![],
            },
        }
    }

    async fn wait_for_writes(ctx: &RollupExecutionContext) {
        for _ in 0..200 {
            if ctx.done_writing() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("writes never completed");
    }

    #[tokio::test]
    async fn test_buffers_below_min_batch() {
        let store = Arc::new(MemoryLocatorStore::new());
        let ctx = Arc::new(RollupExecutionContext::new());
        let writer = Arc::new(RollupBatchWriter::new(
            store.clone() as Arc<dyn RollupWriter>,
            Arc::new(Semaphore::new(2)),
            Arc::clone(&ctx),
            3,
            10,
        ));

        writer.enqueue_rollup_for_write(write_context(0));
        writer.enqueue_rollup_for_write(write_context(1));
        assert_eq!(writer.pending(), 2);
        assert!(!ctx.done_writing());
        assert_eq!(store.written_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatches_at_min_batch_with_free_pool() {
        let store = Arc::new(MemoryLocatorStore::new());
        let ctx = Arc::new(RollupExecutionContext::new());
        let writer = Arc::new(RollupBatchWriter::new(
            store.clone() as Arc<dyn RollupWriter>,
            Arc::new(Semaphore::new(2)),
            Arc::clone(&ctx),
            3,
            10,
        ));

        for slot in 0..3 {
            writer.enqueue_rollup_for_write(write_context(slot));
        }
        assert_eq!(writer.pending(), 0);
        wait_for_writes(&ctx).await;
        assert_eq!(store.written_count(), 3);
        assert!(ctx.was_successful());
    }

    #[tokio::test]
    async fn test_saturated_pool_defers_until_max_batch() {
        let store = Arc::new(MemoryLocatorStore::new());
        let ctx = Arc::new(RollupExecutionContext::new());
        let pool = Arc::new(Semaphore::new(1));
        // Saturate the pool.
        let held = pool.clone().try_acquire_owned().expect("permit");

        let writer = Arc::new(RollupBatchWriter::new(
            store.clone() as Arc<dyn RollupWriter>,
            Arc::clone(&pool),
            Arc::clone(&ctx),
            2,
            5,
        ));

        for slot in 0..4 {
            writer.enqueue_rollup_for_write(write_context(slot));
        }
        // Past min, pool busy, below max: still buffered.
        assert_eq!(writer.pending(), 4);

        // Hitting max dispatches regardless of saturation.
        writer.enqueue_rollup_for_write(write_context(4));
        assert_eq!(writer.pending(), 0);

        drop(held);
        wait_for_writes(&ctx).await;
        assert_eq!(store.written_count(), 5);
    }

    #[tokio::test]
    async fn test_drain_batch_flushes_partial_and_is_idempotent() {
        let store = Arc::new(MemoryLocatorStore::new());
        let ctx = Arc::new(RollupExecutionContext::new());
        let writer = Arc::new(RollupBatchWriter::new(
            store.clone() as Arc<dyn RollupWriter>,
            Arc::new(Semaphore::new(2)),
            Arc::clone(&ctx),
            10,
            20,
        ));

        writer.enqueue_rollup_for_write(write_context(0));
        writer.drain_batch();
        writer.drain_batch(); // no-op on empty buffer

        wait_for_writes(&ctx).await;
        assert_eq!(store.written_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_marks_context_and_settles_counter() {
        let store = Arc::new(MemoryLocatorStore::new());
        store.set_fail_inserts(true);
        let ctx = Arc::new(RollupExecutionContext::new());
        let writer = Arc::new(RollupBatchWriter::new(
            store.clone() as Arc<dyn RollupWriter>,
            Arc::new(Semaphore::new(2)),
            Arc::clone(&ctx),
            1,
            10,
        ));

        writer.enqueue_rollup_for_write(write_context(0));
        wait_for_writes(&ctx).await;
        assert!(!ctx.was_successful());
        assert_eq!(store.written_count(), 0);
    }
}
