pub mod batch;
pub mod context;
pub mod io;

pub use batch::RollupBatchWriter;
pub use context::RollupExecutionContext;
pub use io::{
    Locator, LocatorIo, MemoryLocatorStore, RollupSource, RollupValue, RollupWriter,
    SingleRollupWriteContext,
};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::rollup::SlotKey;
use crate::schedule::ScheduleContext;

/// Builds the per-slot execution context; substituted by tests.
pub type ExecutionContextFactory =
    Arc<dyn Fn() -> Arc<RollupExecutionContext> + Send + Sync>;

/// Builds the per-slot batch writer; substituted by tests.
pub type BatchWriterFactory =
    Arc<dyn Fn(Arc<RollupExecutionContext>) -> Arc<RollupBatchWriter> + Send + Sync>;

/// Knobs for one slot execution.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Sleep between checks of the drain predicate. The drain loop
    /// never spins without sleeping on this.
    pub drain_poll_interval: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> ExecutionConfig {
        ExecutionConfig {
            min_batch_size: 5,
            max_batch_size: 100,
            drain_poll_interval: Duration::from_millis(100),
        }
    }
}

/// How one slot execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// All locators processed and written; the slot is rolled.
    Completed,
    /// Some locator or batch failed; the slot was pushed back.
    Failed,
    /// Cancelled mid-drain; the slot was pushed back.
    Aborted,
    /// Nothing finer to roll from; no accounting was touched.
    Skipped,
}

/// Report returned to the dispatching service.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub locator_count: usize,
}

/// Executes one scheduled slot: fetches the locators with data in the
/// source range, fans read+aggregate work out over the bounded read
/// pool, funnels results through the batch writer, drains, and reports
/// completion back to the scheduler.
///
/// Per-locator failures are isolated: they mark the execution
/// unsuccessful but do not stop sibling locators. The retry unit is the
/// whole slot.
pub struct LocatorFetchTask {
    schedule_context: Arc<ScheduleContext>,
    key: SlotKey,
    locator_io: Arc<dyn LocatorIo>,
    source: Arc<dyn RollupSource>,
    read_pool: Arc<Semaphore>,
    config: ExecutionConfig,
    context_factory: ExecutionContextFactory,
    batch_writer_factory: BatchWriterFactory,
}

impl LocatorFetchTask {
    pub fn new(
        schedule_context: Arc<ScheduleContext>,
        key: SlotKey,
        locator_io: Arc<dyn LocatorIo>,
        source: Arc<dyn RollupSource>,
        writer: Arc<dyn RollupWriter>,
        read_pool: Arc<Semaphore>,
        write_pool: Arc<Semaphore>,
        config: ExecutionConfig,
    ) -> LocatorFetchTask {
        let batch_writer_config = config.clone();
        let batch_writer_factory: BatchWriterFactory = Arc::new(move |execution_context| {
            Arc::new(RollupBatchWriter::new(
                Arc::clone(&writer),
                Arc::clone(&write_pool),
                execution_context,
                batch_writer_config.min_batch_size,
                batch_writer_config.max_batch_size,
            ))
        });
        LocatorFetchTask {
            schedule_context,
            key,
            locator_io,
            source,
            read_pool,
            config,
            context_factory: Arc::new(|| Arc::new(RollupExecutionContext::new())),
            batch_writer_factory,
        }
    }

    /// Replaces the execution-context and batch-writer construction,
    /// the test seam for substituting instrumented implementations.
    pub fn with_factories(
        mut self,
        context_factory: ExecutionContextFactory,
        batch_writer_factory: BatchWriterFactory,
    ) -> LocatorFetchTask {
        self.context_factory = context_factory;
        self.batch_writer_factory = batch_writer_factory;
        self
    }

    /// Runs the slot to completion (or cancellation) and reports the
    /// result to the scheduler.
    pub async fn run(&self, cancel: &CancellationToken) -> ExecutionOutcome {
        let key = self.key;
        let Ok(src_granularity) = key.granularity().finer() else {
            // Unreachable through the scheduler: full resolution is
            // never queued. Guard kept for direct callers.
            error!(%key, "no finer granularity to roll from");
            return ExecutionOutcome {
                status: ExecutionStatus::Skipped,
                locator_count: 0,
            };
        };
        let dst_granularity = key.granularity();
        let server_time = self.schedule_context.current_time_millis();
        let range = dst_granularity.derive_range(key.slot(), server_time);

        let execution_context = (self.context_factory)();
        let batch_writer = (self.batch_writer_factory)(Arc::clone(&execution_context));

        let locators = match self.locator_io.get_locators(key.shard()).await {
            Ok(locators) => locators,
            Err(e) => {
                error!(%key, error = %e, "failed reading locators for slot");
                execution_context.mark_unsuccessful(&e);
                Vec::new()
            }
        };
        let locator_count = locators.len();
        info!(
            %key,
            locators = locator_count,
            is_reroll = self.schedule_context.is_reroll(key),
            "executing rollups for slot"
        );

        for locator in locators {
            trace!(%locator, %key, "rolling up locator");
            execution_context.increment_read_counter();

            let read_pool = Arc::clone(&self.read_pool);
            let source = Arc::clone(&self.source);
            let execution_context = Arc::clone(&execution_context);
            let batch_writer = Arc::clone(&batch_writer);
            tokio::spawn(async move {
                let result = async {
                    let _permit = read_pool.acquire().await?;
                    source
                        .read_and_aggregate(&locator, src_granularity, range, dst_granularity)
                        .await
                }
                .await;
                match result {
                    Ok(Some(rollup)) => {
                        batch_writer.enqueue_rollup_for_write(SingleRollupWriteContext {
                            locator,
                            granularity: dst_granularity,
                            slot: key.slot(),
                            rollup,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Siblings keep going; the slot retries as a
                        // unit.
                        warn!(%locator, %key, error = %e, "locator rollup failed");
                        execution_context.mark_unsuccessful(&e);
                    }
                }
                execution_context.decrement_read_counter();
            });
        }

        let status = self
            .drain_execution_context(&execution_context, &batch_writer, cancel)
            .await;
        ExecutionOutcome {
            status,
            locator_count,
        }
    }

    /// Waits for outstanding reads and writes to reach zero, flushing
    /// the trailing partial batch once reading is done, then reports
    /// the slot back to the scheduler.
    async fn drain_execution_context(
        &self,
        execution_context: &Arc<RollupExecutionContext>,
        batch_writer: &Arc<RollupBatchWriter>,
        cancel: &CancellationToken,
    ) -> ExecutionStatus {
        let key = self.key;
        debug!(%key, "waiting for rollups to finish");
        loop {
            if execution_context.done_reading() {
                batch_writer.drain_batch();
                if execution_context.done_writing() {
                    break;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    // In-flight locator tasks are not cancelled; the
                    // slot is the retry unit.
                    warn!(%key, "cancelled while draining, pushing slot back");
                    self.schedule_context.push_back_to_scheduled(key, false);
                    return ExecutionStatus::Aborted;
                }
                _ = tokio::time::sleep(self.config.drain_poll_interval) => {
                    trace!(
                        %key,
                        reading = !execution_context.done_reading(),
                        "still waiting for rollups"
                    );
                }
            }
        }
        self.finish_execution(execution_context)
    }

    fn finish_execution(&self, execution_context: &RollupExecutionContext) -> ExecutionStatus {
        let key = self.key;
        if execution_context.was_successful() {
            self.schedule_context.clear_from_running(key);
            info!(%key, "completed rollups for slot");
            ExecutionStatus::Completed
        } else {
            error!(
                %key,
                error = execution_context.first_error().as_deref().unwrap_or("unknown"),
                "rollups failed for slot"
            );
            self.schedule_context.push_back_to_scheduled(key, false);
            ExecutionStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::Granularity;
    use crate::state::StampState;

    const READ_POOL: usize = 4;
    const WRITE_POOL: usize = 2;

    struct Fixture {
        context: Arc<ScheduleContext>,
        store: Arc<MemoryLocatorStore>,
    }

    /// One shard with data in 5m slot 4, scheduled and dequeued so the
    /// slot is Running and ready for execution.
    async fn running_slot_fixture(point_times: &[u64]) -> (Fixture, SlotKey) {
        let context = Arc::new(ScheduleContext::new(1_234_000, [0]));
        let store = Arc::new(MemoryLocatorStore::new());
        for (i, ts) in point_times.iter().enumerate() {
            let locator = Locator::new("t1", format!("metric.{i}"));
            store.insert_point(0, &locator, *ts);
            context.update(*ts, 0);
        }
        context.set_current_time_millis(1_600_000);
        context.schedule_slots_older_than(300_000);
        let key = context.get_next_scheduled().expect("slot scheduled");
        (Fixture { context, store }, key)
    }

    fn task(fixture: &Fixture, key: SlotKey, config: ExecutionConfig) -> LocatorFetchTask {
        LocatorFetchTask::new(
            Arc::clone(&fixture.context),
            key,
            fixture.store.clone() as Arc<dyn LocatorIo>,
            fixture.store.clone() as Arc<dyn RollupSource>,
            fixture.store.clone() as Arc<dyn RollupWriter>,
            Arc::new(Semaphore::new(READ_POOL)),
            Arc::new(Semaphore::new(WRITE_POOL)),
            config,
        )
    }

    fn quick_config() -> ExecutionConfig {
        ExecutionConfig {
            min_batch_size: 2,
            max_batch_size: 10,
            drain_poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_successful_execution_rolls_slot_and_writes() {
        let (fixture, key) = running_slot_fixture(&[1_250_000, 1_260_000, 1_270_000]).await;
        assert_eq!(key, SlotKey::of(Granularity::Min5, 4, 0));

        let outcome = task(&fixture, key, quick_config())
            .run(&CancellationToken::new())
            .await;

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.locator_count, 3);
        assert_eq!(fixture.store.written_count(), 3);
        for written in fixture.store.written_rollups() {
            assert_eq!(written.granularity, Granularity::Min5);
            assert_eq!(written.slot, 4);
            assert_eq!(written.rollup.point_count, 1);
        }

        let stamp = fixture
            .context
            .shard_state_manager()
            .get_update_stamp(key)
            .expect("stamp");
        assert_eq!(stamp.state, StampState::Rolled);
        assert_eq!(fixture.context.running_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_locator_set_completes_immediately() {
        let context = Arc::new(ScheduleContext::new(1_234_000, [0]));
        let store = Arc::new(MemoryLocatorStore::new());
        context.update(1_234_000, 0);
        context.set_current_time_millis(1_600_000);
        context.schedule_slots_older_than(300_000);
        let key = context.get_next_scheduled().expect("scheduled");

        let fixture = Fixture { context, store };
        let outcome = task(&fixture, key, quick_config())
            .run(&CancellationToken::new())
            .await;

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.locator_count, 0);
        assert_eq!(fixture.store.written_count(), 0);
    }

    #[tokio::test]
    async fn test_locator_fetch_failure_pushes_back() {
        let (fixture, key) = running_slot_fixture(&[1_250_000]).await;
        fixture.store.set_fail_get_locators(true);

        let outcome = task(&fixture, key, quick_config())
            .run(&CancellationToken::new())
            .await;

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        // Back in the queue for an eventual retry.
        assert_eq!(fixture.context.scheduled_count(), 1);
        assert_eq!(fixture.context.running_count(), 0);
        let stamp = fixture
            .context
            .shard_state_manager()
            .get_update_stamp(key)
            .expect("stamp");
        assert_eq!(stamp.state, StampState::Active);
    }

    #[tokio::test]
    async fn test_write_failure_pushes_back() {
        let (fixture, key) = running_slot_fixture(&[1_250_000, 1_260_000]).await;
        fixture.store.set_fail_inserts(true);

        let outcome = task(&fixture, key, quick_config())
            .run(&CancellationToken::new())
            .await;

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(fixture.context.scheduled_count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_drain_aborts_and_pushes_back() {
        // A source that never finishes keeps the read counter nonzero,
        // so the drain loop must observe the cancellation.
        struct HangingSource;

        #[async_trait::async_trait]
        impl RollupSource for HangingSource {
            async fn read_and_aggregate(
                &self,
                _locator: &Locator,
                _src: Granularity,
                _range: crate::rollup::Range,
                _dst: Granularity,
            ) -> anyhow::Result<Option<RollupValue>> {
                std::future::pending().await
            }
        }

        let (fixture, key) = running_slot_fixture(&[1_250_000]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let task = LocatorFetchTask::new(
            Arc::clone(&fixture.context),
            key,
            fixture.store.clone() as Arc<dyn LocatorIo>,
            Arc::new(HangingSource) as Arc<dyn RollupSource>,
            fixture.store.clone() as Arc<dyn RollupWriter>,
            Arc::new(Semaphore::new(READ_POOL)),
            Arc::new(Semaphore::new(WRITE_POOL)),
            quick_config(),
        );
        let outcome = task.run(&cancel).await;

        assert_eq!(outcome.status, ExecutionStatus::Aborted);
        let stamp = fixture
            .context
            .shard_state_manager()
            .get_update_stamp(key)
            .expect("stamp");
        assert_eq!(stamp.state, StampState::Active);
    }

    #[tokio::test]
    async fn test_full_resolution_is_skipped() {
        let context = Arc::new(ScheduleContext::new(1_234_000, [0]));
        let store = Arc::new(MemoryLocatorStore::new());
        let fixture = Fixture { context, store };
        let key = SlotKey::of(Granularity::Full, 4, 0);

        let outcome = task(&fixture, key, quick_config())
            .run(&CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Skipped);
    }

    #[tokio::test]
    async fn test_substituted_factories_are_used() {
        let (fixture, key) = running_slot_fixture(&[1_250_000]).await;

        let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let seen_ctx = Arc::clone(&seen);
        let context_factory: ExecutionContextFactory = Arc::new(move || {
            seen_ctx.lock().push("context".into());
            Arc::new(RollupExecutionContext::new())
        });

        let store = fixture.store.clone();
        let seen_writer = Arc::clone(&seen);
        let batch_writer_factory: BatchWriterFactory = Arc::new(move |execution_context| {
            seen_writer.lock().push("writer".into());
            Arc::new(RollupBatchWriter::new(
                store.clone() as Arc<dyn RollupWriter>,
                Arc::new(Semaphore::new(1)),
                execution_context,
                1,
                10,
            ))
        });

        let outcome = task(&fixture, key, quick_config())
            .with_factories(context_factory, batch_writer_factory)
            .run(&CancellationToken::new())
            .await;

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(*seen.lock(), vec!["context".to_string(), "writer".to_string()]);
    }

    #[tokio::test]
    async fn test_partial_locator_failure_retries_whole_slot() {
        // Locator "poison" fails its read; the sibling still writes,
        // but the slot as a whole is pushed back.
        struct PoisonSource {
            inner: Arc<MemoryLocatorStore>,
        }

        #[async_trait::async_trait]
        impl RollupSource for PoisonSource {
            async fn read_and_aggregate(
                &self,
                locator: &Locator,
                src: Granularity,
                range: crate::rollup::Range,
                dst: Granularity,
            ) -> anyhow::Result<Option<RollupValue>> {
                if locator.metric().contains("poison") {
                    anyhow::bail!("simulated read failure");
                }
                self.inner.read_and_aggregate(locator, src, range, dst).await
            }
        }

        let context = Arc::new(ScheduleContext::new(1_234_000, [0]));
        let store = Arc::new(MemoryLocatorStore::new());
        let good = Locator::new("t1", "good.metric");
        let poison = Locator::new("t1", "poison.metric");
        store.insert_point(0, &good, 1_250_000);
        store.insert_point(0, &poison, 1_251_000);
        context.update(1_250_000, 0);
        context.update(1_251_000, 0);
        context.set_current_time_millis(1_600_000);
        context.schedule_slots_older_than(300_000);
        let key = context.get_next_scheduled().expect("scheduled");

        let source = Arc::new(PoisonSource {
            inner: Arc::clone(&store),
        });
        let task = LocatorFetchTask::new(
            Arc::clone(&context),
            key,
            store.clone() as Arc<dyn LocatorIo>,
            source as Arc<dyn RollupSource>,
            store.clone() as Arc<dyn RollupWriter>,
            Arc::new(Semaphore::new(READ_POOL)),
            Arc::new(Semaphore::new(WRITE_POOL)),
            ExecutionConfig {
                min_batch_size: 1,
                max_batch_size: 10,
                drain_poll_interval: Duration::from_millis(5),
            },
        );

        let outcome = task.run(&CancellationToken::new()).await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.locator_count, 2);
        // The good sibling was not aborted.
        assert_eq!(store.written_count(), 1);
        // Whole-slot retry.
        assert_eq!(context.scheduled_count(), 1);
    }
}
