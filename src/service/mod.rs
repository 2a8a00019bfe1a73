use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::exec::{
    ExecutionConfig, ExecutionStatus, LocatorFetchTask, LocatorIo, MemoryLocatorStore,
    RollupSource, RollupWriter,
};
use crate::export::HealthMetrics;
use crate::locks::{
    DistributedShardLockManager, LockCoordinator, LockManagerConfig, NoOpShardLockManager,
    ShardLockManager,
};
use crate::rollup::Granularity;
use crate::schedule::ScheduleContext;
use crate::state::{
    MemoryShardStateIo, ShardStateIo, ShardStateManager, ShardStatePuller, ShardStatePusher,
    SlotState, StampState,
};

/// External collaborators wired into the service.
pub struct ServiceStores {
    pub state_io: Arc<dyn ShardStateIo>,
    pub locator_io: Arc<dyn LocatorIo>,
    pub source: Arc<dyn RollupSource>,
    pub writer: Arc<dyn RollupWriter>,
    /// Required when `locks.enabled` is set.
    pub coordinator: Option<Arc<dyn LockCoordinator>>,
}

impl ServiceStores {
    /// Fully in-memory stores: standalone mode.
    pub fn in_memory() -> ServiceStores {
        let store = Arc::new(MemoryLocatorStore::new());
        ServiceStores {
            state_io: Arc::new(MemoryShardStateIo::new()),
            locator_io: store.clone(),
            source: store.clone(),
            writer: store,
            coordinator: None,
        }
    }
}

/// The scheduling-cycle parameters, re-read every cycle so operators
/// can adjust a running process.
#[derive(Debug, Clone)]
pub struct RollupTimings {
    pub rollup_delay: Duration,
    pub short_delay: Duration,
    pub long_wait: Duration,
}

/// The periodic driver: keeps server time fresh, runs the eligibility
/// scan, and dispatches scheduled slots onto a bounded execution pool.
/// Owns the shard-state workers and the lock scavenger.
pub struct RollupService {
    context: Arc<ScheduleContext>,
    timings: Arc<RwLock<RollupTimings>>,
    poll_interval: Duration,
    keeping_server_time: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,

    locator_io: Arc<dyn LocatorIo>,
    source: Arc<dyn RollupSource>,
    writer: Arc<dyn RollupWriter>,
    read_pool: Arc<Semaphore>,
    write_pool: Arc<Semaphore>,
    dispatch_pool: Arc<Semaphore>,
    execution_config: ExecutionConfig,

    state_pusher: Arc<ShardStatePusher>,
    state_puller: Arc<ShardStatePuller>,
    lock_manager: Option<Arc<DistributedShardLockManager>>,

    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RollupService {
    /// Builds the service from configuration and collaborator stores.
    pub fn new(config: &Config, stores: ServiceStores) -> Result<RollupService> {
        Self::with_clock(config, stores, Arc::new(SystemClock))
    }

    /// As [`new`](Self::new) with an injected clock, for deterministic
    /// tests.
    pub fn with_clock(
        config: &Config,
        stores: ServiceStores,
        clock: Arc<dyn Clock>,
    ) -> Result<RollupService> {
        config.validate()?;
        let shards = config.shards.resolve()?;
        let health =
            Arc::new(HealthMetrics::new(&config.health.addr).context("creating health metrics")?);

        let now = clock.now_millis();
        let schedule_time = Arc::new(AtomicU64::new(now));
        let shard_state = Arc::new(ShardStateManager::new(
            shards.iter().copied(),
            Arc::clone(&clock),
            config.rollup.reroll_window.as_millis() as u64,
        ));

        let lock_manager: Option<Arc<DistributedShardLockManager>> = if config.locks.enabled {
            let Some(coordinator) = stores.coordinator.clone() else {
                bail!("locks.enabled requires a lock coordinator");
            };
            Some(Arc::new(DistributedShardLockManager::new(
                coordinator,
                Arc::clone(&clock),
                LockManagerConfig {
                    min_lock_hold: config.locks.min_hold,
                    lock_disinterested: config.locks.disinterested,
                    scavenge_interval: config.locks.scavenge_interval,
                    max_locks_per_cycle: config.locks.max_locks_per_cycle,
                },
                shards.iter().copied(),
            )))
        } else {
            None
        };
        let context_lock_manager: Arc<dyn ShardLockManager> = match &lock_manager {
            Some(manager) => Arc::clone(manager) as Arc<dyn ShardLockManager>,
            None => Arc::new(NoOpShardLockManager),
        };

        let context = Arc::new(ScheduleContext::with_components(
            now,
            schedule_time,
            Arc::clone(&shard_state),
            context_lock_manager,
            Arc::clone(&clock),
        ));

        let state_pusher = Arc::new(
            ShardStatePusher::new(
                Arc::clone(&shard_state),
                Arc::clone(&stores.state_io),
                config.state.push_interval,
            )
            .with_health(Arc::clone(&health)),
        );
        let state_puller = Arc::new(
            ShardStatePuller::new(
                shard_state,
                Arc::clone(&stores.state_io),
                config.state.pull_interval,
            )
            .with_health(Arc::clone(&health)),
        );

        Ok(RollupService {
            context,
            timings: Arc::new(RwLock::new(RollupTimings {
                rollup_delay: config.rollup.delay,
                short_delay: config.rollup.short_delay_metrics_rollup_delay,
                long_wait: config.rollup.long_delay_metrics_rollup_wait,
            })),
            poll_interval: config.rollup.poll_interval,
            keeping_server_time: Arc::new(AtomicBool::new(config.rollup.keep_server_time)),
            clock,
            locator_io: stores.locator_io,
            source: stores.source,
            writer: stores.writer,
            read_pool: Arc::new(Semaphore::new(config.rollup.read_concurrency)),
            write_pool: Arc::new(Semaphore::new(config.rollup.write_concurrency)),
            dispatch_pool: Arc::new(Semaphore::new(config.rollup.locator_fetch_concurrency)),
            execution_config: ExecutionConfig {
                min_batch_size: config.rollup.batch_min_size,
                max_batch_size: config.rollup.batch_max_size,
                drain_poll_interval: config.rollup.drain_poll_interval,
            },
            state_pusher,
            state_puller,
            lock_manager,
            health,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn context(&self) -> &Arc<ScheduleContext> {
        &self.context
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Replaces the hot-readable scheduling parameters; the next cycle
    /// picks them up.
    pub fn set_timings(&self, timings: RollupTimings) {
        *self.timings.write() = timings;
    }

    pub fn set_keeping_server_time(&self, keeping: bool) {
        self.keeping_server_time.store(keeping, Ordering::SeqCst);
    }

    /// Starts all background loops and the health server.
    pub async fn start(&self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        self.tracker.spawn(
            Arc::clone(&self.state_pusher).run(self.cancel.clone()),
        );
        self.tracker.spawn(
            Arc::clone(&self.state_puller).run(self.cancel.clone()),
        );
        if let Some(lock_manager) = &self.lock_manager {
            self.tracker
                .spawn(Arc::clone(lock_manager).run(self.cancel.clone()));
        }

        let service = self.poll_state();
        let cancel = self.cancel.clone();
        let poll_interval = self.poll_interval;
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("rollup poll loop stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        service.poll_cycle().await;
                    }
                }
            }
        });

        info!(
            shards = self.context.shard_state_manager().managed_shards().len(),
            poll_interval = ?self.poll_interval,
            "rollup service started"
        );
        Ok(())
    }

    /// Cancels all loops, lets in-flight slot drains abort cleanly, and
    /// stops the health server.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.health.stop().await;
        info!("rollup service stopped");
    }

    fn poll_state(&self) -> PollState {
        PollState {
            context: Arc::clone(&self.context),
            timings: Arc::clone(&self.timings),
            keeping_server_time: Arc::clone(&self.keeping_server_time),
            clock: Arc::clone(&self.clock),
            locator_io: Arc::clone(&self.locator_io),
            source: Arc::clone(&self.source),
            writer: Arc::clone(&self.writer),
            read_pool: Arc::clone(&self.read_pool),
            write_pool: Arc::clone(&self.write_pool),
            dispatch_pool: Arc::clone(&self.dispatch_pool),
            execution_config: self.execution_config.clone(),
            lock_manager: self.lock_manager.clone(),
            health: Arc::clone(&self.health),
            cancel: self.cancel.clone(),
            tracker: self.tracker.clone(),
        }
    }

    /// Runs one scheduling cycle immediately (also the forced entry
    /// point for tests and operations).
    pub async fn force_poll(&self) {
        self.poll_state().poll_cycle().await;
    }

    /// The oldest not-yet-rolled slot per granularity for a shard, in
    /// the persisted-row textual form. Operational diagnostics.
    pub fn oldest_unrolled_slot_per_granularity(&self, shard: i32) -> Vec<String> {
        let mut results = Vec::new();
        for granularity in Granularity::rollup_granularities() {
            let stamps = self.context.slot_stamps(*granularity, shard);
            let oldest = stamps
                .iter()
                .filter(|(_, stamp)| stamp.state != StampState::Rolled)
                .min_by_key(|(_, stamp)| stamp.timestamp);
            if let Some((slot, stamp)) = oldest {
                results.push(
                    SlotState::new(*granularity, *slot, stamp.state)
                        .with_timestamp(stamp.timestamp)
                        .to_string(),
                );
            }
        }
        results
    }
}

/// Everything one poll cycle needs, detached from the service so the
/// loop task owns its own copy.
struct PollState {
    context: Arc<ScheduleContext>,
    timings: Arc<RwLock<RollupTimings>>,
    keeping_server_time: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    locator_io: Arc<dyn LocatorIo>,
    source: Arc<dyn RollupSource>,
    writer: Arc<dyn RollupWriter>,
    read_pool: Arc<Semaphore>,
    write_pool: Arc<Semaphore>,
    dispatch_pool: Arc<Semaphore>,
    execution_config: ExecutionConfig,
    lock_manager: Option<Arc<DistributedShardLockManager>>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PollState {
    async fn poll_cycle(&self) {
        if self.keeping_server_time.load(Ordering::SeqCst) {
            self.context.set_current_time_millis(self.clock.now_millis());
        }
        let timings = self.timings.read().clone();
        let before = self.context.scheduled_count();
        self.context.schedule_eligible_slots(
            timings.rollup_delay.as_millis() as u64,
            timings.short_delay.as_millis() as u64,
            timings.long_wait.as_millis() as u64,
        );
        let after = self.context.scheduled_count();
        self.health
            .slots_scheduled
            .inc_by(after.saturating_sub(before) as f64);

        self.dispatch_scheduled();
        self.refresh_gauges();
    }

    /// Drains the scheduled queue onto the dispatch pool until the
    /// queue is empty or the pool saturates.
    fn dispatch_scheduled(&self) {
        while self.context.has_scheduled() {
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(key) = self.context.get_next_scheduled() else {
                if self.context.has_scheduled() {
                    // Lock lost under a queued key; keep draining.
                    continue;
                }
                return;
            };
            let permit = match Arc::clone(&self.dispatch_pool).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // Too much rollup work in flight. Front of the
                    // queue so the next cycle picks it first.
                    warn!(%key, "dispatch pool saturated, pushing slot back");
                    self.health.dispatch_rejections.inc();
                    self.context.push_back_to_scheduled(key, true);
                    return;
                }
            };

            debug!(%key, "dispatching slot");
            self.health.slots_dispatched.inc();
            let is_reroll = self.context.is_reroll(key);
            let task = LocatorFetchTask::new(
                Arc::clone(&self.context),
                key,
                Arc::clone(&self.locator_io),
                Arc::clone(&self.source),
                Arc::clone(&self.writer),
                Arc::clone(&self.read_pool),
                Arc::clone(&self.write_pool),
                self.execution_config.clone(),
            );
            let health = Arc::clone(&self.health);
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move {
                let outcome = task.run(&cancel).await;
                match outcome.status {
                    ExecutionStatus::Completed => health.slots_rolled.inc(),
                    ExecutionStatus::Failed | ExecutionStatus::Aborted => {
                        health.slots_failed.inc()
                    }
                    ExecutionStatus::Skipped => {}
                }
                if is_reroll && outcome.status == ExecutionStatus::Completed {
                    health.rerolls_executed.inc();
                }
                health.locators_per_slot.observe(outcome.locator_count as f64);
                drop(permit);
            });
        }
    }

    fn refresh_gauges(&self) {
        let context = &self.context;
        self.health
            .scheduled_slots
            .set(context.scheduled_count() as f64);
        self.health.running_slots.set(context.running_count() as f64);
        self.health.managed_shards.set(
            context.shard_state_manager().managed_shards().len() as f64,
        );
        self.health
            .recently_scheduled_shards
            .set(context.recently_scheduled_shards().len() as f64);
        self.health
            .server_time_millis
            .set(context.current_time_millis() as f64);

        if let Some(lock_manager) = &self.lock_manager {
            self.health
                .locks_held
                .set(lock_manager.held_shards().len() as f64);
            self.health
                .locks_error
                .set(lock_manager.error_shards().len() as f64);
            self.health
                .lock_service_connected
                .set(if lock_manager.is_connected() { 1.0 } else { 0.0 });
        }
    }
}
