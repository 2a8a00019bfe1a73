pub mod recent;

pub use recent::RecentShardCache;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::clock::{Clock, SharedClock};
use crate::locks::{NoOpShardLockManager, ShardLockManager};
use crate::rollup::{Granularity, SlotKey, NUMBER_OF_SHARDS};
use crate::state::{ShardStateManager, StampState, UpdateStamp};

/// Default window after a rollup within which renewed slot activity is
/// attributed to delayed data rather than ring wrap-around.
pub const DEFAULT_REROLL_WINDOW_MILLIS: u64 = 3 * 24 * 60 * 60 * 1000;

const RECENT_SHARDS_TTL_MILLIS: u64 = 10 * 60 * 1000;

/// Coordinates access to slot state between ingestion, the eligibility
/// scan, and the rollup workers.
///
/// Ingestion calls [`update`](Self::update) to mark slots `Active`. The
/// periodic scan ([`schedule_eligible_slots`](Self::schedule_eligible_slots))
/// queues eligible slots for shards this process holds the lock on.
/// Workers pull queued slots with
/// [`get_next_scheduled`](Self::get_next_scheduled) (transitioning them
/// to `Running`), then report back through
/// [`clear_from_running`](Self::clear_from_running) on success or
/// [`push_back_to_scheduled`](Self::push_back_to_scheduled) on failure.
///
/// Scheduled and running are queue-level states layered over the
/// persisted Active/Running/Rolled slot state machine; both queues live
/// behind one mutex so their invariants hold under concurrent callers.
pub struct ScheduleContext {
    shard_state: Arc<ShardStateManager>,
    lock_manager: Arc<dyn ShardLockManager>,
    clock: Arc<dyn Clock>,
    schedule_time: Arc<AtomicU64>,
    queues: Mutex<SchedulerQueues>,
    recently_scheduled: RecentShardCache,
}

struct SchedulerQueues {
    /// Membership set for everything queued, in no particular order.
    scheduled: HashSet<SlotKey>,
    /// Queue order. Entries descheduled by a fresh ingest stay here and
    /// are skipped on dequeue (lazy deletion); membership in
    /// `scheduled` is authoritative.
    ordered: VecDeque<SlotKey>,
    /// Slots with a live worker, with the ingest timestamp they were
    /// dequeued at.
    running: HashMap<SlotKey, u64>,
}

impl SchedulerQueues {
    fn scheduled_or_running(&self, key: &SlotKey) -> bool {
        self.scheduled.contains(key) || self.running.contains_key(key)
    }
}

impl ScheduleContext {
    /// A context for one process with no fleet coordination: every
    /// shard is always workable and the clock is bound to the context's
    /// own schedule time. This is the deterministic construction used
    /// by tests and single-node deployments.
    pub fn new(current_millis: u64, shards: impl IntoIterator<Item = i32>) -> ScheduleContext {
        let schedule_time = Arc::new(AtomicU64::new(current_millis));
        let clock: Arc<dyn Clock> = Arc::new(SharedClock::new(Arc::clone(&schedule_time)));
        let shard_state = Arc::new(ShardStateManager::new(
            shards,
            Arc::clone(&clock),
            DEFAULT_REROLL_WINDOW_MILLIS,
        ));
        Self::with_components(
            current_millis,
            schedule_time,
            shard_state,
            Arc::new(NoOpShardLockManager),
            clock,
        )
    }

    /// Full construction with injected collaborators. `schedule_time`
    /// must be the counter the shard state manager's clock observes if
    /// deterministic scans are wanted.
    pub fn with_components(
        current_millis: u64,
        schedule_time: Arc<AtomicU64>,
        shard_state: Arc<ShardStateManager>,
        lock_manager: Arc<dyn ShardLockManager>,
        clock: Arc<dyn Clock>,
    ) -> ScheduleContext {
        schedule_time.store(current_millis, Ordering::SeqCst);
        ScheduleContext {
            shard_state,
            lock_manager,
            clock,
            schedule_time,
            queues: Mutex::new(SchedulerQueues {
                scheduled: HashSet::new(),
                ordered: VecDeque::new(),
                running: HashMap::new(),
            }),
            recently_scheduled: RecentShardCache::new(
                NUMBER_OF_SHARDS as usize,
                RECENT_SHARDS_TTL_MILLIS,
            ),
        }
    }

    pub fn shard_state_manager(&self) -> &Arc<ShardStateManager> {
        &self.shard_state
    }

    pub fn current_time_millis(&self) -> u64 {
        self.schedule_time.load(Ordering::SeqCst)
    }

    pub fn set_current_time_millis(&self, millis: u64) {
        self.schedule_time.store(millis, Ordering::SeqCst);
    }

    /// Applies an ingestion observation: deschedules any queued slots
    /// the new data lands in, then marks the slot and its coarser
    /// ancestors active and dirty.
    pub fn update(&self, millis: u64, shard: i32) {
        trace!(shard, millis, "ingestion update");
        if self.shard_state.contains(shard) {
            let mut queues = self.queues.lock();
            for granularity in Granularity::rollup_granularities() {
                let key = SlotKey::of(*granularity, granularity.slot(millis), shard);
                if queues.scheduled.remove(&key) {
                    // The stale ordered entry is skipped on dequeue.
                    debug!(%key, "descheduled");
                }
            }
        }
        self.shard_state.update(millis, shard);
    }

    /// Scans every managed shard for slots old enough to roll, with the
    /// short- and long-delay gates collapsed into the age threshold.
    /// This is what the periodic poller calls.
    pub fn schedule_slots_older_than(&self, max_age_millis: u64) {
        self.schedule_eligible_slots(max_age_millis, max_age_millis, 0);
    }

    /// Scans every managed shard at every rollup granularity and queues
    /// the slots eligible at the current schedule time, subject to the
    /// shard lock and the running-child constraint. Intended to be
    /// driven by one scan caller at a time.
    pub fn schedule_eligible_slots(
        &self,
        max_age_millis: u64,
        short_delay_millis: u64,
        long_wait_millis: u64,
    ) {
        let now = self.current_time_millis();
        let mut shards = self.shard_state.managed_shards();
        shards.shuffle(&mut rand::rng());

        for shard in shards {
            let mut scheduled_any = false;
            for granularity in Granularity::rollup_granularities() {
                let eligible = self.shard_state.slots_eligible_for_rollup(
                    shard,
                    *granularity,
                    now,
                    max_age_millis,
                    short_delay_millis,
                    long_wait_millis,
                );
                if eligible.is_empty() {
                    continue;
                }
                if !self.can_work_on_shard(shard) {
                    continue;
                }
                let mut queues = self.queues.lock();
                for slot in eligible {
                    let key = SlotKey::of(*granularity, slot, shard);
                    if Self::child_keys_or_self_blocked(&queues, key) {
                        continue;
                    }
                    queues.scheduled.insert(key);
                    queues.ordered.push_back(key);
                    scheduled_any = true;
                    self.recently_scheduled.put(shard, now);
                }
            }
            if scheduled_any {
                self.lock_manager.note_interest(shard);
            }
        }
    }

    /// True if the key itself, or any finer-granularity key covering the
    /// same time range, is queued or has a live worker. Rolling a
    /// coarse bucket while a finer roll below it is in flight would
    /// aggregate data mid-mutation.
    pub fn are_child_keys_or_self_key_scheduled_or_running(&self, key: SlotKey) -> bool {
        let queues = self.queues.lock();
        Self::child_keys_or_self_blocked(&queues, key)
    }

    fn child_keys_or_self_blocked(queues: &SchedulerQueues, key: SlotKey) -> bool {
        if queues.scheduled_or_running(&key) {
            return true;
        }
        key.children()
            .iter()
            .any(|child| queues.scheduled_or_running(child))
    }

    fn can_work_on_shard(&self, shard: i32) -> bool {
        let can_work = self.lock_manager.can_work(shard);
        if !can_work {
            trace!(shard, "skipping shard, lock not held");
        }
        can_work
    }

    /// Whether rolling this key now would be a re-roll caused by
    /// delayed data.
    pub fn is_reroll(&self, key: SlotKey) -> bool {
        self.shard_state.is_reroll(key, self.current_time_millis())
    }

    pub fn has_scheduled(&self) -> bool {
        self.scheduled_count() > 0
    }

    pub fn scheduled_count(&self) -> usize {
        self.queues.lock().scheduled.len()
    }

    pub fn running_count(&self) -> usize {
        self.queues.lock().running.len()
    }

    /// Pops the next scheduled key, transitioning its stamp to
    /// `Running` and adding it to the running set; those two side
    /// effects make a dequeued slot unschedulable until completion is
    /// reported. Returns `None` when nothing is queued, or when the
    /// popped shard's lock was lost since scheduling (the key is
    /// dropped; the slot stays `Active` and a later scan requeues it).
    pub fn get_next_scheduled(&self) -> Option<SlotKey> {
        let mut queues = self.queues.lock();
        while let Some(key) = queues.ordered.pop_front() {
            if !queues.scheduled.remove(&key) {
                // Descheduled by an ingest after queueing.
                continue;
            }
            if !self.can_work_on_shard(key.shard()) {
                debug!(%key, "shard ownership changed before running");
                return None;
            }
            // The timestamp is deliberately left untouched: state
            // coalescing on read relies on it staying the ingest time.
            let Some(stamp) = self.shard_state.get_and_set_state(key, StampState::Running)
            else {
                continue; // shard removed since scheduling
            };
            queues.running.insert(key, stamp.timestamp);
            self.lock_manager.note_interest(key.shard());
            return Some(key);
        }
        None
    }

    /// Marks a successfully rolled slot: out of the running set, coarser
    /// ancestors re-activated, stamp pinned with the rollup time and
    /// transitioned to `Rolled` (unless a delayed ingest already flipped
    /// it back to `Active`).
    pub fn clear_from_running(&self, key: SlotKey) {
        {
            let mut queues = self.queues.lock();
            queues.running.remove(&key);
        }
        self.shard_state.set_all_coarser_slots_dirty(key);
        let now = self.clock.now_millis();
        trace!(%key, rollup_time = now, "slot rolled");
        self.shard_state.mark_rolled(key, now);
    }

    /// Returns a failed slot to the queue: out of the running set, stamp
    /// back to `Active`, and requeued at the front (imminent retry) or
    /// the back (behind equally eligible work).
    pub fn push_back_to_scheduled(&self, key: SlotKey, reschedule_immediately: bool) {
        let mut queues = self.queues.lock();
        queues.running.remove(&key);
        if self
            .shard_state
            .get_and_set_state(key, StampState::Active)
            .is_none()
        {
            return; // shard no longer managed
        }
        queues.scheduled.insert(key);
        if reschedule_immediately {
            queues.ordered.push_front(key);
        } else {
            queues.ordered.push_back(key);
        }
        debug!(%key, scheduled = queues.scheduled.len(), "pushed back to scheduled");
    }

    /// Starts managing a shard: state tracking and lock tracking move
    /// together.
    pub fn add_shard(&self, shard: i32) {
        self.shard_state.add(shard);
        self.lock_manager.add_shard(shard);
    }

    /// Stops managing a shard: state tracking and lock tracking move
    /// together.
    pub fn remove_shard(&self, shard: i32) {
        self.shard_state.remove(shard);
        self.lock_manager.remove_shard(shard);
    }

    /// Shards that had slots scheduled within the visibility window.
    pub fn recently_scheduled_shards(&self) -> Vec<i32> {
        self.recently_scheduled.shards(self.current_time_millis())
    }

    /// Snapshot of one shard's stamps at a granularity.
    pub fn slot_stamps(&self, granularity: Granularity, shard: i32) -> HashMap<i32, UpdateStamp> {
        self.shard_state.slot_stamps(granularity, shard)
    }
}
