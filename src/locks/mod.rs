pub mod coordinator;

pub use coordinator::{ConnectionState, LockCoordinator, MemoryLockService, MemoryLockTable};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;

/// Arbitrates which process may roll up which shard.
///
/// `can_work` answers from local state only; it never blocks on the
/// coordination service, so scheduling decisions stay available while
/// connectivity is degraded.
pub trait ShardLockManager: Send + Sync {
    /// True while this process holds the rollup right for the shard.
    fn can_work(&self, shard: i32) -> bool;

    /// Starts tracking (and eventually acquiring) the shard's lock.
    fn add_shard(&self, shard: i32);

    /// Stops tracking the shard, releasing its lock.
    fn remove_shard(&self, shard: i32);

    /// Records that the scheduler produced or dispatched work for the
    /// shard; a lock with recent interest is not convicted.
    fn note_interest(&self, shard: i32);
}

/// Lock manager for single-node deployments: every shard is always
/// workable.
#[derive(Debug, Default)]
pub struct NoOpShardLockManager;

impl ShardLockManager for NoOpShardLockManager {
    fn can_work(&self, _shard: i32) -> bool {
        true
    }

    fn add_shard(&self, _shard: i32) {}

    fn remove_shard(&self, _shard: i32) {}

    fn note_interest(&self, _shard: i32) {}
}

/// Lifecycle of one shard's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Never attempted, or due for another attempt.
    Unknown,
    /// Held by this process; no other process will schedule the shard.
    Acquired,
    /// Contended: another process holds it.
    AcquireFailed,
    /// The coordination service connection is lost or an attempt blew
    /// up.
    Error,
    /// Voluntarily released; not re-attempted until the disinterest
    /// window passes.
    Disinterested,
}

/// Timing knobs for [`DistributedShardLockManager`].
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Minimum time a lock is held before it can be convicted.
    pub min_lock_hold: Duration,
    /// How long a shard must go without scheduling interest before its
    /// lock is convicted, and how long a released or contended lock
    /// waits before the next attempt.
    pub lock_disinterested: Duration,
    /// Period of the background scavenge.
    pub scavenge_interval: Duration,
    /// Acquisition budget per scavenge cycle when comfortably stocked;
    /// the scavenger turns aggressive below half ownership.
    pub max_locks_per_cycle: usize,
}

impl Default for LockManagerConfig {
    fn default() -> LockManagerConfig {
        LockManagerConfig {
            min_lock_hold: Duration::from_secs(20 * 60),
            lock_disinterested: Duration::from_secs(60),
            scavenge_interval: Duration::from_secs(120),
            max_locks_per_cycle: 1,
        }
    }
}

struct ShardLock {
    state: LockState,
    state_changed: u64,
    last_interest: u64,
}

impl ShardLock {
    fn new(now: u64) -> ShardLock {
        ShardLock {
            state: LockState::Unknown,
            state_changed: now,
            last_interest: now,
        }
    }

    fn set_state(&mut self, state: LockState, now: u64) {
        self.state = state;
        self.state_changed = now;
    }

    /// Moves stale terminal-ish states back to `Unknown` so the
    /// scavenger retries them.
    fn refresh(&mut self, now: u64, connected: bool, disinterested_millis: u64) {
        let elapsed = now.saturating_sub(self.state_changed);
        let retry = match self.state {
            LockState::Disinterested | LockState::AcquireFailed => {
                elapsed >= disinterested_millis
            }
            LockState::Error => connected,
            _ => false,
        };
        if retry {
            self.set_state(LockState::Unknown, now);
        }
    }
}

/// Shard lock manager backed by a distributed coordination service.
///
/// One state machine per shard, each behind its own mutex; coordinator
/// calls happen outside any lock. A periodic scavenge acquires locks in
/// `Unknown` state and convicts held locks that have outlived both the
/// minimum hold time and the disinterest window.
pub struct DistributedShardLockManager {
    coordinator: Arc<dyn LockCoordinator>,
    clock: Arc<dyn Clock>,
    config: LockManagerConfig,
    locks: DashMap<i32, Mutex<ShardLock>>,
    /// Shards removed from management whose coordinator-side locks
    /// still need releasing.
    pending_release: Mutex<Vec<i32>>,
    connected: AtomicBool,
}

impl DistributedShardLockManager {
    pub fn new(
        coordinator: Arc<dyn LockCoordinator>,
        clock: Arc<dyn Clock>,
        config: LockManagerConfig,
        shards: impl IntoIterator<Item = i32>,
    ) -> DistributedShardLockManager {
        let connected = coordinator.is_connected();
        let manager = DistributedShardLockManager {
            coordinator,
            clock,
            config,
            locks: DashMap::new(),
            pending_release: Mutex::new(Vec::new()),
            connected: AtomicBool::new(connected),
        };
        for shard in shards {
            manager.add_shard(shard);
        }
        manager
    }

    fn lock_path(shard: i32) -> String {
        format!("/shards/{shard}")
    }

    /// Runs the scavenge loop and connection listener until cancelled.
    /// Performs an initial scavenge so the process starts from a known
    /// held/unheld state rather than assuming it can schedule anything.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.coordinator.connection_events();
        self.scavenge().await;

        let mut interval = tokio::time::interval(self.config.scavenge_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("lock scavenger stopped");
                    return;
                }
                changed = events.changed() => {
                    if changed.is_err() {
                        warn!("lock coordinator event channel closed");
                        return;
                    }
                    let state = *events.borrow_and_update();
                    self.handle_connection_event(state).await;
                }
                _ = interval.tick() => {
                    self.scavenge().await;
                }
            }
        }
    }

    async fn handle_connection_event(&self, state: ConnectionState) {
        match state {
            ConnectionState::Lost => {
                error!("lock coordinator connection lost, degrading all shard locks");
                self.connected.store(false, Ordering::SeqCst);
                // Proceeding with already scheduled work is fine: a
                // brief dual-ownership window only duplicates idempotent
                // recomputation.
                let now = self.clock.now_millis();
                for entry in self.locks.iter() {
                    entry.value().lock().set_state(LockState::Error, now);
                }
            }
            ConnectionState::Reconnected => {
                info!("lock coordinator reconnected, forcing scavenge");
                self.connected.store(true, Ordering::SeqCst);
                self.scavenge().await;
            }
            ConnectionState::Connected => {
                self.connected.store(true, Ordering::SeqCst);
            }
        }
    }

    /// One maintenance pass: retry stale locks, acquire up to the cycle
    /// budget, convict held locks nobody is interested in.
    pub async fn scavenge(&self) {
        let connected = self.connected.load(Ordering::SeqCst);
        let now = self.clock.now_millis();
        let disinterested_millis = self.config.lock_disinterested.as_millis() as u64;
        let min_hold_millis = self.config.min_lock_hold.as_millis() as u64;

        // Release coordinator-side locks of shards no longer managed.
        let pending: Vec<i32> = std::mem::take(&mut *self.pending_release.lock());
        for shard in pending {
            if let Err(e) = self.coordinator.release(&Self::lock_path(shard)).await {
                debug!(shard, error = %e, "failed releasing removed shard lock");
            }
        }

        let shards: Vec<i32> = self.locks.iter().map(|entry| *entry.key()).collect();
        let held = shards.iter().filter(|s| self.can_work(**s)).count();

        // Below half ownership, be aggressive about catching up.
        let more_than_half = shards.len() / 2 + 1;
        let budget = if held < more_than_half {
            more_than_half
        } else {
            self.config.max_locks_per_cycle
        };

        let mut acquired_this_cycle = 0usize;
        for shard in shards {
            enum Action {
                Acquire,
                Release,
                Nothing,
            }
            let action = {
                let Some(entry) = self.locks.get(&shard) else {
                    continue;
                };
                let mut lock = entry.value().lock();
                lock.refresh(now, connected, disinterested_millis);
                match lock.state {
                    LockState::Unknown if acquired_this_cycle < budget => Action::Acquire,
                    LockState::Acquired => {
                        let held_for = now.saturating_sub(lock.state_changed);
                        let idle_for = now.saturating_sub(lock.last_interest);
                        if held_for >= min_hold_millis && idle_for >= disinterested_millis {
                            Action::Release
                        } else {
                            Action::Nothing
                        }
                    }
                    LockState::Error if now.saturating_sub(lock.state_changed) > min_hold_millis => {
                        error!(
                            shard,
                            connected, "lock stuck in error state past the hold period"
                        );
                        Action::Nothing
                    }
                    _ => Action::Nothing,
                }
            };

            match action {
                Action::Acquire => {
                    if self.acquire_shard(shard, now).await {
                        acquired_this_cycle += 1;
                    }
                }
                Action::Release => {
                    debug!(shard, "convicting idle lock");
                    self.release_shard(shard, now).await;
                }
                Action::Nothing => {}
            }
        }
    }

    async fn acquire_shard(&self, shard: i32, now: u64) -> bool {
        let result = self.coordinator.try_acquire(&Self::lock_path(shard)).await;
        let Some(entry) = self.locks.get(&shard) else {
            // Removed while acquiring; give the lock back.
            if matches!(result, Ok(true)) {
                self.pending_release.lock().push(shard);
            }
            return false;
        };
        let mut lock = entry.value().lock();
        match result {
            Ok(true) => {
                debug!(shard, "acquired shard lock");
                lock.set_state(LockState::Acquired, now);
                // A fresh lock starts its disinterest clock now.
                lock.last_interest = now;
                true
            }
            Ok(false) => {
                debug!(shard, "shard lock contended");
                lock.set_state(LockState::AcquireFailed, now);
                false
            }
            Err(e) => {
                warn!(shard, error = %e, "shard lock acquisition error");
                lock.set_state(LockState::Error, now);
                false
            }
        }
    }

    async fn release_shard(&self, shard: i32, now: u64) {
        let result = self.coordinator.release(&Self::lock_path(shard)).await;
        let Some(entry) = self.locks.get(&shard) else {
            return;
        };
        let mut lock = entry.value().lock();
        match result {
            Ok(()) => lock.set_state(LockState::Disinterested, now),
            Err(e) => {
                warn!(shard, error = %e, "shard lock release error");
                lock.set_state(LockState::Error, now);
            }
        }
    }

    /// Current state of one shard's lock.
    pub fn lock_state(&self, shard: i32) -> Option<LockState> {
        self.locks.get(&shard).map(|entry| entry.value().lock().state)
    }

    fn shards_in(&self, wanted: LockState) -> Vec<i32> {
        let mut shards: Vec<i32> = self
            .locks
            .iter()
            .filter(|entry| entry.value().lock().state == wanted)
            .map(|entry| *entry.key())
            .collect();
        shards.sort_unstable();
        shards
    }

    pub fn held_shards(&self) -> Vec<i32> {
        self.shards_in(LockState::Acquired)
    }

    pub fn unheld_shards(&self) -> Vec<i32> {
        self.shards_in(LockState::AcquireFailed)
    }

    pub fn error_shards(&self) -> Vec<i32> {
        self.shards_in(LockState::Error)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl ShardLockManager for DistributedShardLockManager {
    fn can_work(&self, shard: i32) -> bool {
        self.locks
            .get(&shard)
            .map(|entry| entry.value().lock().state == LockState::Acquired)
            .unwrap_or(false)
    }

    fn add_shard(&self, shard: i32) {
        let now = self.clock.now_millis();
        self.locks.entry(shard).or_insert_with(|| Mutex::new(ShardLock::new(now)));
    }

    fn remove_shard(&self, shard: i32) {
        if self.locks.remove(&shard).is_some() {
            self.pending_release.lock().push(shard);
        }
    }

    fn note_interest(&self, shard: i32) {
        if let Some(entry) = self.locks.get(&shard) {
            entry.value().lock().last_interest = self.clock.now_millis();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SharedClock;
    use std::sync::atomic::AtomicU64;

    fn zeroed_config() -> LockManagerConfig {
        LockManagerConfig {
            min_lock_hold: Duration::from_millis(0),
            lock_disinterested: Duration::from_millis(0),
            scavenge_interval: Duration::from_secs(3600),
            max_locks_per_cycle: 1,
        }
    }

    fn manager_with(
        config: LockManagerConfig,
        shards: Vec<i32>,
    ) -> (
        Arc<DistributedShardLockManager>,
        Arc<MemoryLockService>,
        Arc<AtomicU64>,
    ) {
        let service = Arc::new(MemoryLockService::standalone());
        let (clock, handle) = SharedClock::starting_at(1_000_000);
        let manager = Arc::new(DistributedShardLockManager::new(
            service.clone() as Arc<dyn LockCoordinator>,
            Arc::new(clock),
            config,
            shards,
        ));
        (manager, service, handle)
    }

    #[tokio::test]
    async fn test_scavenge_acquires_up_to_half_aggressively() {
        let (manager, _, _) = manager_with(zeroed_config(), vec![0, 1, 2, 3]);
        assert!(!manager.can_work(0));

        manager.scavenge().await;
        // Zero held going in: the aggressive budget is half + 1 = 3.
        assert_eq!(manager.held_shards().len(), 3);
    }

    #[tokio::test]
    async fn test_forced_scavenge_releases_then_reacquires() {
        // min hold and disinterest both zero: one scavenge convicts
        // everything held, the next takes it all back.
        let config = LockManagerConfig {
            max_locks_per_cycle: 8,
            ..zeroed_config()
        };
        let (manager, _, handle) = manager_with(config, vec![0, 1]);

        manager.scavenge().await;
        assert_eq!(manager.held_shards(), vec![0, 1]);
        assert!(manager.can_work(0) && manager.can_work(1));

        handle.store(1_000_001, Ordering::SeqCst);
        manager.scavenge().await;
        assert!(manager.held_shards().is_empty());
        assert!(!manager.can_work(0) && !manager.can_work(1));

        handle.store(1_000_002, Ordering::SeqCst);
        manager.scavenge().await;
        assert_eq!(manager.held_shards(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_interest_defers_conviction() {
        let config = LockManagerConfig {
            min_lock_hold: Duration::from_millis(0),
            lock_disinterested: Duration::from_millis(500),
            scavenge_interval: Duration::from_secs(3600),
            max_locks_per_cycle: 8,
        };
        let (manager, _, handle) = manager_with(config, vec![0]);
        manager.scavenge().await;
        assert!(manager.can_work(0));

        // Interest keeps arriving: the lock survives scavenges.
        handle.store(1_000_400, Ordering::SeqCst);
        manager.note_interest(0);
        handle.store(1_000_700, Ordering::SeqCst);
        manager.scavenge().await;
        assert!(manager.can_work(0));

        // No interest for the full window: convicted.
        handle.store(1_001_000, Ordering::SeqCst);
        manager.scavenge().await;
        assert!(!manager.can_work(0));
        assert_eq!(manager.lock_state(0), Some(LockState::Disinterested));
    }

    #[tokio::test]
    async fn test_min_hold_defers_conviction() {
        let config = LockManagerConfig {
            min_lock_hold: Duration::from_millis(10_000),
            lock_disinterested: Duration::from_millis(0),
            scavenge_interval: Duration::from_secs(3600),
            max_locks_per_cycle: 8,
        };
        let (manager, _, handle) = manager_with(config, vec![0]);
        manager.scavenge().await;
        assert!(manager.can_work(0));

        // Held for less than the minimum: kept despite no interest.
        handle.store(1_005_000, Ordering::SeqCst);
        manager.scavenge().await;
        assert!(manager.can_work(0));

        handle.store(1_010_001, Ordering::SeqCst);
        manager.scavenge().await;
        assert!(!manager.can_work(0));
    }

    #[tokio::test]
    async fn test_contended_lock_reports_acquire_failed() {
        let table = MemoryLockTable::new();
        let other = MemoryLockService::with_table(Arc::clone(&table));
        assert!(other.try_acquire("/shards/0").await.expect("acquire"));

        let service = Arc::new(MemoryLockService::with_table(table));
        let (clock, _) = SharedClock::starting_at(1_000_000);
        let manager = DistributedShardLockManager::new(
            service as Arc<dyn LockCoordinator>,
            Arc::new(clock),
            zeroed_config(),
            vec![0],
        );

        manager.scavenge().await;
        assert!(!manager.can_work(0));
        assert_eq!(manager.unheld_shards(), vec![0]);
    }

    #[tokio::test]
    async fn test_connection_loss_degrades_to_error_and_recovers() {
        let config = LockManagerConfig {
            min_lock_hold: Duration::from_secs(3600),
            lock_disinterested: Duration::from_millis(0),
            scavenge_interval: Duration::from_secs(3600),
            max_locks_per_cycle: 8,
        };
        let (manager, service, _) = manager_with(config, vec![0, 1]);
        manager.scavenge().await;
        assert_eq!(manager.held_shards(), vec![0, 1]);

        service.simulate_connection_loss();
        manager
            .handle_connection_event(ConnectionState::Lost)
            .await;
        assert_eq!(manager.error_shards(), vec![0, 1]);
        assert!(!manager.can_work(0));

        service.simulate_reconnect();
        manager
            .handle_connection_event(ConnectionState::Reconnected)
            .await;
        // Reconnect forces a scavenge; errored locks retry immediately.
        assert_eq!(manager.held_shards(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_remove_shard_releases_on_next_scavenge() {
        let table = MemoryLockTable::new();
        let service = Arc::new(MemoryLockService::with_table(Arc::clone(&table)));
        let (clock, _) = SharedClock::starting_at(1_000_000);
        let config = LockManagerConfig {
            min_lock_hold: Duration::from_secs(3600),
            lock_disinterested: Duration::from_millis(0),
            scavenge_interval: Duration::from_secs(3600),
            max_locks_per_cycle: 8,
        };
        let manager = DistributedShardLockManager::new(
            service as Arc<dyn LockCoordinator>,
            Arc::new(clock),
            config,
            vec![0],
        );
        manager.scavenge().await;
        assert!(manager.can_work(0));
        assert!(table.owner_of("/shards/0").is_some());

        manager.remove_shard(0);
        assert!(!manager.can_work(0));
        manager.scavenge().await;

        // The coordinator-side lock is gone; any session can take it.
        assert_eq!(table.owner_of("/shards/0"), None);
    }

    #[tokio::test]
    async fn test_acquire_failed_retries_after_disinterest_window() {
        let table = MemoryLockTable::new();
        let other = MemoryLockService::with_table(Arc::clone(&table));
        assert!(other.try_acquire("/shards/0").await.expect("acquire"));

        let service = Arc::new(MemoryLockService::with_table(table));
        let (clock, handle) = SharedClock::starting_at(1_000_000);
        let config = LockManagerConfig {
            min_lock_hold: Duration::from_millis(0),
            lock_disinterested: Duration::from_millis(1_000),
            scavenge_interval: Duration::from_secs(3600),
            max_locks_per_cycle: 8,
        };
        let manager = DistributedShardLockManager::new(
            service as Arc<dyn LockCoordinator>,
            Arc::new(clock),
            config,
            vec![0],
        );

        manager.scavenge().await;
        assert_eq!(manager.lock_state(0), Some(LockState::AcquireFailed));

        // The peer lets go; we retry only after the cool-down.
        other.release("/shards/0").await.expect("release");
        handle.store(1_000_500, Ordering::SeqCst);
        manager.scavenge().await;
        assert_eq!(manager.lock_state(0), Some(LockState::AcquireFailed));

        handle.store(1_001_000, Ordering::SeqCst);
        manager.scavenge().await;
        assert!(manager.can_work(0));
    }
}
