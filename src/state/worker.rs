use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::export::HealthMetrics;
use crate::state::{ShardStateIo, ShardStateManager, SlotState};

/// Periodically persists dirty slot state for the managed shards.
///
/// Dirty flags are cleared only after a successful write, and only for
/// stamps that did not change while the write was in flight.
pub struct ShardStatePusher {
    manager: Arc<ShardStateManager>,
    io: Arc<dyn ShardStateIo>,
    period: Duration,
    active: AtomicBool,
    health: Option<Arc<HealthMetrics>>,
}

impl ShardStatePusher {
    pub fn new(
        manager: Arc<ShardStateManager>,
        io: Arc<dyn ShardStateIo>,
        period: Duration,
    ) -> ShardStatePusher {
        ShardStatePusher {
            manager,
            io,
            period,
            active: AtomicBool::new(true),
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> ShardStatePusher {
        self.health = Some(health);
        self
    }

    /// Pauses or resumes the periodic pushes.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Runs the periodic push loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("shard state pusher stopped");
                    return;
                }
                _ = interval.tick() => {
                    if !self.active.load(Ordering::SeqCst) {
                        continue;
                    }
                    match self.push_once().await {
                        Ok(()) => {
                            if let Some(health) = &self.health {
                                health.state_pushes.inc();
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "shard state push failed");
                            if let Some(health) = &self.health {
                                health.state_io_errors.with_label_values(&["push"]).inc();
                            }
                        }
                    }
                }
            }
        }
    }

    /// Pushes dirty state for every managed shard once. Also the forced
    /// entry point for tests and operations.
    pub async fn push_once(&self) -> Result<()> {
        for shard in self.manager.managed_shards() {
            let dirty = self.manager.dirty_slots(shard);
            if dirty.is_empty() {
                continue;
            }
            let rows: Vec<SlotState> = dirty
                .iter()
                .map(|(granularity, slot, stamp)| {
                    // An active row's last-updated is its ingest time; a
                    // rolled row's is the rollup completion time.
                    let last_updated = match stamp.state {
                        crate::state::StampState::Rolled => stamp.last_rollup_timestamp,
                        _ => stamp.last_ingest_timestamp,
                    };
                    SlotState::new(*granularity, *slot, stamp.state)
                        .with_timestamp(stamp.timestamp)
                        .with_last_updated(last_updated)
                })
                .collect();
            self.io
                .put_shard_state(shard, &rows)
                .await
                .with_context(|| format!("persisting {} slots for shard {shard}", rows.len()))?;
            self.manager.mark_clean_if_unchanged(shard, &dirty);
            debug!(shard, count = rows.len(), "pushed dirty slot state");
        }
        Ok(())
    }
}

/// Periodically pulls persisted slot state for the managed shards and
/// reconciles it into the local manager.
pub struct ShardStatePuller {
    manager: Arc<ShardStateManager>,
    io: Arc<dyn ShardStateIo>,
    period: Duration,
    active: AtomicBool,
    health: Option<Arc<HealthMetrics>>,
}

impl ShardStatePuller {
    pub fn new(
        manager: Arc<ShardStateManager>,
        io: Arc<dyn ShardStateIo>,
        period: Duration,
    ) -> ShardStatePuller {
        ShardStatePuller {
            manager,
            io,
            period,
            active: AtomicBool::new(true),
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> ShardStatePuller {
        self.health = Some(health);
        self
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Runs the periodic pull loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("shard state puller stopped");
                    return;
                }
                _ = interval.tick() => {
                    if !self.active.load(Ordering::SeqCst) {
                        continue;
                    }
                    match self.pull_once().await {
                        Ok(()) => {
                            if let Some(health) = &self.health {
                                health.state_pulls.inc();
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "shard state pull failed");
                            if let Some(health) = &self.health {
                                health.state_io_errors.with_label_values(&["pull"]).inc();
                            }
                        }
                    }
                }
            }
        }
    }

    /// Pulls and reconciles state for every managed shard once.
    pub async fn pull_once(&self) -> Result<()> {
        for shard in self.manager.managed_shards() {
            let rows = self
                .io
                .get_shard_state(shard)
                .await
                .with_context(|| format!("reading slot state for shard {shard}"))?;
            for row in rows {
                self.manager.update_slot_on_read(shard, row);
            }
        }
        Ok(())
    }
}
