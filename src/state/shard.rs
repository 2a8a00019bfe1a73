use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::rollup::{Granularity, SlotKey};
use crate::state::{SlotState, StampState, UpdateStamp};

/// Single source of truth for slot state across every granularity of
/// the shards this process manages.
///
/// Mutation of a single stamp is atomic (each slot map entry is locked
/// individually); adding or removing a shard swaps the shard's whole
/// sub-map in one step, so readers either see all of a shard's state or
/// none of it.
pub struct ShardStateManager {
    shards: RwLock<HashSet<i32>>,
    states: DashMap<i32, Arc<ShardSlotStates>>,
    clock: Arc<dyn Clock>,
    /// Window after a rollup within which renewed activity on the slot
    /// counts as a re-roll caused by delayed data.
    reroll_window_millis: u64,
}

/// Per-shard slot maps, one per rollup granularity.
struct ShardSlotStates {
    maps: [DashMap<i32, UpdateStamp>; 5],
}

impl ShardSlotStates {
    fn new() -> ShardSlotStates {
        ShardSlotStates {
            maps: std::array::from_fn(|_| DashMap::new()),
        }
    }

    fn map(&self, granularity: Granularity) -> &DashMap<i32, UpdateStamp> {
        let idx = Granularity::rollup_granularities()
            .iter()
            .position(|g| *g == granularity)
            .unwrap_or_else(|| panic!("{granularity} is not a rollup granularity"));
        &self.maps[idx]
    }
}

impl ShardStateManager {
    pub fn new(
        shards: impl IntoIterator<Item = i32>,
        clock: Arc<dyn Clock>,
        reroll_window_millis: u64,
    ) -> ShardStateManager {
        let manager = ShardStateManager {
            shards: RwLock::new(HashSet::new()),
            states: DashMap::new(),
            clock,
            reroll_window_millis,
        };
        for shard in shards {
            manager.add(shard);
        }
        manager
    }

    /// The shards currently managed, sorted for stable iteration.
    pub fn managed_shards(&self) -> Vec<i32> {
        let mut shards: Vec<i32> = self.shards.read().iter().copied().collect();
        shards.sort_unstable();
        shards
    }

    pub fn contains(&self, shard: i32) -> bool {
        self.shards.read().contains(&shard)
    }

    /// Starts managing a shard. Idempotent.
    pub fn add(&self, shard: i32) {
        let mut shards = self.shards.write();
        if shards.insert(shard) {
            self.states.insert(shard, Arc::new(ShardSlotStates::new()));
        }
    }

    /// Stops managing a shard, dropping its whole sub-map.
    pub fn remove(&self, shard: i32) {
        let mut shards = self.shards.write();
        if shards.remove(&shard) {
            self.states.remove(&shard);
        }
    }

    fn shard_states(&self, shard: i32) -> Option<Arc<ShardSlotStates>> {
        self.states.get(&shard).map(|entry| Arc::clone(&entry))
    }

    /// Applies an ingestion observation: the slot containing `millis` at
    /// every rollup granularity becomes `Active` and dirty, with its
    /// timestamp advanced to the maximum collection time seen. Replaying
    /// updates in any order converges to the same state.
    pub fn update(&self, millis: u64, shard: i32) {
        let Some(states) = self.shard_states(shard) else {
            return;
        };
        let now = self.clock.now_millis();
        for granularity in Granularity::rollup_granularities() {
            let slot = granularity.slot(millis);
            states
                .map(*granularity)
                .entry(slot)
                .and_modify(|stamp| {
                    stamp.timestamp = stamp.timestamp.max(millis);
                    stamp.last_ingest_timestamp = now;
                    stamp.state = StampState::Active;
                    stamp.dirty = true;
                })
                .or_insert_with(|| {
                    let mut stamp = UpdateStamp::new(millis, StampState::Active, true);
                    stamp.last_ingest_timestamp = now;
                    stamp
                });
        }
    }

    /// Merges one externally persisted row into the local map.
    ///
    /// The precedence, evaluated in order: adopt unseen slots verbatim;
    /// a `Rolled` row with an exactly matching ingestion timestamp wins
    /// (another process finished the roll we were tracking); a `Rolled`
    /// row with a differing timestamp is stale relative to newer local
    /// ingestion, so stay `Active` but adopt its rollup time; an `Active`
    /// row with new information becomes the baseline unless the local
    /// stamp is ahead and dirty, in which case the dirty flag is
    /// re-asserted so the newer timestamp is pushed back out.
    pub fn update_slot_on_read(&self, shard: i32, slot_state: SlotState) {
        let Some(states) = self.shard_states(shard) else {
            return;
        };
        if slot_state.granularity == Granularity::Full {
            // Full resolution is never rolled; a row claiming it is
            // garbage, and reconciliation never fails loudly.
            debug!(%slot_state, shard, "ignoring full-resolution state row");
            return;
        }
        let map = states.map(slot_state.granularity);
        let incoming_ts = slot_state.timestamp;
        let last_updated = slot_state.last_updated_timestamp;

        match map.entry(slot_state.slot) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let mut stamp = UpdateStamp::new(incoming_ts, slot_state.state, false);
                stamp.last_rollup_timestamp = if slot_state.state == StampState::Rolled {
                    last_updated
                } else {
                    0
                };
                stamp.last_ingest_timestamp = if slot_state.state == StampState::Active {
                    last_updated
                } else {
                    0
                };
                vacant.insert(stamp);
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let stamp = occupied.get_mut();
                if stamp.timestamp != incoming_ts && slot_state.state == StampState::Active {
                    // Apply unless the local stamp is already active and
                    // either ahead or not yet persisted.
                    let local_ahead_or_dirty = stamp.state == StampState::Active
                        && (stamp.timestamp > incoming_ts || stamp.dirty);
                    if !local_ahead_or_dirty {
                        let last_rollup = stamp.last_rollup_timestamp;
                        let mut next = UpdateStamp::new(incoming_ts, StampState::Active, false);
                        next.last_rollup_timestamp = last_rollup;
                        next.last_ingest_timestamp = last_updated;
                        *stamp = next;
                    } else {
                        // Re-assert dirty so the newer local timestamp
                        // is superimposed on the store; required for
                        // fleet-wide convergence.
                        stamp.dirty = true;
                    }
                } else if stamp.timestamp == incoming_ts && slot_state.state == StampState::Rolled
                {
                    stamp.state = StampState::Rolled;
                    if last_updated > stamp.last_rollup_timestamp {
                        stamp.last_rollup_timestamp = last_updated;
                    }
                } else if slot_state.state == StampState::Rolled {
                    // Stale rollup: data newer than the roll has arrived
                    // locally. Keep our state, remember the rollup time.
                    if last_updated > stamp.last_rollup_timestamp {
                        stamp.last_rollup_timestamp = last_updated;
                    }
                }
            }
        };
    }

    /// Snapshot of the stamp for one slot key.
    pub fn get_update_stamp(&self, key: SlotKey) -> Option<UpdateStamp> {
        let states = self.shard_states(key.shard())?;
        states.map(key.granularity()).get(&key.slot()).map(|s| *s)
    }

    /// Atomically replaces the state of a slot, returning the stamp as
    /// it was after the change. The stamp must exist.
    pub fn get_and_set_state(&self, key: SlotKey, state: StampState) -> Option<UpdateStamp> {
        let states = self.shard_states(key.shard())?;
        let mut entry = states.map(key.granularity()).get_mut(&key.slot())?;
        entry.state = state;
        Some(*entry)
    }

    /// Marks the slot rolled: pins the in-memory last-rollup time, and
    /// transitions `Running` to `Rolled`. A slot that was flipped back
    /// to `Active` by a delayed ingest while running keeps that state.
    pub fn mark_rolled(&self, key: SlotKey, rollup_time_millis: u64) {
        let Some(states) = self.shard_states(key.shard()) else {
            return;
        };
        if let Some(mut entry) = states.map(key.granularity()).get_mut(&key.slot()) {
            // Keeps a freshly rolled slot from being rescheduled before
            // the new state reaches the store.
            entry.last_rollup_timestamp = rollup_time_millis;
            if entry.state == StampState::Running {
                entry.state = StampState::Rolled;
                entry.dirty = true;
            }
        };
    }

    /// Re-activates every coarser ancestor of a just-rolled slot, so the
    /// parent granularities pick up the new data. Missing ancestor
    /// stamps are created dirty at the current schedule time.
    pub fn set_all_coarser_slots_dirty(&self, key: SlotKey) {
        let Some(states) = self.shard_states(key.shard()) else {
            return;
        };
        let mut gran = key.granularity();
        let mut slot = key.slot();
        loop {
            let Ok(coarser) = gran.coarser() else {
                return;
            };
            let Ok(coarser_slot) = coarser.slot_from_finer_slot(slot) else {
                return;
            };
            gran = coarser;
            slot = coarser_slot;

            let now = self.clock.now_millis();
            let map = states.map(gran);
            match map.entry(slot) {
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    trace!(
                        key = %SlotKey::of(gran, slot, key.shard()),
                        "creating stamp for coarser slot"
                    );
                    vacant.insert(UpdateStamp::new(now, StampState::Active, true));
                }
                dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                    let stamp = occupied.get_mut();
                    if stamp.state != StampState::Active {
                        debug!(
                            finer = %key,
                            coarser = %SlotKey::of(gran, slot, key.shard()),
                            "re-activating coarser slot after child rollup"
                        );
                        stamp.state = StampState::Active;
                        stamp.dirty = true;
                        stamp.timestamp = now;
                    }
                }
            }
        }
    }

    /// Snapshot of all dirty stamps for a shard, keyed by granularity
    /// and slot. Flags are left set; clear them with
    /// [`mark_clean_if_unchanged`](Self::mark_clean_if_unchanged) after
    /// the snapshot has been persisted.
    pub fn dirty_slots(&self, shard: i32) -> Vec<(Granularity, i32, UpdateStamp)> {
        let Some(states) = self.shard_states(shard) else {
            return Vec::new();
        };
        let mut dirty = Vec::new();
        for granularity in Granularity::rollup_granularities() {
            for entry in states.map(*granularity).iter() {
                if entry.value().dirty {
                    dirty.push((*granularity, *entry.key(), *entry.value()));
                }
            }
        }
        if !dirty.is_empty() {
            debug!(shard, count = dirty.len(), "found dirty slots");
        }
        dirty
    }

    /// Clears dirty flags for stamps that still match the persisted
    /// snapshot. A stamp touched by a concurrent ingest keeps its flag
    /// and is pushed again next cycle.
    pub fn mark_clean_if_unchanged(&self, shard: i32, snapshot: &[(Granularity, i32, UpdateStamp)]) {
        let Some(states) = self.shard_states(shard) else {
            return;
        };
        for (granularity, slot, pushed) in snapshot {
            if let Some(mut entry) = states.map(*granularity).get_mut(slot) {
                if entry.timestamp == pushed.timestamp && entry.state == pushed.state {
                    entry.dirty = false;
                }
            }
        }
    }

    /// Copy-on-read snapshot of a shard's stamps at one granularity.
    pub fn slot_stamps(&self, granularity: Granularity, shard: i32) -> HashMap<i32, UpdateStamp> {
        match self.shard_states(shard) {
            Some(states) => states
                .map(granularity)
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect(),
            None => HashMap::new(),
        }
    }

    /// True if renewed activity on the slot counts as a re-roll: the
    /// slot has rolled before, recently enough that new data must be
    /// delayed data rather than the ring wrapping around.
    pub fn is_reroll(&self, key: SlotKey, now: u64) -> bool {
        match self.get_update_stamp(key) {
            Some(stamp) => {
                stamp.last_rollup_timestamp > 0
                    && now.saturating_sub(stamp.last_rollup_timestamp) < self.reroll_window_millis
            }
            None => false,
        }
    }

    /// Slots of one shard/granularity ready for rollup at `now`.
    ///
    /// A first roll waits `max_age` past the slot's newest collection
    /// time. A re-roll of a slot with short-delay data additionally
    /// waits until `short_delay` has elapsed since collection; a re-roll
    /// still receiving long-delay data (delay beyond `short_delay`)
    /// waits until `long_wait` has passed since the last ingest, so
    /// trailing late arrivals batch into one re-roll.
    pub fn slots_eligible_for_rollup(
        &self,
        shard: i32,
        granularity: Granularity,
        now: u64,
        max_age: u64,
        short_delay: u64,
        long_wait: u64,
    ) -> Vec<i32> {
        let Some(states) = self.shard_states(shard) else {
            return Vec::new();
        };
        let mut eligible = Vec::new();
        for entry in states.map(granularity).iter() {
            let slot = *entry.key();
            let stamp = entry.value();
            if stamp.state == StampState::Rolled {
                continue;
            }
            let elapsed = now.saturating_sub(stamp.timestamp);
            if elapsed <= max_age {
                continue;
            }

            let key = SlotKey::of(granularity, slot, shard);
            if self.is_reroll_stamp(stamp, now) {
                if elapsed <= short_delay {
                    trace!(
                        %key,
                        elapsed,
                        short_delay,
                        "deferring re-roll of short-delay slot"
                    );
                    continue;
                }
                if stamp.last_ingest_timestamp > 0 {
                    let ingest_delay =
                        stamp.last_ingest_timestamp.saturating_sub(stamp.timestamp);
                    let since_ingest = now.saturating_sub(stamp.last_ingest_timestamp);
                    if ingest_delay > short_delay && since_ingest <= long_wait {
                        trace!(
                            %key,
                            since_ingest,
                            long_wait,
                            "deferring re-roll while long-delay data is arriving"
                        );
                        continue;
                    }
                }
            }
            eligible.push(slot);
        }
        eligible
    }

    fn is_reroll_stamp(&self, stamp: &UpdateStamp, now: u64) -> bool {
        stamp.last_rollup_timestamp > 0
            && now.saturating_sub(stamp.last_rollup_timestamp) < self.reroll_window_millis
    }
}
