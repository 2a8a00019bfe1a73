pub mod io;
pub mod shard;
pub mod worker;

pub use io::{MemoryShardStateIo, ShardStateIo};
pub use shard::ShardStateManager;
pub use worker::{ShardStatePuller, ShardStatePusher};

use std::fmt;

use crate::rollup::Granularity;

/// Rollup lifecycle state of one slot.
///
/// `Active` means the slot has data newer than its last rollup and needs
/// (re-)rolling. `Running` means exactly one worker currently owns the
/// rollup. `Rolled` is terminal until the next ingest reactivates the
/// slot. Only `Active` and `Rolled` are ever persisted; a `Running` slot
/// persists as `Active` so a crashed worker's slot is retried by
/// whoever reconciles the stored state next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampState {
    Active,
    Running,
    Rolled,
}

impl StampState {
    /// Single-letter code used in the persisted state rows.
    pub fn code(self) -> &'static str {
        match self {
            StampState::Active | StampState::Running => "A",
            StampState::Rolled => "X",
        }
    }

    /// Parses a persisted state code.
    pub fn from_code(code: &str) -> Option<StampState> {
        match code {
            "A" => Some(StampState::Active),
            "X" => Some(StampState::Rolled),
            _ => None,
        }
    }
}

impl fmt::Display for StampState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Per-slot ingestion/rollup record.
///
/// `timestamp` is the newest collection time observed for the slot.
/// `last_rollup_timestamp` only advances on transition into `Rolled`.
/// `last_ingest_timestamp` is in-memory bookkeeping (never persisted)
/// used by the long-delay re-roll gate. `dirty` marks state not yet
/// pushed to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateStamp {
    pub timestamp: u64,
    pub state: StampState,
    pub dirty: bool,
    pub last_rollup_timestamp: u64,
    pub last_ingest_timestamp: u64,
}

impl UpdateStamp {
    pub fn new(timestamp: u64, state: StampState, dirty: bool) -> UpdateStamp {
        UpdateStamp {
            timestamp,
            state,
            dirty,
            last_rollup_timestamp: 0,
            last_ingest_timestamp: 0,
        }
    }
}

/// One persisted shard-state row: the externally visible form of an
/// [`UpdateStamp`] for a (granularity, slot) pair.
///
/// `timestamp` is the ingestion collection time; `last_updated_timestamp`
/// is when the row itself was written: for an `Active` row the last
/// ingest time, for a `Rolled` row the rollup completion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    pub granularity: Granularity,
    pub slot: i32,
    pub state: StampState,
    pub timestamp: u64,
    pub last_updated_timestamp: u64,
}

impl SlotState {
    pub fn new(granularity: Granularity, slot: i32, state: StampState) -> SlotState {
        SlotState {
            granularity,
            slot,
            state,
            timestamp: 0,
            last_updated_timestamp: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> SlotState {
        self.timestamp = timestamp;
        self
    }

    pub fn with_last_updated(mut self, last_updated: u64) -> SlotState {
        self.last_updated_timestamp = last_updated;
        self
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}: {}",
            self.granularity.name(),
            self.slot,
            self.state,
            self.timestamp
        )
    }
}
