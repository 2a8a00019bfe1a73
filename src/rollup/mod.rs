pub mod slot_key;

pub use slot_key::SlotKey;

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Number of shards the metric-identifier space is partitioned into.
/// Slot state is coordinated fleet-wide per shard, so this value must
/// agree across every process.
pub const NUMBER_OF_SHARDS: i32 = 128;

/// Slot count at the finest granularity. The slot counts of every
/// coarser granularity divide this evenly.
const BASE_SLOTS: i64 = 4032;

/// Milliseconds covered by one slot at the finest granularity.
const MILLISECONDS_IN_SLOT: i64 = 300_000;

/// Requesting a granularity past either end of the hierarchy.
///
/// This is a programming error: callers walking the hierarchy are
/// expected to stop at the boundaries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GranularityError {
    #[error("nothing coarser than {0}")]
    NothingCoarser(Granularity),
    #[error("nothing finer than {0}")]
    NothingFiner(Granularity),
}

/// One resolution level of the rollup hierarchy.
///
/// ```text
/// 1440m    [ one slot spans a day; six 240m ranges fit inside it.
/// 240m     [                       |                       |   ...
/// 60m      [     |     |     |     |     |     |     |     |   ...
/// 20m      [ | | | | | | | | | | | | | | | | | | | | | | | |   ...
/// 5m       [|||||||||||||||||||||||||||||||||||||||||||||||||  ...
/// full     [ raw resolution, partitioned into the same ranges as 5m.
/// ```
///
/// Slot indices wrap after `num_slots`, so a slot alone does not name an
/// absolute time; `derive_range` recovers the time range relative to a
/// reference instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Full,
    Min5,
    Min20,
    Min60,
    Min240,
    Min1440,
}

/// All granularities, finest to coarsest. Order is important.
const GRANULARITIES: [Granularity; 6] = [
    Granularity::Full,
    Granularity::Min5,
    Granularity::Min20,
    Granularity::Min60,
    Granularity::Min240,
    Granularity::Min1440,
];

/// Granularities that are rollup destinations. Ingestion fan-out and the
/// eligibility scan cover exactly these.
const ROLLUP_GRANULARITIES: [Granularity; 5] = [
    Granularity::Min5,
    Granularity::Min20,
    Granularity::Min60,
    Granularity::Min240,
    Granularity::Min1440,
];

impl Granularity {
    /// Coarsest granularity in the hierarchy.
    pub const LAST: Granularity = Granularity::Min1440;

    /// All granularities, finest to coarsest.
    pub fn all() -> &'static [Granularity] {
        &GRANULARITIES
    }

    /// The granularities eligible as rollup destinations.
    pub fn rollup_granularities() -> &'static [Granularity] {
        &ROLLUP_GRANULARITIES
    }

    fn index(self) -> usize {
        match self {
            Granularity::Full => 0,
            Granularity::Min5 => 1,
            Granularity::Min20 => 2,
            Granularity::Min60 => 3,
            Granularity::Min240 => 4,
            Granularity::Min1440 => 5,
        }
    }

    /// Storage/diagnostic name, e.g. `metrics_5m`.
    pub fn name(self) -> &'static str {
        match self {
            Granularity::Full => "metrics_full",
            Granularity::Min5 => "metrics_5m",
            Granularity::Min20 => "metrics_20m",
            Granularity::Min60 => "metrics_60m",
            Granularity::Min240 => "metrics_240m",
            Granularity::Min1440 => "metrics_1440m",
        }
    }

    /// Short name, e.g. `5m`.
    pub fn short_name(self) -> &'static str {
        match self {
            Granularity::Full => "full",
            Granularity::Min5 => "5m",
            Granularity::Min20 => "20m",
            Granularity::Min60 => "60m",
            Granularity::Min240 => "240m",
            Granularity::Min1440 => "1440m",
        }
    }

    /// Milliseconds spanned by one slot at this granularity.
    pub fn milliseconds(self) -> i64 {
        match self {
            Granularity::Full | Granularity::Min5 => MILLISECONDS_IN_SLOT,
            Granularity::Min20 => 1_200_000,
            Granularity::Min60 => 3_600_000,
            Granularity::Min240 => 14_400_000,
            Granularity::Min1440 => 86_400_000,
        }
    }

    /// Number of slots before indices wrap. Decreases as granularity
    /// coarsens.
    pub fn num_slots(self) -> i32 {
        (match self {
            Granularity::Full | Granularity::Min5 => BASE_SLOTS,
            Granularity::Min20 => BASE_SLOTS / 4,
            Granularity::Min60 => BASE_SLOTS / 12,
            Granularity::Min240 => BASE_SLOTS / 48,
            Granularity::Min1440 => BASE_SLOTS / 288,
        }) as i32
    }

    /// The next coarser granularity. Fails at the coarsest.
    pub fn coarser(self) -> Result<Granularity, GranularityError> {
        if self == Self::LAST {
            return Err(GranularityError::NothingCoarser(self));
        }
        Ok(GRANULARITIES[self.index() + 1])
    }

    /// The next finer granularity. Fails at the finest.
    pub fn finer(self) -> Result<Granularity, GranularityError> {
        if self == Granularity::Full {
            return Err(GranularityError::NothingFiner(self));
        }
        Ok(GRANULARITIES[self.index() - 1])
    }

    /// Strict partial order consistent with the hierarchy.
    pub fn is_coarser(self, other: Granularity) -> bool {
        self.index() > other.index()
    }

    /// Floors the timestamp to the start of its slot range.
    pub fn snap_millis(self, millis: u64) -> u64 {
        if self == Granularity::Full {
            return millis;
        }
        let width = self.milliseconds() as u64;
        (millis / width) * width
    }

    /// Maps a timestamp to its (wrapping) slot index at this
    /// granularity. Stable across processes: this is the fleet-wide
    /// coordination key.
    pub fn slot(self, millis: u64) -> i32 {
        let full_slot = millis_to_full_slot(millis);
        ((self.num_slots() as i64 * full_slot) / BASE_SLOTS) as i32
    }

    /// The slot at this granularity containing the given slot of the
    /// next finer granularity. E.g. 5m slot 144 maps to 20m slot 36.
    pub fn slot_from_finer_slot(self, finer_slot: i32) -> Result<i32, GranularityError> {
        Ok((finer_slot * self.num_slots()) / self.finer()?.num_slots())
    }

    /// Derives the absolute time range for a (wrapping) slot relative to
    /// a reference instant, which must lie at or after the slot.
    pub fn derive_range(self, slot: i32, reference_millis: u64) -> Range {
        let reference = self.snap_millis(reference_millis) as i64;
        let ref_slot = self.slot(reference as u64) as i64;
        let slot = slot as i64;
        let num_slots = self.num_slots() as i64;
        let slot_diff = if slot > ref_slot {
            num_slots - slot + ref_slot
        } else {
            ref_slot - slot
        };
        let start = reference - slot_diff * self.milliseconds();
        Range {
            start: start as u64,
            stop: (start + self.milliseconds() - 1) as u64,
        }
    }

    /// Parses a long (`metrics_5m`) or short (`5m`) granularity name.
    pub fn from_name(s: &str) -> Option<Granularity> {
        GRANULARITIES
            .iter()
            .copied()
            .find(|g| g.name() == s || g.short_name() == s)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Computes the full-resolution slot: wrapping position within the
/// 4032-slot, 300-second-per-slot ring.
fn millis_to_full_slot(millis: u64) -> i64 {
    let ring = (BASE_SLOTS * MILLISECONDS_IN_SLOT) as u64;
    ((millis % ring) / MILLISECONDS_IN_SLOT as u64) as i64
}

/// A closed millisecond interval `[start, stop]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub stop: u64,
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.stop)
    }
}
