use std::fmt;
use std::str::FromStr;

use super::{Granularity, NUMBER_OF_SHARDS};

/// Identity of one schedulable unit of rollup work: a (granularity,
/// slot, shard) triple. Immutable, equality is structural.
///
/// The textual form `<granularity_name>,<slot>,<shard>` (e.g.
/// `metrics_5m,4,0`) round-trips through [`FromStr`]/[`fmt::Display`]
/// and is what appears in logs and the persisted state rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    granularity: Granularity,
    slot: i32,
    shard: i32,
}

impl SlotKey {
    /// Builds a slot key, panicking on out-of-range slot or shard.
    /// Both bounds are invariants of the callers (slot indices come out
    /// of `Granularity::slot`, shards out of the managed set).
    pub fn of(granularity: Granularity, slot: i32, shard: i32) -> SlotKey {
        assert!(
            (0..NUMBER_OF_SHARDS).contains(&shard),
            "shard {shard} out of range"
        );
        assert!(
            (0..granularity.num_slots()).contains(&slot),
            "slot {slot} out of range for {granularity}"
        );
        SlotKey {
            granularity,
            slot,
            shard,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn slot(&self) -> i32 {
        self.slot
    }

    pub fn shard(&self) -> i32 {
        self.shard
    }

    /// The key for the same shard and approximate time range one
    /// granularity coarser, or `None` at the top of the hierarchy.
    pub fn parent(&self) -> Option<SlotKey> {
        let coarser = self.granularity.coarser().ok()?;
        let slot = coarser.slot_from_finer_slot(self.slot).ok()?;
        Some(SlotKey::of(coarser, slot, self.shard))
    }

    /// All finer-granularity keys covering this key's time range, down
    /// to and including full resolution.
    pub fn children(&self) -> Vec<SlotKey> {
        let mut result = Vec::new();
        self.collect_children(&mut result);
        result
    }

    fn collect_children(&self, out: &mut Vec<SlotKey>) {
        let Ok(finer) = self.granularity.finer() else {
            return;
        };
        let factor = finer.num_slots() / self.granularity.num_slots();
        for i in 0..factor {
            let child = SlotKey::of(finer, self.slot * factor + i, self.shard);
            out.push(child);
            child.collect_children(out);
        }
    }

    /// The key at the given granularity whose range contains this key's
    /// range. The target must not be finer than this key.
    pub fn extrapolate(&self, granularity: Granularity) -> SlotKey {
        if granularity == self.granularity {
            return *self;
        }
        let slot =
            (self.slot as i64 * granularity.num_slots() as i64 / self.granularity.num_slots() as i64)
                as i32;
        SlotKey::of(granularity, slot, self.shard)
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.granularity.name(), self.slot, self.shard)
    }
}

/// Parse error for the textual slot key form.
#[derive(Debug, PartialEq, Eq)]
pub struct ParseSlotKeyError;

impl fmt::Display for ParseSlotKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid slot key")
    }
}

impl std::error::Error for ParseSlotKeyError {}

impl FromStr for SlotKey {
    type Err = ParseSlotKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split(',');
        let granularity = tokens
            .next()
            .and_then(Granularity::from_name)
            .ok_or(ParseSlotKeyError)?;
        let slot: i32 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or(ParseSlotKeyError)?;
        let shard: i32 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or(ParseSlotKeyError)?;
        if tokens.next().is_some() {
            return Err(ParseSlotKeyError);
        }
        if !(0..NUMBER_OF_SHARDS).contains(&shard) || !(0..granularity.num_slots()).contains(&slot)
        {
            return Err(ParseSlotKeyError);
        }
        Ok(SlotKey::of(granularity, slot, shard))
    }
}
