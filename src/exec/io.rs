use std::collections::{BTreeSet, HashSet};
use std::fmt;

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::rollup::{Granularity, Range};

/// Identity of one time series: tenant plus metric path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator {
    tenant: String,
    metric: String,
}

impl Locator {
    pub fn new(tenant: impl Into<String>, metric: impl Into<String>) -> Locator {
        Locator {
            tenant: tenant.into(),
            metric: metric.into(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.tenant, self.metric)
    }
}

/// A computed rollup for one locator and destination slot. The
/// statistical contents are opaque to the scheduler; only the point
/// count is inspected, for accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupValue {
    pub point_count: u64,
    pub payload: Vec<u8>,
}

/// One pending aggregation result awaiting persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleRollupWriteContext {
    pub locator: Locator,
    pub granularity: Granularity,
    pub slot: i32,
    pub rollup: RollupValue,
}

/// Discovery seam: which time series have data in a shard.
#[async_trait]
pub trait LocatorIo: Send + Sync {
    /// All locators with data present in the given shard.
    async fn get_locators(&self, shard: i32) -> Result<Vec<Locator>>;
}

/// Read-and-aggregate seam: produces the coarser-granularity rollup for
/// one locator over one source range. The aggregation math itself lives
/// behind this trait.
#[async_trait]
pub trait RollupSource: Send + Sync {
    /// Aggregates `locator`'s data in `range` at `src` granularity into
    /// a `dst`-granularity rollup. `None` when the range holds no
    /// points.
    async fn read_and_aggregate(
        &self,
        locator: &Locator,
        src: Granularity,
        range: Range,
        dst: Granularity,
    ) -> Result<Option<RollupValue>>;
}

/// Persistence seam for computed rollups.
#[async_trait]
pub trait RollupWriter: Send + Sync {
    /// Persists a batch of rollups. All-or-nothing from the caller's
    /// perspective: an error fails the whole batch.
    async fn insert_rollups(&self, batch: &[SingleRollupWriteContext]) -> Result<()>;
}

/// In-memory metric store implementing all three seams: a locator index
/// per shard, raw point timestamps per locator, and a log of written
/// rollups. Standalone mode and test substrate.
#[derive(Default)]
pub struct MemoryLocatorStore {
    locators: DashMap<i32, HashSet<Locator>>,
    points: DashMap<Locator, BTreeSet<u64>>,
    written: Mutex<Vec<SingleRollupWriteContext>>,
    fail_get_locators: Mutex<bool>,
    fail_inserts: Mutex<bool>,
}

impl MemoryLocatorStore {
    pub fn new() -> MemoryLocatorStore {
        MemoryLocatorStore::default()
    }

    /// Records a raw data point for a locator in a shard.
    pub fn insert_point(&self, shard: i32, locator: &Locator, timestamp: u64) {
        self.locators
            .entry(shard)
            .or_default()
            .insert(locator.clone());
        self.points
            .entry(locator.clone())
            .or_default()
            .insert(timestamp);
    }

    pub fn set_fail_get_locators(&self, fail: bool) {
        *self.fail_get_locators.lock() = fail;
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        *self.fail_inserts.lock() = fail;
    }

    /// All rollups written so far.
    pub fn written_rollups(&self) -> Vec<SingleRollupWriteContext> {
        self.written.lock().clone()
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().len()
    }
}

#[async_trait]
impl LocatorIo for MemoryLocatorStore {
    async fn get_locators(&self, shard: i32) -> Result<Vec<Locator>> {
        if *self.fail_get_locators.lock() {
            bail!("locator index unavailable");
        }
        let mut locators: Vec<Locator> = self
            .locators
            .get(&shard)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        locators.sort();
        Ok(locators)
    }
}

#[async_trait]
impl RollupSource for MemoryLocatorStore {
    async fn read_and_aggregate(
        &self,
        locator: &Locator,
        _src: Granularity,
        range: Range,
        _dst: Granularity,
    ) -> Result<Option<RollupValue>> {
        let count = self
            .points
            .get(locator)
            .map(|points| points.range(range.start..=range.stop).count() as u64)
            .unwrap_or(0);
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(RollupValue {
            point_count: count,
            payload: count.to_le_bytes().to_vec(),
        }))
    }
}

#[async_trait]
impl RollupWriter for MemoryLocatorStore {
    async fn insert_rollups(&self, batch: &[SingleRollupWriteContext]) -> Result<()> {
        if *self.fail_inserts.lock() {
            bail!("rollup store unavailable");
        }
        self.written.lock().extend_from_slice(batch);
        Ok(())
    }
}
