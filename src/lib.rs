//! Rollup scheduling and execution core of a distributed time-series
//! metrics store.
//!
//! Decides which time slots of metric data are ready to be aggregated
//! into the next coarser granularity, arbitrates shard ownership across
//! a fleet through a distributed lock coordinator, executes the
//! aggregation work with bounded concurrency, and re-derives results
//! when late-arriving data invalidates a previous rollup.

pub mod clock;
pub mod config;
pub mod exec;
pub mod export;
pub mod locks;
pub mod rollup;
pub mod schedule;
pub mod service;
pub mod state;
