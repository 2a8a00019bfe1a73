use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::rollup::NUMBER_OF_SHARDS;

/// Top-level configuration for the rollupd daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shards this process manages.
    #[serde(default)]
    pub shards: ShardSet,

    /// Rollup scheduling and execution configuration.
    #[serde(default)]
    pub rollup: RollupConfig,

    /// Distributed shard lock configuration.
    #[serde(default)]
    pub locks: LocksConfig,

    /// Shard-state persistence worker configuration.
    #[serde(default)]
    pub state: StateConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            log_level: default_log_level(),
            shards: ShardSet::default(),
            rollup: RollupConfig::default(),
            locks: LocksConfig::default(),
            state: StateConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Which shards to manage: every shard, or an explicit list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ShardSet {
    /// The literal string "all".
    Keyword(String),
    /// Explicit shard ids.
    List(Vec<i32>),
}

impl Default for ShardSet {
    fn default() -> ShardSet {
        ShardSet::Keyword("all".to_string())
    }
}

impl ShardSet {
    /// Resolves to the concrete shard ids.
    pub fn resolve(&self) -> Result<Vec<i32>> {
        match self {
            ShardSet::Keyword(word) if word.eq_ignore_ascii_case("all") => {
                Ok((0..NUMBER_OF_SHARDS).collect())
            }
            ShardSet::Keyword(word) if word.eq_ignore_ascii_case("none") => Ok(Vec::new()),
            ShardSet::Keyword(word) => bail!("unknown shard keyword: {word}"),
            ShardSet::List(shards) => {
                for shard in shards {
                    if !(0..NUMBER_OF_SHARDS).contains(shard) {
                        bail!("shard {shard} out of range 0..{NUMBER_OF_SHARDS}");
                    }
                }
                Ok(shards.clone())
            }
        }
    }
}

/// Rollup scheduling and execution configuration. The delay values are
/// re-read at the start of every scheduling cycle, so operators can
/// adjust them on a running process.
#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    /// Age a slot must reach past its newest collection time before its
    /// first rollup. Default: 5m.
    #[serde(default = "default_rollup_delay", with = "humantime_serde")]
    pub delay: Duration,

    /// Age gate for re-rolling slots whose delayed data arrived within
    /// this window of collection time. Default: 10m.
    #[serde(
        default = "default_short_delay_rollup_delay",
        with = "humantime_serde"
    )]
    pub short_delay_metrics_rollup_delay: Duration,

    /// Quiet period after the last long-delay ingest before a re-roll,
    /// so trailing late arrivals batch into one re-roll. Default: 5m.
    #[serde(
        default = "default_long_delay_rollup_wait",
        with = "humantime_serde"
    )]
    pub long_delay_metrics_rollup_wait: Duration,

    /// Window after a rollup within which renewed slot activity counts
    /// as delayed data. Default: 3d.
    #[serde(default = "default_reroll_window", with = "humantime_serde")]
    pub reroll_window: Duration,

    /// Period of the scheduling scan. Default: 10s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Keep schedule time synced to the wall clock each cycle.
    /// Default: true.
    #[serde(default = "default_true")]
    pub keep_server_time: bool,

    /// Minimum buffered rollups before a write batch dispatches.
    /// Default: 5.
    #[serde(default = "default_batch_min_size")]
    pub batch_min_size: usize,

    /// Hard cap on one write batch. Default: 100.
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,

    /// Concurrent slot executions. Default: 2.
    #[serde(default = "default_locator_fetch_concurrency")]
    pub locator_fetch_concurrency: usize,

    /// Bounded pool for per-locator read+aggregate work. Default: 20.
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,

    /// Bounded pool for batched rollup writes. Default: 5.
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,

    /// Sleep between drain-predicate checks while a slot finishes.
    /// Default: 1s.
    #[serde(default = "default_drain_poll_interval", with = "humantime_serde")]
    pub drain_poll_interval: Duration,
}

impl Default for RollupConfig {
    fn default() -> RollupConfig {
        RollupConfig {
            delay: default_rollup_delay(),
            short_delay_metrics_rollup_delay: default_short_delay_rollup_delay(),
            long_delay_metrics_rollup_wait: default_long_delay_rollup_wait(),
            reroll_window: default_reroll_window(),
            poll_interval: default_poll_interval(),
            keep_server_time: true,
            batch_min_size: default_batch_min_size(),
            batch_max_size: default_batch_max_size(),
            locator_fetch_concurrency: default_locator_fetch_concurrency(),
            read_concurrency: default_read_concurrency(),
            write_concurrency: default_write_concurrency(),
            drain_poll_interval: default_drain_poll_interval(),
        }
    }
}

/// Distributed shard lock configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocksConfig {
    /// Arbitrate shard ownership through the coordination service.
    /// When false every managed shard is always workable (single-node
    /// mode). Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Minimum time a lock is held before voluntary release.
    /// Default: 20m.
    #[serde(default = "default_min_lock_hold", with = "humantime_serde")]
    pub min_hold: Duration,

    /// Idle window after which a held lock is released for rebalancing,
    /// and the cool-down before re-attempting a released or contended
    /// lock. Default: 1m.
    #[serde(default = "default_lock_disinterested", with = "humantime_serde")]
    pub disinterested: Duration,

    /// Period of the lock scavenge. Default: 2m.
    #[serde(default = "default_scavenge_interval", with = "humantime_serde")]
    pub scavenge_interval: Duration,

    /// Acquisition budget per scavenge cycle. Default: 1.
    #[serde(default = "default_max_locks_per_cycle")]
    pub max_locks_per_cycle: usize,
}

impl Default for LocksConfig {
    fn default() -> LocksConfig {
        LocksConfig {
            enabled: false,
            min_hold: default_min_lock_hold(),
            disinterested: default_lock_disinterested(),
            scavenge_interval: default_scavenge_interval(),
            max_locks_per_cycle: default_max_locks_per_cycle(),
        }
    }
}

/// Shard-state persistence worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Period between pushes of dirty slot state. Default: 2s.
    #[serde(default = "default_state_period", with = "humantime_serde")]
    pub push_interval: Duration,

    /// Period between pulls of persisted slot state. Default: 2s.
    #[serde(default = "default_state_period", with = "humantime_serde")]
    pub pull_interval: Duration,
}

impl Default for StateConfig {
    fn default() -> StateConfig {
        StateConfig {
            push_interval: default_state_period(),
            pull_interval: default_state_period(),
        }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address, e.g. ":9090" or "127.0.0.1:9090". Empty
    /// disables the server.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> HealthConfig {
        HealthConfig {
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Loads and validates a YAML config file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        self.shards.resolve().context("shards")?;
        if self.rollup.batch_min_size == 0 || self.rollup.batch_max_size == 0 {
            bail!("rollup batch sizes must be > 0");
        }
        if self.rollup.batch_min_size > self.rollup.batch_max_size {
            bail!(
                "rollup batch_min_size {} exceeds batch_max_size {}",
                self.rollup.batch_min_size,
                self.rollup.batch_max_size
            );
        }
        if self.rollup.locator_fetch_concurrency == 0
            || self.rollup.read_concurrency == 0
            || self.rollup.write_concurrency == 0
        {
            bail!("rollup concurrency values must be > 0");
        }
        if self.rollup.drain_poll_interval.is_zero() {
            bail!("drain_poll_interval must be > 0");
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rollup_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_short_delay_rollup_delay() -> Duration {
    Duration::from_secs(600)
}

fn default_long_delay_rollup_wait() -> Duration {
    Duration::from_secs(300)
}

fn default_reroll_window() -> Duration {
    Duration::from_secs(3 * 24 * 60 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_batch_min_size() -> usize {
    5
}

fn default_batch_max_size() -> usize {
    100
}

fn default_locator_fetch_concurrency() -> usize {
    2
}

fn default_read_concurrency() -> usize {
    20
}

fn default_write_concurrency() -> usize {
    5
}

fn default_drain_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_min_lock_hold() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_lock_disinterested() -> Duration {
    Duration::from_secs(60)
}

fn default_scavenge_interval() -> Duration {
    Duration::from_secs(120)
}

fn default_max_locks_per_cycle() -> usize {
    1
}

fn default_state_period() -> Duration {
    Duration::from_secs(2)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults valid");
        assert_eq!(config.rollup.delay, Duration::from_secs(300));
        assert_eq!(
            config.shards.resolve().expect("all"),
            (0..NUMBER_OF_SHARDS).collect::<Vec<i32>>()
        );
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
log_level: debug
shards: [0, 1, 64]
rollup:
  delay: 5m
  short_delay_metrics_rollup_delay: 10m
  long_delay_metrics_rollup_wait: 1h
  poll_interval: 30s
  batch_min_size: 10
  batch_max_size: 200
  locator_fetch_concurrency: 4
  read_concurrency: 32
  write_concurrency: 8
locks:
  enabled: true
  min_hold: 30m
  disinterested: 2m
  scavenge_interval: 1m
  max_locks_per_cycle: 3
state:
  push_interval: 5s
  pull_interval: 3s
health:
  addr: "127.0.0.1:9417"
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        config.validate().expect("valid");

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.shards.resolve().expect("list"), vec![0, 1, 64]);
        assert_eq!(
            config.rollup.long_delay_metrics_rollup_wait,
            Duration::from_secs(3600)
        );
        assert!(config.locks.enabled);
        assert_eq!(config.locks.max_locks_per_cycle, 3);
        assert_eq!(config.state.pull_interval, Duration::from_secs(3));
        assert_eq!(config.health.addr, "127.0.0.1:9417");
    }

    #[test]
    fn test_shard_keywords() {
        let all: ShardSet = serde_yaml::from_str("all").expect("parse");
        assert_eq!(all.resolve().expect("all").len(), NUMBER_OF_SHARDS as usize);

        let none: ShardSet = serde_yaml::from_str("none").expect("parse");
        assert!(none.resolve().expect("none").is_empty());

        let bogus: ShardSet = serde_yaml::from_str("some").expect("parse");
        assert!(bogus.resolve().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_shard() {
        let config: Config = serde_yaml::from_str("shards: [200]").expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_batch_sizes() {
        let yaml = "rollup:\n  batch_min_size: 50\n  batch_max_size: 10\n";
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(config.validate().is_err());
    }
}
