use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;

/// Connection state of the distributed coordination service, as
/// observed by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Lost,
    Reconnected,
}

/// Seam over the distributed coordination service holding per-shard
/// exclusive locks (a ZooKeeper-style consensus store in production).
///
/// Lock paths map 1:1 to shard identifiers. Acquisition is non-blocking
/// from the caller's perspective: `try_acquire` either obtains the lock
/// or reports contention; connection trouble surfaces as errors and as
/// `connection_events` notifications.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Attempts to take the exclusive lock at `path`. Returns false on
    /// contention, an error when the service is unreachable.
    async fn try_acquire(&self, path: &str) -> Result<bool>;

    /// Releases the lock at `path` if this process holds it.
    async fn release(&self, path: &str) -> Result<()>;

    /// Watch channel carrying connection-state transitions.
    fn connection_events(&self) -> watch::Receiver<ConnectionState>;

    /// Whether the service is currently reachable.
    fn is_connected(&self) -> bool;
}

/// Shared owner table standing in for the coordination service's lock
/// namespace. Clone one table into several [`MemoryLockService`]s to
/// simulate a fleet contending for the same shards.
#[derive(Default)]
pub struct MemoryLockTable {
    owners: DashMap<String, u64>,
    next_owner: AtomicU64,
}

impl MemoryLockTable {
    pub fn new() -> Arc<MemoryLockTable> {
        Arc::new(MemoryLockTable::default())
    }

    fn allocate_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::SeqCst)
    }

    /// The owner currently holding `path`, if any.
    pub fn owner_of(&self, path: &str) -> Option<u64> {
        self.owners.get(path).map(|o| *o)
    }
}

/// In-process lock coordination: one session against a (possibly
/// shared) [`MemoryLockTable`], with simulated connection loss so the
/// degradation and reacquisition paths are testable without a real
/// coordination service.
pub struct MemoryLockService {
    table: Arc<MemoryLockTable>,
    owner_id: u64,
    connected: AtomicBool,
    events: watch::Sender<ConnectionState>,
}

impl MemoryLockService {
    /// A service with a private lock table (single-process use).
    pub fn standalone() -> MemoryLockService {
        MemoryLockService::with_table(MemoryLockTable::new())
    }

    /// A session against a shared table.
    pub fn with_table(table: Arc<MemoryLockTable>) -> MemoryLockService {
        let owner_id = table.allocate_owner();
        let (events, _) = watch::channel(ConnectionState::Connected);
        MemoryLockService {
            table,
            owner_id,
            connected: AtomicBool::new(true),
            events,
        }
    }

    /// Simulates losing the service connection: this session's locks
    /// evaporate (ephemeral semantics) and watchers observe `Lost`.
    pub fn simulate_connection_loss(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.table
            .owners
            .retain(|_, owner| *owner != self.owner_id);
        let _ = self.events.send(ConnectionState::Lost);
    }

    /// Simulates the connection coming back.
    pub fn simulate_reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionState::Reconnected);
    }

    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }
}

#[async_trait]
impl LockCoordinator for MemoryLockService {
    async fn try_acquire(&self, path: &str) -> Result<bool> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("lock service connection lost");
        }
        match self.table.owners.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(self.owner_id);
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                Ok(*occupied.get() == self.owner_id)
            }
        }
    }

    async fn release(&self, path: &str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("lock service connection lost");
        }
        self.table
            .owners
            .remove_if(path, |_, owner| *owner == self.owner_id);
        Ok(())
    }

    fn connection_events(&self) -> watch::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
