use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for scheduler health and observability.
///
/// All metrics use the "rollupd" namespace. Organized into tiers:
/// - Core: scheduling throughput and queue depth
/// - State: shard-state push/pull traffic
/// - Locks: distributed ownership
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Core ===
    /// Total slots queued by the eligibility scan.
    pub slots_scheduled: Counter,
    /// Total slots dispatched to execution.
    pub slots_dispatched: Counter,
    /// Total slots rolled successfully.
    pub slots_rolled: Counter,
    /// Total slot executions that failed and were pushed back.
    pub slots_failed: Counter,
    /// Total slots pushed back because the dispatch pool was saturated.
    pub dispatch_rejections: Counter,
    /// Total executions that were re-rolls for delayed data.
    pub rerolls_executed: Counter,
    /// Slots currently queued.
    pub scheduled_slots: Gauge,
    /// Slots currently running.
    pub running_slots: Gauge,
    /// Shards currently managed.
    pub managed_shards: Gauge,
    /// Shards with work scheduled in the recent window.
    pub recently_scheduled_shards: Gauge,
    /// The scheduler's view of server time, in milliseconds.
    pub server_time_millis: Gauge,
    /// Locators fetched per executed slot.
    pub locators_per_slot: Histogram,

    // === State IO ===
    /// Total shard-state push cycles.
    pub state_pushes: Counter,
    /// Total shard-state pull cycles.
    pub state_pulls: Counter,
    /// Total shard-state IO errors by direction.
    pub state_io_errors: CounterVec,

    // === Locks ===
    /// Shard locks currently held.
    pub locks_held: Gauge,
    /// Shard locks currently in error state.
    pub locks_error: Gauge,
    /// Lock coordinator connectivity (1=connected, 0=not).
    pub lock_service_connected: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics
    /// registered.
    pub fn new(addr: &str) -> Result<HealthMetrics> {
        let registry = Registry::new();

        let slots_scheduled = Counter::with_opts(
            Opts::new(
                "slots_scheduled_total",
                "Total slots queued by the eligibility scan.",
            )
            .namespace("rollupd"),
        )?;
        let slots_dispatched = Counter::with_opts(
            Opts::new(
                "slots_dispatched_total",
                "Total slots dispatched to execution.",
            )
            .namespace("rollupd"),
        )?;
        let slots_rolled = Counter::with_opts(
            Opts::new("slots_rolled_total", "Total slots rolled successfully.")
                .namespace("rollupd"),
        )?;
        let slots_failed = Counter::with_opts(
            Opts::new(
                "slots_failed_total",
                "Total slot executions that failed and were pushed back.",
            )
            .namespace("rollupd"),
        )?;
        let dispatch_rejections = Counter::with_opts(
            Opts::new(
                "dispatch_rejections_total",
                "Total slots pushed back because the dispatch pool was saturated.",
            )
            .namespace("rollupd"),
        )?;
        let rerolls_executed = Counter::with_opts(
            Opts::new(
                "rerolls_executed_total",
                "Total executions that were re-rolls for delayed data.",
            )
            .namespace("rollupd"),
        )?;
        let scheduled_slots = Gauge::with_opts(
            Opts::new("scheduled_slots", "Slots currently queued.").namespace("rollupd"),
        )?;
        let running_slots = Gauge::with_opts(
            Opts::new("running_slots", "Slots currently running.").namespace("rollupd"),
        )?;
        let managed_shards = Gauge::with_opts(
            Opts::new("managed_shards", "Shards currently managed.").namespace("rollupd"),
        )?;
        let recently_scheduled_shards = Gauge::with_opts(
            Opts::new(
                "recently_scheduled_shards",
                "Shards with work scheduled in the recent window.",
            )
            .namespace("rollupd"),
        )?;
        let server_time_millis = Gauge::with_opts(
            Opts::new(
                "server_time_millis",
                "The scheduler's view of server time, in milliseconds.",
            )
            .namespace("rollupd"),
        )?;
        let locators_per_slot = Histogram::with_opts(
            HistogramOpts::new("locators_per_slot", "Locators fetched per executed slot.")
                .namespace("rollupd")
                .buckets(vec![
                    0.0, 10.0, 100.0, 1_000.0, 10_000.0, 100_000.0,
                ]),
        )?;

        let state_pushes = Counter::with_opts(
            Opts::new("state_pushes_total", "Total shard-state push cycles.")
                .namespace("rollupd"),
        )?;
        let state_pulls = Counter::with_opts(
            Opts::new("state_pulls_total", "Total shard-state pull cycles.")
                .namespace("rollupd"),
        )?;
        let state_io_errors = CounterVec::new(
            Opts::new(
                "state_io_errors_total",
                "Total shard-state IO errors by direction.",
            )
            .namespace("rollupd"),
            &["direction"],
        )?;

        let locks_held = Gauge::with_opts(
            Opts::new("locks_held", "Shard locks currently held.").namespace("rollupd"),
        )?;
        let locks_error = Gauge::with_opts(
            Opts::new("locks_error", "Shard locks currently in error state.")
                .namespace("rollupd"),
        )?;
        let lock_service_connected = Gauge::with_opts(
            Opts::new(
                "lock_service_connected",
                "Lock coordinator connectivity (1=connected, 0=not).",
            )
            .namespace("rollupd"),
        )?;

        registry.register(Box::new(slots_scheduled.clone()))?;
        registry.register(Box::new(slots_dispatched.clone()))?;
        registry.register(Box::new(slots_rolled.clone()))?;
        registry.register(Box::new(slots_failed.clone()))?;
        registry.register(Box::new(dispatch_rejections.clone()))?;
        registry.register(Box::new(rerolls_executed.clone()))?;
        registry.register(Box::new(scheduled_slots.clone()))?;
        registry.register(Box::new(running_slots.clone()))?;
        registry.register(Box::new(managed_shards.clone()))?;
        registry.register(Box::new(recently_scheduled_shards.clone()))?;
        registry.register(Box::new(server_time_millis.clone()))?;
        registry.register(Box::new(locators_per_slot.clone()))?;
        registry.register(Box::new(state_pushes.clone()))?;
        registry.register(Box::new(state_pulls.clone()))?;
        registry.register(Box::new(state_io_errors.clone()))?;
        registry.register(Box::new(locks_held.clone()))?;
        registry.register(Box::new(locks_error.clone()))?;
        registry.register(Box::new(lock_service_connected.clone()))?;

        Ok(HealthMetrics {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            slots_scheduled,
            slots_dispatched,
            slots_rolled,
            slots_failed,
            dispatch_rejections,
            rerolls_executed,
            scheduled_slots,
            running_slots,
            managed_shards,
            recently_scheduled_shards,
            server_time_millis,
            locators_per_slot,
            state_pushes,
            state_pulls,
            state_io_errors,
            locks_held,
            locks_error,
            lock_service_connected,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::new(registry));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// The underlying registry, for tests that scrape directly.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// GET /metrics - Prometheus exposition.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
