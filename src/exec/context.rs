use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Completion accounting for one slot's execution: outstanding reads,
/// outstanding writes, and the first error encountered.
///
/// Created fresh per scheduled slot, discarded when the slot's work
/// finishes. The drain loop waits on both counters reaching zero; an
/// unsuccessful context sends the whole slot back for retry.
#[derive(Debug, Default)]
pub struct RollupExecutionContext {
    reads: AtomicUsize,
    writes: AtomicUsize,
    unsuccessful: AtomicBool,
    first_error: Mutex<Option<String>>,
}

impl RollupExecutionContext {
    pub fn new() -> RollupExecutionContext {
        RollupExecutionContext::default()
    }

    pub fn increment_read_counter(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_read_counter(&self) {
        self.reads.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn increment_write_counter(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_write_counter_by(&self, count: usize) {
        self.writes.fetch_sub(count, Ordering::SeqCst);
    }

    pub fn done_reading(&self) -> bool {
        self.reads.load(Ordering::SeqCst) == 0
    }

    pub fn done_writing(&self) -> bool {
        self.writes.load(Ordering::SeqCst) == 0
    }

    /// Latches the failure flag, keeping the first error for the slot's
    /// failure report.
    pub fn mark_unsuccessful(&self, error: &anyhow::Error) {
        self.unsuccessful.store(true, Ordering::SeqCst);
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(format!("{error:#}"));
        }
    }

    pub fn was_successful(&self) -> bool {
        !self.unsuccessful.load(Ordering::SeqCst)
    }

    pub fn first_error(&self) -> Option<String> {
        self.first_error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_read_accounting() {
        let ctx = RollupExecutionContext::new();
        assert!(ctx.done_reading());

        ctx.increment_read_counter();
        ctx.increment_read_counter();
        assert!(!ctx.done_reading());

        ctx.decrement_read_counter();
        assert!(!ctx.done_reading());
        ctx.decrement_read_counter();
        assert!(ctx.done_reading());
    }

    #[test]
    fn test_write_accounting_batch_decrement() {
        let ctx = RollupExecutionContext::new();
        for _ in 0..5 {
            ctx.increment_write_counter();
        }
        assert!(!ctx.done_writing());
        ctx.decrement_write_counter_by(5);
        assert!(ctx.done_writing());
    }

    #[test]
    fn test_first_error_is_kept() {
        let ctx = RollupExecutionContext::new();
        assert!(ctx.was_successful());

        ctx.mark_unsuccessful(&anyhow!("read failed"));
        ctx.mark_unsuccessful(&anyhow!("write failed"));

        assert!(!ctx.was_successful());
        assert_eq!(ctx.first_error().as_deref(), Some("read failed"));
    }
}
