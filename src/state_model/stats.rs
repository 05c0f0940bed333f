use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

pub const METRIC_THREADS_BLOCKED_ON_DROP: &str = "hadron_ingest_threads_blocked_on_offline_to_dropped";
pub const METRIC_TRANSITIONS: &str = "hadron_ingest_partition_transitions";
pub const METRIC_TRANSITION_FAILURES: &str = "hadron_ingest_partition_transition_failures";

/// Statistics on partition transitions.
#[derive(Default)]
pub struct TransitionStats {
    blocked_on_drop: AtomicI64,
    blocked_on_drop_entries: AtomicU64,
    transitions: AtomicU64,
    failures: AtomicU64,
}

impl TransitionStats {
    /// Create a new instance.
    pub fn new() -> Arc<Self> {
        metrics::register_gauge!(METRIC_THREADS_BLOCKED_ON_DROP, metrics::Unit::Count, "transitions currently blocked waiting for a current version partition to stop");
        metrics::register_counter!(METRIC_TRANSITIONS, metrics::Unit::Count, "partition transitions executed");
        metrics::register_counter!(METRIC_TRANSITION_FAILURES, metrics::Unit::Count, "partition transitions which failed");
        Arc::new(Self::default())
    }

    /// Count the caller as blocked on a drop until the returned guard is dropped.
    pub fn block_on_drop(&self) -> BlockedOnDropGuard<'_> {
        self.blocked_on_drop.fetch_add(1, Ordering::SeqCst);
        self.blocked_on_drop_entries.fetch_add(1, Ordering::SeqCst);
        metrics::increment_gauge!(METRIC_THREADS_BLOCKED_ON_DROP, 1.0);
        BlockedOnDropGuard(self)
    }

    /// The number of transitions currently blocked on a drop.
    pub fn blocked_on_drop(&self) -> i64 {
        self.blocked_on_drop.load(Ordering::SeqCst)
    }

    /// The total number of times a transition has blocked on a drop.
    pub fn blocked_on_drop_entries(&self) -> u64 {
        self.blocked_on_drop_entries.load(Ordering::SeqCst)
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(super) fn record_transition(&self, succeeded: bool) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!(METRIC_TRANSITIONS);
        if !succeeded {
            self.failures.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!(METRIC_TRANSITION_FAILURES);
        }
    }
}

/// Decrements the blocked-on-drop gauge when dropped.
pub struct BlockedOnDropGuard<'a>(&'a TransitionStats);

impl Drop for BlockedOnDropGuard<'_> {
    fn drop(&mut self) {
        self.0.blocked_on_drop.fetch_sub(1, Ordering::SeqCst);
        metrics::decrement_gauge!(METRIC_THREADS_BLOCKED_ON_DROP, 1.0);
    }
}
