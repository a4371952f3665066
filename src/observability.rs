use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Orchestration counters shared by every saga and workflow in the process
#[derive(Debug, Default)]
pub struct OrchestrationMetrics {
    pub sagas_started: AtomicU64,
    pub sagas_completed: AtomicU64,
    pub sagas_compensated: AtomicU64,
    pub compensation_failures: AtomicU64,
    pub workflows_completed: AtomicU64,
    pub workflows_failed: AtomicU64,
    pub transient_retries: AtomicU64,
    pub memoized_replays: AtomicU64,
    pub progress_published: AtomicU64,
    pub progress_dropped: AtomicU64,
    pub stale_rejections: AtomicU64,
}

impl OrchestrationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_saga_started(&self) {
        self.sagas_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_completed(&self) {
        self.sagas_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_compensated(&self) {
        self.sagas_compensated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compensation_failure(&self) {
        self.compensation_failures.fetch_add(1, Ordering::Relaxed);
        warn!("Compensation action failed");
    }

    pub fn record_workflow_completed(&self) {
        self.workflows_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_workflow_failed(&self) {
        self.workflows_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_retry(&self) {
        self.transient_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memoized_replay(&self) {
        self.memoized_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_progress_published(&self) {
        self.progress_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_progress_dropped(&self) {
        self.progress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_rejection(&self) {
        self.stale_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> OrchestrationStats {
        OrchestrationStats {
            sagas_started: self.sagas_started.load(Ordering::Relaxed),
            sagas_completed: self.sagas_completed.load(Ordering::Relaxed),
            sagas_compensated: self.sagas_compensated.load(Ordering::Relaxed),
            compensation_failures: self.compensation_failures.load(Ordering::Relaxed),
            workflows_completed: self.workflows_completed.load(Ordering::Relaxed),
            workflows_failed: self.workflows_failed.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            memoized_replays: self.memoized_replays.load(Ordering::Relaxed),
            progress_published: self.progress_published.load(Ordering::Relaxed),
            progress_dropped: self.progress_dropped.load(Ordering::Relaxed),
            stale_rejections: self.stale_rejections.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            sagas_started = stats.sagas_started,
            sagas_completed = stats.sagas_completed,
            sagas_compensated = stats.sagas_compensated,
            compensation_failures = stats.compensation_failures,
            workflows_completed = stats.workflows_completed,
            workflows_failed = stats.workflows_failed,
            transient_retries = stats.transient_retries,
            memoized_replays = stats.memoized_replays,
            progress_published = stats.progress_published,
            progress_dropped = stats.progress_dropped,
            stale_rejections = stats.stale_rejections,
            "Orchestration metrics"
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestrationStats {
    pub sagas_started: u64,
    pub sagas_completed: u64,
    pub sagas_compensated: u64,
    pub compensation_failures: u64,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    pub transient_retries: u64,
    pub memoized_replays: u64,
    pub progress_published: u64,
    pub progress_dropped: u64,
    pub stale_rejections: u64,
}

/// Global metrics instance
static ORCHESTRATION_METRICS: std::sync::LazyLock<OrchestrationMetrics> =
    std::sync::LazyLock::new(OrchestrationMetrics::new);

pub fn orchestration_metrics() -> &'static OrchestrationMetrics {
    &ORCHESTRATION_METRICS
}

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent() {
        let metrics = OrchestrationMetrics::new();
        metrics.record_saga_started();
        metrics.record_saga_started();
        metrics.record_saga_compensated();
        metrics.record_stale_rejection();

        let stats = metrics.get_stats();
        assert_eq!(stats.sagas_started, 2);
        assert_eq!(stats.sagas_compensated, 1);
        assert_eq!(stats.stale_rejections, 1);
        assert_eq!(stats.workflows_completed, 0);
    }
}
