//! In-process counters for the coordinator's query lifecycle.
//!
//! Counters are lock-free so they can be bumped on every request path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated coordinator counters.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    /// Operations that entered `execute`.
    executions: AtomicU64,
    /// Executions registered in the live map.
    registrations: AtomicU64,
    /// Successful cleanups that removed a registered execution.
    cleanups: AtomicU64,
    /// Execution factories that failed before an execution existed.
    planning_failures: AtomicU64,
    /// Executions whose start failed.
    start_failures: AtomicU64,
    /// Writes flagged for client retry.
    retry_flagged_writes: AtomicU64,
    /// Slow-query records emitted.
    slow_queries: AtomicU64,
    /// Sampled-query records emitted.
    sampled_queries: AtomicU64,
    /// Samples dropped by the sampling rate limiter.
    sampling_suppressed: AtomicU64,
    /// Fragment instances sent to data nodes.
    dispatched_instances: AtomicU64,
    /// Fragment instance sends that ran on the submitting thread.
    caller_run_dispatches: AtomicU64,
    /// Fragment instance sends that failed.
    dispatch_failures: AtomicU64,
    /// Executions failed by their deadline.
    timeouts: AtomicU64,
}

/// Immutable snapshot view of [`CoordinatorMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorMetricsSnapshot {
    pub executions: u64,
    pub registrations: u64,
    pub cleanups: u64,
    pub planning_failures: u64,
    pub start_failures: u64,
    pub retry_flagged_writes: u64,
    pub slow_queries: u64,
    pub sampled_queries: u64,
    pub sampling_suppressed: u64,
    pub dispatched_instances: u64,
    pub caller_run_dispatches: u64,
    pub dispatch_failures: u64,
    pub timeouts: u64,
}

impl CoordinatorMetrics {
    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_planning_failure(&self) {
        self.planning_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_start_failure(&self) {
        self.start_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_flagged_write(&self) {
        self.retry_flagged_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_query(&self) {
        self.slow_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sampled_query(&self) {
        self.sampled_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sampling_suppressed(&self) {
        self.sampling_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched_instances(&self, count: u64) {
        self.dispatched_instances.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_caller_run_dispatch(&self) {
        self.caller_run_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> CoordinatorMetricsSnapshot {
        CoordinatorMetricsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            planning_failures: self.planning_failures.load(Ordering::Relaxed),
            start_failures: self.start_failures.load(Ordering::Relaxed),
            retry_flagged_writes: self.retry_flagged_writes.load(Ordering::Relaxed),
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
            sampled_queries: self.sampled_queries.load(Ordering::Relaxed),
            sampling_suppressed: self.sampling_suppressed.load(Ordering::Relaxed),
            dispatched_instances: self.dispatched_instances.load(Ordering::Relaxed),
            caller_run_dispatches: self.caller_run_dispatches.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Renders counters as `key=value` lines.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "coordinator_executions={}\ncoordinator_registrations={}\ncoordinator_cleanups={}\ncoordinator_planning_failures={}\ncoordinator_start_failures={}\ncoordinator_retry_flagged_writes={}\ncoordinator_slow_queries={}\ncoordinator_sampled_queries={}\ncoordinator_sampling_suppressed={}\ncoordinator_dispatched_instances={}\ncoordinator_caller_run_dispatches={}\ncoordinator_dispatch_failures={}\ncoordinator_timeouts={}\n",
            s.executions,
            s.registrations,
            s.cleanups,
            s.planning_failures,
            s.start_failures,
            s.retry_flagged_writes,
            s.slow_queries,
            s.sampled_queries,
            s.sampling_suppressed,
            s.dispatched_instances,
            s.caller_run_dispatches,
            s.dispatch_failures,
            s.timeouts,
        )
    }
}
