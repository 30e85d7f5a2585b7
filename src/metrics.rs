//! Orchestration Metrics
//!
//! Lock-free counters for plan construction and execution. Shared as an
//! `Arc` across every plan run in the process.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::agent::tools::{DispatchError, DispatchOutcome};

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub dispatches: u64,
    pub dispatch_failures: u64,
    pub dispatch_timeouts: u64,
    pub cache_hits: u64,
    pub proposals: u64,
    pub plans_built: u64,
    pub plan_build_failures: u64,
    pub step_attempts: u64,
    pub step_retries: u64,
    pub plan_retries: u64,
    pub degraded_analyses: u64,
    pub plans_executed: u64,
    pub plans_failed: u64,
    pub plans_cancelled: u64,
}

impl MetricsSnapshot {
    /// One-line summary for logs
    pub fn format(&self) -> String {
        format!(
            "plans {} built / {} executed ({} failed, {} cancelled), {} dispatches ({} failed, {} cached), {} retries, {} degraded analyses",
            self.plans_built,
            self.plans_executed,
            self.plans_failed,
            self.plans_cancelled,
            self.dispatches,
            self.dispatch_failures,
            self.cache_hits,
            self.step_retries + self.plan_retries,
            self.degraded_analyses
        )
    }
}

/// Counters shared by dispatcher, planner and executors
#[derive(Debug, Default)]
pub struct OrchestrationMetrics {
    dispatches: AtomicU64,
    dispatch_failures: AtomicU64,
    dispatch_timeouts: AtomicU64,
    cache_hits: AtomicU64,
    proposals: AtomicU64,
    plans_built: AtomicU64,
    plan_build_failures: AtomicU64,
    step_attempts: AtomicU64,
    step_retries: AtomicU64,
    plan_retries: AtomicU64,
    degraded_analyses: AtomicU64,
    plans_executed: AtomicU64,
    plans_failed: AtomicU64,
    plans_cancelled: AtomicU64,
}

impl OrchestrationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatch(&self, outcome: &DispatchOutcome) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(_) => {}
            Err(DispatchError::Timeout { .. }) => {
                self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                self.dispatch_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proposal(&self) {
        self.proposals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plan_built(&self, ok: bool) {
        if ok {
            self.plans_built.fetch_add(1, Ordering::Relaxed);
        } else {
            self.plan_build_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_step_attempt(&self) {
        self.step_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step_retry(&self) {
        self.step_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plan_retry(&self) {
        self.plan_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_analysis(&self) {
        self.degraded_analyses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self, failed: bool, cancelled: bool) {
        self.plans_executed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.plans_failed.fetch_add(1, Ordering::Relaxed);
        }
        if cancelled {
            self.plans_cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            dispatch_timeouts: self.dispatch_timeouts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            proposals: self.proposals.load(Ordering::Relaxed),
            plans_built: self.plans_built.load(Ordering::Relaxed),
            plan_build_failures: self.plan_build_failures.load(Ordering::Relaxed),
            step_attempts: self.step_attempts.load(Ordering::Relaxed),
            step_retries: self.step_retries.load(Ordering::Relaxed),
            plan_retries: self.plan_retries.load(Ordering::Relaxed),
            degraded_analyses: self.degraded_analyses.load(Ordering::Relaxed),
            plans_executed: self.plans_executed.load(Ordering::Relaxed),
            plans_failed: self.plans_failed.load(Ordering::Relaxed),
            plans_cancelled: self.plans_cancelled.load(Ordering::Relaxed),
        }
    }

    /// Log the current counters
    pub fn log_summary(&self) {
        info!("Metrics: {}", self.snapshot().format());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_counters() {
        let metrics = OrchestrationMetrics::new();
        metrics.record_dispatch(&Ok(json!(1)));
        metrics.record_dispatch(&Err(DispatchError::Timeout {
            tool_id: "5".into(),
            timeout_ms: 10,
        }));
        metrics.record_dispatch(&Err(DispatchError::UnknownTool { tool_id: "x".into() }));

        let snap = metrics.snapshot();
        assert_eq!(snap.dispatches, 3);
        assert_eq!(snap.dispatch_failures, 2);
        assert_eq!(snap.dispatch_timeouts, 1);
    }

    #[test]
    fn test_snapshot_format() {
        let metrics = OrchestrationMetrics::new();
        metrics.record_plan_built(true);
        metrics.record_execution(true, false);
        metrics.record_step_retry();
        let formatted = metrics.snapshot().format();
        assert!(formatted.contains("plans 1 built / 1 executed (1 failed, 0 cancelled)"));
        assert!(formatted.contains("1 retries"));
    }
}
