//! Retry policy
//!
//! Two retry loops exist and they are bounded separately:
//! - in-step retries, driven by an insufficient analysis, paced by [`RetryPolicy`]
//! - plan-level retries (`next_action = retry`), counted per step index by [`PlanRetryBudget`]
//!
//! Dispatch failures never retry; they abort the plan.

use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Default attempts per step run
pub const MAX_RETRIES: u32 = 3;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum dispatch attempts for one step run (first try included)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 - 1.0), zero disables jitter
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Retry without waiting
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter_factor > 0.0 && capped > 0.0 {
            let jitter = capped * self.jitter_factor * rand::thread_rng().gen_range(-1.0..=1.0);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based)
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Per-step-index allowance for plan-level retries
#[derive(Debug, Clone)]
pub struct PlanRetryBudget {
    max_per_step: u32,
    used: HashMap<usize, u32>,
}

impl PlanRetryBudget {
    pub fn new(max_per_step: u32) -> Self {
        Self {
            max_per_step,
            used: HashMap::new(),
        }
    }

    /// Consume one retry for `index`; false once the allowance is spent
    pub fn try_consume(&mut self, index: usize) -> bool {
        let used = self.used.entry(index).or_insert(0);
        if *used >= self.max_per_step {
            debug!("Plan retry budget exhausted for step index {}", index);
            return false;
        }
        *used += 1;
        true
    }

    pub fn used(&self, index: usize) -> u32 {
        self.used.get(&index).copied().unwrap_or(0)
    }
}
