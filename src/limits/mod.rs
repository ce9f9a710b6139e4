//! Execution limits: resource ceilings that protect against a malformed or
//! runaway plan, loaded from environment variables with a default
//! parallelism bound of `min(num_cpus, 16)`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// CLI-selectable starting point for `ExecutionLimits`, applied before
/// `SHELLFORGE_MAX_*` env vars override individual fields on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LimitsPreset {
    Strict,
    Default,
    Relaxed,
}

impl LimitsPreset {
    pub fn base(self) -> ExecutionLimits {
        match self {
            LimitsPreset::Strict => ExecutionLimits::strict(),
            LimitsPreset::Default => ExecutionLimits::default(),
            LimitsPreset::Relaxed => ExecutionLimits::relaxed(),
        }
    }
}

pub const DEFAULT_MAX_STEPS: usize = 100;
pub const DEFAULT_MAX_RETRIES_TOTAL: u32 = 50;
pub const DEFAULT_MAX_EXECUTION_SECS: u64 = 300;
pub const DEFAULT_MAX_STEP_TIMEOUT_SECS: u64 = 30;
pub const ABSOLUTE_MAX_PARALLEL: usize = 16;

pub fn default_max_parallel() -> usize {
    num_cpus::get().min(ABSOLUTE_MAX_PARALLEL).max(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub max_steps: usize,
    pub max_parallel: usize,
    pub max_retries_total: u32,
    pub max_execution_time: Duration,
    pub max_step_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_parallel: default_max_parallel(),
            max_retries_total: DEFAULT_MAX_RETRIES_TOTAL,
            max_execution_time: Duration::from_secs(DEFAULT_MAX_EXECUTION_SECS),
            max_step_timeout: Duration::from_secs(DEFAULT_MAX_STEP_TIMEOUT_SECS),
        }
    }
}

impl ExecutionLimits {
    /// Applies `SHELLFORGE_MAX_*` overrides on top of `self`, e.g. a preset
    /// chosen via `LimitsPreset`.
    pub fn merged_with_env(self) -> Self {
        let mut limits = self;

        if let Ok(val) = std::env::var("SHELLFORGE_MAX_STEPS") {
            if let Ok(n) = val.parse() {
                limits.max_steps = n;
            }
        }
        if let Ok(val) = std::env::var("SHELLFORGE_MAX_PARALLEL") {
            if let Ok(n) = val.parse() {
                limits.max_parallel = n;
            }
        }
        if let Ok(val) = std::env::var("SHELLFORGE_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                limits.max_retries_total = n;
            }
        }
        if let Ok(val) = std::env::var("SHELLFORGE_MAX_EXECUTION_SECS") {
            if let Ok(n) = val.parse() {
                limits.max_execution_time = Duration::from_secs(n);
            }
        }
        if let Ok(val) = std::env::var("SHELLFORGE_MAX_STEP_TIMEOUT") {
            if let Ok(n) = val.parse() {
                limits.max_step_timeout = Duration::from_secs(n);
            }
        }

        limits
    }

    pub fn strict() -> Self {
        Self {
            max_steps: 10,
            max_parallel: 2,
            max_retries_total: 5,
            max_execution_time: Duration::from_secs(30),
            max_step_timeout: Duration::from_secs(5),
        }
    }

    pub fn relaxed() -> Self {
        Self {
            max_steps: 500,
            max_parallel: ABSOLUTE_MAX_PARALLEL,
            max_retries_total: 200,
            max_execution_time: Duration::from_secs(3600),
            max_step_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
pub struct LimitValidationResult {
    pub passed: bool,
    pub violations: Vec<LimitViolation>,
}

#[derive(Debug, Clone)]
pub struct LimitViolation {
    pub limit_name: String,
    pub limit_value: String,
    pub actual_value: String,
    pub message: String,
}

pub fn validate_limits(step_count: usize, total_retries: u32, limits: &ExecutionLimits) -> LimitValidationResult {
    let mut violations = Vec::new();

    if step_count > limits.max_steps {
        violations.push(LimitViolation {
            limit_name: "max_steps".to_string(),
            limit_value: limits.max_steps.to_string(),
            actual_value: step_count.to_string(),
            message: format!("plan has {step_count} steps, maximum allowed is {}", limits.max_steps),
        });
    }

    if total_retries > limits.max_retries_total {
        violations.push(LimitViolation {
            limit_name: "max_retries_total".to_string(),
            limit_value: limits.max_retries_total.to_string(),
            actual_value: total_retries.to_string(),
            message: format!(
                "plan can retry up to {total_retries} times, maximum allowed is {}",
                limits.max_retries_total
            ),
        });
    }

    LimitValidationResult {
        passed: violations.is_empty(),
        violations,
    }
}

/// Runtime retry counter used to abort if a workflow's total retries
/// exceed its configured limit mid-execution.
#[derive(Debug, Default)]
pub struct RetryCounter {
    count: std::sync::atomic::AtomicU32,
    limit: u32,
}

impl RetryCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            count: std::sync::atomic::AtomicU32::new(0),
            limit,
        }
    }

    pub fn try_increment(&self) -> bool {
        let current = self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        current < self.limit
    }

    pub fn current(&self) -> u32 {
        self.count.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_use_cpu_bounded_parallelism() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.max_steps, 100);
        assert!(limits.max_parallel >= 1 && limits.max_parallel <= ABSOLUTE_MAX_PARALLEL);
    }

    #[test]
    fn strict_limits_are_tighter() {
        let limits = ExecutionLimits::strict();
        assert_eq!(limits.max_steps, 10);
        assert_eq!(limits.max_parallel, 2);
    }

    #[test]
    fn validate_limits_passes_within_bounds() {
        let limits = ExecutionLimits::default();
        let result = validate_limits(50, 20, &limits);
        assert!(result.passed);
    }

    #[test]
    fn validate_limits_flags_step_count() {
        let limits = ExecutionLimits::default();
        let result = validate_limits(150, 20, &limits);
        assert!(!result.passed);
        assert_eq!(result.violations[0].limit_name, "max_steps");
    }

    #[test]
    fn validate_limits_flags_retry_count() {
        let limits = ExecutionLimits::default();
        let result = validate_limits(10, 100, &limits);
        assert!(!result.passed);
        assert_eq!(result.violations[0].limit_name, "max_retries_total");
    }

    #[test]
    fn retry_counter_stops_at_limit() {
        let counter = RetryCounter::new(3);
        assert!(counter.try_increment());
        assert!(counter.try_increment());
        assert!(counter.try_increment());
        assert!(!counter.try_increment());
        assert_eq!(counter.current(), 4);
    }
}
