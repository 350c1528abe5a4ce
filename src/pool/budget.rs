//! Session-wide ceiling on StageExecutor invocations.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

/// Snapshot of budget usage for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetUsage {
    pub used: u64,
    pub ceiling: u64,
    pub remaining: u64,
    pub fraction: f64,
}

/// Lock-free invocation counter shared by every worker of a run.
#[derive(Debug)]
pub struct InvocationBudget {
    ceiling: u64,
    warning_threshold: f64,
    used: AtomicU64,
    warned: AtomicBool,
}

impl InvocationBudget {
    #[must_use]
    pub const fn new(ceiling: u64, warning_threshold: f64) -> Self {
        Self {
            ceiling,
            warning_threshold,
            used: AtomicU64::new(0),
            warned: AtomicBool::new(false),
        }
    }

    /// Charges one invocation. Returns `false`, charging nothing, once the
    /// ceiling is reached.
    pub fn try_consume(&self) -> bool {
        let charged = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.ceiling).then_some(used + 1)
            })
            .is_ok();
        if charged {
            self.warn_if_near_ceiling();
        }
        charged
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.used() >= self.ceiling
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn usage(&self) -> BudgetUsage {
        let used = self.used();
        BudgetUsage {
            used,
            ceiling: self.ceiling,
            remaining: self.ceiling.saturating_sub(used),
            fraction: fraction(used, self.ceiling),
        }
    }

    fn warn_if_near_ceiling(&self) {
        let usage = self.usage();
        if usage.fraction >= self.warning_threshold && !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                used = usage.used,
                ceiling = usage.ceiling,
                "Invocation budget past warning threshold"
            );
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn fraction(used: u64, ceiling: u64) -> f64 {
    if ceiling == 0 {
        1.0
    } else {
        used as f64 / ceiling as f64
    }
}
