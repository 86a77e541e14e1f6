//! Promise outcomes
//!
//! Every actuator invocation folds down to a single `PromiseResult`.
//! Results merge by severity; the variant order below is the severity
//! order, least severe first, so `max` is the merge operator.

use serde::{Deserialize, Serialize};

/// Outcome of one promise evaluation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PromiseResult {
    /// Not attempted (lock held, guard false at the skip level).
    Skipped,
    /// Already converged, nothing to do.
    Noop,
    /// State was changed to converge.
    Change,
    /// A change was needed but only a warning was promised.
    Warn,
    /// The promise could not be tried (validation failure, cancellation).
    Interrupted,
    /// Access was denied.
    Denied,
    /// The attempt failed.
    Fail,
}

impl PromiseResult {
    /// Merge two outcomes, keeping the more severe.
    pub fn merge(self, other: PromiseResult) -> PromiseResult {
        self.max(other)
    }

    /// Merge an outcome into an accumulator in place.
    pub fn update(&mut self, other: PromiseResult) {
        *self = self.merge(other);
    }

    /// Process exit code mapping: success for kept and repaired promises,
    /// 1 for failures and denials, 2 for anything interrupted.
    pub fn exit_code(&self) -> i32 {
        match self {
            PromiseResult::Skipped | PromiseResult::Noop | PromiseResult::Change => 0,
            PromiseResult::Warn => 0,
            PromiseResult::Fail | PromiseResult::Denied => 1,
            PromiseResult::Interrupted => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PromiseResult::Skipped => "skipped",
            PromiseResult::Noop => "kept",
            PromiseResult::Change => "repaired",
            PromiseResult::Warn => "warned",
            PromiseResult::Interrupted => "interrupted",
            PromiseResult::Denied => "denied",
            PromiseResult::Fail => "failed",
        }
    }
}

impl std::fmt::Display for PromiseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
