//! Per-stage refinement budgets and the retry/advance/terminate policy.

use crate::{FailureKind, FailureReason, Outcome, OutcomeClass};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Budget for one (run, stage) pair. `0 <= used <= ceiling` always holds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(from = "CounterState", into = "CounterState")]
pub struct RefinementCounter {
    used: AtomicU32,
    ceiling: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub used: u32,
    pub ceiling: u32,
}

impl RefinementCounter {
    pub fn new(ceiling: u32) -> Self {
        Self {
            used: AtomicU32::new(0),
            ceiling,
        }
    }

    /// Spends one unit; false once the ceiling is reached.
    pub fn try_consume(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.ceiling).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn remaining(&self) -> u32 {
        self.ceiling.saturating_sub(self.used())
    }

    pub fn state(&self) -> CounterState {
        CounterState {
            used: self.used(),
            ceiling: self.ceiling,
        }
    }
}

impl Clone for RefinementCounter {
    fn clone(&self) -> Self {
        Self::from(self.state())
    }
}

impl From<CounterState> for RefinementCounter {
    fn from(state: CounterState) -> Self {
        Self {
            used: AtomicU32::new(state.used.min(state.ceiling)),
            ceiling: state.ceiling,
        }
    }
}

impl From<RefinementCounter> for CounterState {
    fn from(counter: RefinementCounter) -> Self {
        counter.state()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Advance,
    Terminate(FailureReason),
}

/// Stateless policy over a [`RefinementCounter`]. Every retryable failure
/// costs one unit regardless of its cause; non-retryable failures end the
/// run without touching the budget.
#[derive(Clone, Copy, Debug, Default)]
pub struct RefinementController;

impl RefinementController {
    pub fn should_retry(
        &self,
        stage: &str,
        counter: &RefinementCounter,
        outcome: &Outcome,
    ) -> RetryDecision {
        if outcome.class != OutcomeClass::Fail {
            return RetryDecision::Advance;
        }

        let kind = outcome.failure_kind().unwrap_or(FailureKind::RoleFailure);
        if !kind.is_retryable() {
            return RetryDecision::Terminate(
                FailureReason::new(kind, outcome.failure_message()).at_stage(stage),
            );
        }

        if counter.try_consume() {
            RetryDecision::Retry
        } else {
            RetryDecision::Terminate(self.exhausted(stage, counter, Some(outcome)))
        }
    }

    /// Charges a stage being dispatched again by a remediation loop rather
    /// than by its own failure. `prior_attempts` counts attempts already
    /// recorded for the stage.
    pub fn admit_reentry(
        &self,
        stage: &str,
        counter: &RefinementCounter,
        prior_attempts: u32,
    ) -> Result<(), FailureReason> {
        if prior_attempts == 0 || prior_attempts <= counter.used() {
            return Ok(());
        }
        if counter.try_consume() {
            Ok(())
        } else {
            Err(self.exhausted(stage, counter, None))
        }
    }

    fn exhausted(
        &self,
        stage: &str,
        counter: &RefinementCounter,
        last: Option<&Outcome>,
    ) -> FailureReason {
        let mut message = format!(
            "exhausted retries after {} attempt(s) (ceiling {})",
            counter.ceiling() + 1,
            counter.ceiling()
        );
        if let Some(outcome) = last {
            message.push_str(&format!("; last failure: {}", outcome.failure_message()));
        }
        FailureReason::new(FailureKind::ExhaustedRetries, message).at_stage(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn should_retry_pass_and_needs_input_expected_advance_without_spending() {
        let counter = RefinementCounter::new(1);
        let controller = RefinementController;
        assert_eq!(
            controller.should_retry("dev", &counter, &Outcome::pass(json!({}))),
            RetryDecision::Advance
        );
        assert_eq!(
            controller.should_retry("dev", &counter, &Outcome::needs_input(json!("?"), json!(null))),
            RetryDecision::Advance
        );
        assert_eq!(counter.used(), 0);
    }

    #[test]
    fn should_retry_different_failures_expected_shared_budget() {
        let counter = RefinementCounter::new(2);
        let controller = RefinementController;
        let first = Outcome::role_failure("test_a failed", json!({}));
        let second = Outcome::fail(FailureKind::Timeout, "stage timed out", json!({}));
        let third = Outcome::fail(FailureKind::Infrastructure, "sandbox died", json!({}));

        assert_eq!(controller.should_retry("t", &counter, &first), RetryDecision::Retry);
        assert_eq!(controller.should_retry("t", &counter, &second), RetryDecision::Retry);
        let RetryDecision::Terminate(reason) = controller.should_retry("t", &counter, &third) else {
            panic!("third failure should terminate");
        };
        assert_eq!(reason.kind, FailureKind::ExhaustedRetries);
        assert!(reason.message.contains("exhausted retries"));
        assert_eq!(counter.used(), 2);
    }

    #[test]
    fn should_retry_policy_rejection_expected_terminate_with_budget_untouched() {
        let counter = RefinementCounter::new(5);
        let decision = RefinementController.should_retry(
            "security",
            &counter,
            &Outcome::policy_rejection("hard-coded credential", json!({})),
        );
        let RetryDecision::Terminate(reason) = decision else {
            panic!("policy rejection should terminate");
        };
        assert_eq!(reason.kind, FailureKind::PolicyRejection);
        assert_eq!(reason.stage.as_deref(), Some("security"));
        assert_eq!(counter.remaining(), 5);
    }

    #[test]
    fn admit_reentry_after_budget_spent_expected_exhausted() {
        let counter = RefinementCounter::new(1);
        let controller = RefinementController;
        assert!(controller.admit_reentry("dev", &counter, 0).is_ok());
        assert!(controller.admit_reentry("dev", &counter, 1).is_ok());
        assert_eq!(counter.used(), 1);
        // Already charged for this attempt by its own failure.
        assert!(controller.admit_reentry("dev", &counter, 1).is_ok());
        let reason = controller
            .admit_reentry("dev", &counter, 2)
            .expect_err("budget should be spent");
        assert_eq!(reason.kind, FailureKind::ExhaustedRetries);
    }

    #[test]
    fn try_consume_concurrent_callers_expected_never_exceeds_ceiling() {
        let counter = Arc::new(RefinementCounter::new(8));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || (0..4).filter(|_| counter.try_consume()).count())
            })
            .collect();
        let granted: usize = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread should finish"))
            .sum();
        assert_eq!(granted, 8);
        assert_eq!(counter.used(), 8);
    }

    #[test]
    fn counter_serde_expected_state_shape() {
        let counter = RefinementCounter::new(3);
        assert!(counter.try_consume());
        let value = serde_json::to_value(counter.clone()).expect("serialize");
        assert_eq!(value, json!({"used": 1, "ceiling": 3}));
    }
}
