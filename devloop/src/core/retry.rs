//! Iteration budget accounting and reconnection backoff.
//!
//! The soft budget counts ordinary iterations; CLARIFY iterations are free
//! against it but still count toward the hard ceiling. Nothing, operator
//! overrides included, runs past the ceiling.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::decision::{BudgetState, DecisionOutcome};
use crate::core::types::{Decision, DecisionRule};
use crate::task::{Granularity, TaskMetrics};

/// Default soft budgets per granularity (`[budgets]` config section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GranularityBudgets {
    pub atomic: u32,
    pub deliverable: u32,
    pub feature_group: u32,
}

impl Default for GranularityBudgets {
    fn default() -> Self {
        Self {
            atomic: 3,
            deliverable: 5,
            feature_group: 8,
        }
    }
}

impl GranularityBudgets {
    pub fn for_granularity(&self, granularity: Granularity) -> u32 {
        match granularity {
            Granularity::Atomic => self.atomic,
            Granularity::Deliverable => self.deliverable,
            Granularity::FeatureGroup => self.feature_group,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    pub soft: u32,
    pub ceiling: u32,
}

impl IterationBudget {
    pub fn new(soft: u32, ceiling_multiplier: u32) -> Self {
        let soft = soft.max(1);
        Self {
            soft,
            ceiling: soft.saturating_mul(ceiling_multiplier.max(1)),
        }
    }

    /// Resolve the soft budget: call argument, then task override, then granularity default.
    pub fn resolve(
        call: Option<u32>,
        task: Option<u32>,
        granularity: Granularity,
        defaults: &GranularityBudgets,
        ceiling_multiplier: u32,
    ) -> Self {
        let soft = call
            .or(task)
            .unwrap_or_else(|| defaults.for_granularity(granularity));
        Self::new(soft, ceiling_multiplier)
    }
}

#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    budget: IterationBudget,
    max_clarifications: u32,
    total: u32,
    counted: u32,
    clarifications: u32,
    clarifying: bool,
}

impl RetryCoordinator {
    pub fn new(budget: IterationBudget, max_clarifications: u32) -> Self {
        Self {
            budget,
            max_clarifications,
            total: 0,
            counted: 0,
            clarifications: 0,
            clarifying: false,
        }
    }

    /// Continue accounting from a paused run's persisted metrics.
    pub fn resume(budget: IterationBudget, max_clarifications: u32, metrics: &TaskMetrics) -> Self {
        Self {
            total: metrics.iterations,
            counted: metrics.counted_iterations,
            clarifications: metrics.clarifications,
            clarifying: metrics.clarifying,
            ..Self::new(budget, max_clarifications)
        }
    }

    pub fn budget(&self) -> IterationBudget {
        self.budget
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn counted(&self) -> u32 {
        self.counted
    }

    pub fn clarifications(&self) -> u32 {
        self.clarifications
    }

    /// Whether the next iteration follows a CLARIFY decision.
    pub fn clarifying(&self) -> bool {
        self.clarifying
    }

    /// Charge the next iteration and return its index, or `None` at the ceiling.
    pub fn begin_iteration(&mut self) -> Option<u32> {
        if self.total >= self.budget.ceiling {
            return None;
        }
        self.total += 1;
        if !self.clarifying {
            self.counted += 1;
        }
        Some(self.total)
    }

    /// Whether another ordinary iteration fits the soft budget.
    pub fn soft_exhausted(&self) -> bool {
        self.counted >= self.budget.soft
    }

    pub fn state(&self) -> BudgetState {
        BudgetState {
            soft_exhausted: self.soft_exhausted(),
            ceiling_reached: self.total >= self.budget.ceiling,
            clarifications_left: self.clarifications < self.max_clarifications,
        }
    }

    /// Clamp a decision to what the budget allows.
    ///
    /// Continuing at the ceiling becomes an escalation with the outcome left for
    /// the caller to grade; a CLARIFY with no allowance left becomes a RETRY.
    pub fn enforce(&self, outcome: DecisionOutcome) -> DecisionOutcome {
        let state = self.state();
        match outcome.decision {
            Decision::Retry | Decision::Clarify if state.ceiling_reached => {
                debug!(total = self.total, ceiling = self.budget.ceiling, "ceiling reached");
                DecisionOutcome::new(Decision::Escalate, DecisionRule::CeilingReached, None)
            }
            Decision::Clarify if !state.clarifications_left => DecisionOutcome {
                decision: Decision::Retry,
                ..outcome
            },
            _ => outcome,
        }
    }

    /// Apply the final decision of an iteration.
    pub fn record(&mut self, decision: Decision) {
        self.clarifying = decision == Decision::Clarify;
        if self.clarifying {
            self.clarifications += 1;
        }
    }

    pub fn write_metrics(&self, metrics: &mut TaskMetrics) {
        metrics.iterations = self.total;
        metrics.counted_iterations = self.counted;
        metrics.clarifications = self.clarifications;
        metrics.clarifying = self.clarifying;
    }
}

/// Exponential backoff with jitter for process restarts and inference retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Attempts after the first failure.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(raw.min(self.max_delay_ms as f64) as u64)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        base.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn outcome(decision: Decision) -> DecisionOutcome {
        DecisionOutcome::new(decision, DecisionRule::Retry, None)
    }

    #[test]
    fn budget_precedence_is_call_then_task_then_default() {
        let defaults = GranularityBudgets::default();
        let g = Granularity::Deliverable;
        assert_eq!(IterationBudget::resolve(Some(2), Some(4), g, &defaults, 3).soft, 2);
        assert_eq!(IterationBudget::resolve(None, Some(4), g, &defaults, 3).soft, 4);
        let default = IterationBudget::resolve(None, None, g, &defaults, 3);
        assert_eq!(default, IterationBudget { soft: 5, ceiling: 15 });
    }

    #[test]
    fn clarify_iterations_are_free_against_soft_budget() {
        let mut rc = RetryCoordinator::new(IterationBudget::new(2, 3), 1);
        assert_eq!(rc.begin_iteration(), Some(1));
        rc.record(Decision::Clarify);
        assert_eq!(rc.begin_iteration(), Some(2));
        assert_eq!(rc.counted(), 1);
        assert!(!rc.state().soft_exhausted);
        assert!(!rc.state().clarifications_left);
        rc.record(Decision::Retry);
        assert_eq!(rc.begin_iteration(), Some(3));
        assert!(rc.state().soft_exhausted);
    }

    #[test]
    fn clarify_without_allowance_becomes_retry() {
        let mut rc = RetryCoordinator::new(IterationBudget::new(3, 3), 0);
        rc.begin_iteration();
        let enforced = rc.enforce(outcome(Decision::Clarify));
        assert_eq!(enforced.decision, Decision::Retry);
    }

    /// Verifies that repeated RETRY overrides never push past the ceiling.
    #[test]
    fn ceiling_holds_under_repeated_retry_overrides() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let soft = rng.gen_range(1..5);
            let multiplier = rng.gen_range(1..4);
            let mut rc = RetryCoordinator::new(IterationBudget::new(soft, multiplier), 2);
            let mut runs = 0;
            while rc.begin_iteration().is_some() {
                runs += 1;
                let forced = if rng.r#gen() { Decision::Retry } else { Decision::Clarify };
                let enforced = rc.enforce(outcome(forced));
                rc.record(enforced.decision);
                if enforced.decision.is_final() {
                    assert_eq!(enforced.rule, DecisionRule::CeilingReached);
                    break;
                }
            }
            assert!(runs <= soft * multiplier);
            assert!(rc.total() <= rc.budget().ceiling);
        }
    }

    #[test]
    fn resume_continues_from_metrics() {
        let metrics = TaskMetrics {
            iterations: 2,
            counted_iterations: 2,
            clarifications: 0,
            ..TaskMetrics::default()
        };
        let mut rc = RetryCoordinator::resume(IterationBudget::new(3, 3), 1, &metrics);
        assert_eq!(rc.begin_iteration(), Some(3));
        assert!(rc.state().soft_exhausted);

        let mut written = TaskMetrics::default();
        rc.write_metrics(&mut written);
        assert_eq!(written.iterations, 3);
        assert_eq!(written.counted_iterations, 3);
    }

    #[test]
    fn resume_after_clarify_keeps_the_next_iteration_free() {
        let mut rc = RetryCoordinator::new(IterationBudget::new(2, 3), 2);
        rc.begin_iteration();
        rc.record(Decision::Clarify);
        let mut metrics = TaskMetrics::default();
        rc.write_metrics(&mut metrics);
        assert!(metrics.clarifying);

        let mut resumed = RetryCoordinator::resume(IterationBudget::new(2, 3), 2, &metrics);
        assert_eq!(resumed.begin_iteration(), Some(2));
        assert_eq!(resumed.counted(), 1);
        assert!(!resumed.soft_exhausted());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            jitter: 0.25,
            ..BackoffPolicy::default()
        };
        for attempt in 1..5 {
            let base = policy.base_delay(attempt);
            let delay = policy.delay_for(attempt);
            assert!(delay >= base.mul_f64(0.75) && delay <= base.mul_f64(1.25));
        }
    }
}
