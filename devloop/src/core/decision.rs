//! The PROCEED / RETRY / CLARIFY / ESCALATE state machine.
//!
//! Rules are evaluated in order and the first match wins:
//!
//! 1. hard validation failure with the budget exhausted: escalate as FAILED
//! 2. confidence at or above the threshold: proceed
//! 3. budget exhausted below the threshold: escalate, graded by deliverables
//! 4. confidence just under the threshold, early, clarifications left: clarify
//! 5. otherwise retry
//!
//! Deliverable assessment can be expensive (it may shell out to git), so it is
//! passed as a closure and only evaluated by the rules that need it.

use serde::{Deserialize, Serialize};

use crate::core::deliverable::{DeliverableAssessment, DeliverableVerdict};
use crate::core::types::{Decision, DecisionRule, TaskOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionPolicy {
    pub threshold: f64,
    /// Width of the band below the threshold in which CLARIFY is considered.
    pub clarify_band: f64,
    /// CLARIFY is only considered up to this iteration.
    pub clarify_window: u32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            clarify_band: 0.1,
            clarify_window: 2,
        }
    }
}

/// Budget view at the time of the decision, after the current iteration was charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BudgetState {
    pub soft_exhausted: bool,
    pub ceiling_reached: bool,
    pub clarifications_left: bool,
}

impl BudgetState {
    pub fn exhausted(&self) -> bool {
        self.soft_exhausted || self.ceiling_reached
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionInput {
    pub confidence: f64,
    pub hard_validation_failure: bool,
    pub iteration: u32,
    pub budget: BudgetState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub rule: DecisionRule,
    /// Set for final decisions.
    pub outcome: Option<TaskOutcome>,
}

impl DecisionOutcome {
    pub fn new(decision: Decision, rule: DecisionRule, outcome: Option<TaskOutcome>) -> Self {
        Self {
            decision,
            rule,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    policy: DecisionPolicy,
}

impl DecisionEngine {
    pub fn new(policy: DecisionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn decide<F>(&self, input: &DecisionInput, assess: F) -> DecisionOutcome
    where
        F: FnOnce() -> DeliverableAssessment,
    {
        let exhausted = input.budget.exhausted();

        if input.hard_validation_failure && exhausted {
            return DecisionOutcome::new(
                Decision::Escalate,
                DecisionRule::HardFailureExhausted,
                Some(TaskOutcome::Failed),
            );
        }

        if input.confidence >= self.policy.threshold {
            let outcome = if exhausted && assess().verdict != DeliverableVerdict::Substantial {
                TaskOutcome::SuccessWithLimits
            } else {
                TaskOutcome::Completed
            };
            return DecisionOutcome::new(
                Decision::Proceed,
                DecisionRule::ConfidenceMet,
                Some(outcome),
            );
        }

        if exhausted {
            return DecisionOutcome::new(
                Decision::Escalate,
                DecisionRule::BudgetExhausted,
                Some(grade_escalation(&assess())),
            );
        }

        let band_floor = self.policy.threshold - self.policy.clarify_band;
        if input.confidence >= band_floor
            && input.iteration <= self.policy.clarify_window
            && input.budget.clarifications_left
        {
            return DecisionOutcome::new(Decision::Clarify, DecisionRule::ClarificationBand, None);
        }

        DecisionOutcome::new(Decision::Retry, DecisionRule::Retry, None)
    }

    /// Replace the computed decision with an operator override for this iteration.
    pub fn apply_override<F>(
        &self,
        computed: DecisionOutcome,
        forced: Decision,
        assess: F,
    ) -> DecisionOutcome
    where
        F: FnOnce() -> DeliverableAssessment,
    {
        if forced == computed.decision {
            return computed;
        }
        let outcome = match forced {
            Decision::Proceed => Some(TaskOutcome::Completed),
            Decision::Escalate => Some(grade_escalation(&assess())),
            Decision::Retry | Decision::Clarify => None,
        };
        DecisionOutcome::new(forced, DecisionRule::OperatorOverride, outcome)
    }
}

/// Outcome for an escalation, graded by what the task actually produced.
pub fn grade_escalation(assessment: &DeliverableAssessment) -> TaskOutcome {
    match assessment.verdict {
        DeliverableVerdict::Substantial => TaskOutcome::SuccessWithLimits,
        DeliverableVerdict::Partial => TaskOutcome::Partial,
        DeliverableVerdict::Nothing => TaskOutcome::Failed,
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn verdict(verdict: DeliverableVerdict) -> impl FnOnce() -> DeliverableAssessment {
        move || DeliverableAssessment {
            verdict,
            notes: Vec::new(),
        }
    }

    fn never() -> DeliverableAssessment {
        panic!("assessment should not be needed")
    }

    fn input(confidence: f64, iteration: u32, budget: BudgetState) -> DecisionInput {
        DecisionInput {
            confidence,
            hard_validation_failure: false,
            iteration,
            budget,
        }
    }

    fn fresh() -> BudgetState {
        BudgetState {
            soft_exhausted: false,
            ceiling_reached: false,
            clarifications_left: true,
        }
    }

    fn exhausted() -> BudgetState {
        BudgetState {
            soft_exhausted: true,
            ..fresh()
        }
    }

    #[test]
    fn hard_failure_with_exhausted_budget_fails() {
        let engine = DecisionEngine::default();
        let mut i = input(0.95, 3, exhausted());
        i.hard_validation_failure = true;
        let out = engine.decide(&i, never);
        assert_eq!(out.decision, Decision::Escalate);
        assert_eq!(out.outcome, Some(TaskOutcome::Failed));
    }

    #[test]
    fn high_confidence_proceeds_without_assessment() {
        let out = DecisionEngine::default().decide(&input(0.9, 1, fresh()), never);
        assert_eq!(out.decision, Decision::Proceed);
        assert_eq!(out.outcome, Some(TaskOutcome::Completed));
    }

    #[test]
    fn late_acceptance_is_success_with_limits_unless_substantial() {
        let engine = DecisionEngine::default();
        let limited = engine.decide(
            &input(0.8, 3, exhausted()),
            verdict(DeliverableVerdict::Partial),
        );
        assert_eq!(limited.outcome, Some(TaskOutcome::SuccessWithLimits));

        let full = engine.decide(
            &input(0.8, 3, exhausted()),
            verdict(DeliverableVerdict::Substantial),
        );
        assert_eq!(full.outcome, Some(TaskOutcome::Completed));
    }

    #[test]
    fn exhausted_budget_grades_escalation() {
        let engine = DecisionEngine::default();
        for (v, expected) in [
            (DeliverableVerdict::Substantial, TaskOutcome::SuccessWithLimits),
            (DeliverableVerdict::Partial, TaskOutcome::Partial),
            (DeliverableVerdict::Nothing, TaskOutcome::Failed),
        ] {
            let out = engine.decide(&input(0.3, 3, exhausted()), verdict(v));
            assert_eq!(out.decision, Decision::Escalate);
            assert_eq!(out.rule, DecisionRule::BudgetExhausted);
            assert_eq!(out.outcome, Some(expected));
        }
    }

    #[test]
    fn clarify_only_in_band_early_and_with_allowance() {
        let engine = DecisionEngine::default();
        assert_eq!(
            engine.decide(&input(0.65, 1, fresh()), never).decision,
            Decision::Clarify
        );
        assert_eq!(
            engine.decide(&input(0.65, 3, fresh()), never).decision,
            Decision::Retry
        );
        assert_eq!(
            engine.decide(&input(0.5, 1, fresh()), never).decision,
            Decision::Retry
        );
        let spent = BudgetState {
            clarifications_left: false,
            ..fresh()
        };
        assert_eq!(
            engine.decide(&input(0.65, 1, spent), never).decision,
            Decision::Retry
        );
    }

    /// Verifies the threshold property over random inputs: at or above proceeds,
    /// below with budget left never proceeds.
    #[test]
    fn threshold_separates_proceed_from_continue() {
        let engine = DecisionEngine::default();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..1_000 {
            let confidence: f64 = rng.gen_range(0.0..=1.0);
            let iteration = rng.gen_range(1..6);
            let budget = BudgetState {
                soft_exhausted: false,
                ceiling_reached: false,
                clarifications_left: rng.r#gen(),
            };
            let out = engine.decide(&input(confidence, iteration, budget), never);
            if confidence >= 0.7 {
                assert_eq!(out.decision, Decision::Proceed);
            } else {
                assert!(matches!(out.decision, Decision::Retry | Decision::Clarify));
            }
        }
    }

    #[test]
    fn override_replaces_decision_and_grades_escalation() {
        let engine = DecisionEngine::default();
        let computed = engine.decide(&input(0.2, 1, fresh()), never);
        let forced = engine.apply_override(
            computed.clone(),
            Decision::Escalate,
            verdict(DeliverableVerdict::Partial),
        );
        assert_eq!(forced.rule, DecisionRule::OperatorOverride);
        assert_eq!(forced.outcome, Some(TaskOutcome::Partial));

        let same = engine.apply_override(computed.clone(), Decision::Retry, never);
        assert_eq!(same, computed);
    }
}
