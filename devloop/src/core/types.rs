//! Shared deterministic types for the iteration loop.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::confidence::ConfidenceResult;
use crate::core::validator::ValidationOutcome;
use crate::core::verdict::QualityAssessment;
use crate::task::{TaskId, TaskStatus};

/// What the loop does after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Proceed,
    Retry,
    Clarify,
    Escalate,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proceed => "PROCEED",
            Self::Retry => "RETRY",
            Self::Clarify => "CLARIFY",
            Self::Escalate => "ESCALATE",
        }
    }

    /// Whether this decision ends the loop.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Proceed | Self::Escalate)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proceed" | "accept" => Ok(Self::Proceed),
            "retry" => Ok(Self::Retry),
            "clarify" => Ok(Self::Clarify),
            "escalate" => Ok(Self::Escalate),
            other => Err(format!("unknown decision '{other}'")),
        }
    }
}

/// Which rule produced a decision. Recorded for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    HardFailureExhausted,
    ConfidenceMet,
    BudgetExhausted,
    ClarificationBand,
    Retry,
    OperatorOverride,
    CeilingReached,
    ConfirmationRejected,
    /// Stopped while a completion waited for confirmation.
    OperatorStop,
}

impl DecisionRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HardFailureExhausted => "hard failure with budget exhausted",
            Self::ConfidenceMet => "confidence met",
            Self::BudgetExhausted => "budget exhausted",
            Self::ClarificationBand => "clarification band",
            Self::Retry => "below threshold",
            Self::OperatorOverride => "operator override",
            Self::CeilingReached => "iteration ceiling reached",
            Self::ConfirmationRejected => "confirmation rejected",
            Self::OperatorStop => "stopped before confirmation",
        }
    }
}

/// Graded result of a task that stopped iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Completed,
    SuccessWithLimits,
    Partial,
    Failed,
    /// Stopped by the operator; resumable.
    Stopped,
    /// Dependencies unmet or cyclic.
    Blocked,
}

impl TaskOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::SuccessWithLimits => "SUCCESS_WITH_LIMITS",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::Blocked => "BLOCKED",
        }
    }

    /// Persisted task status for this outcome.
    pub fn status(self) -> TaskStatus {
        match self {
            Self::Completed | Self::SuccessWithLimits => TaskStatus::Completed,
            Self::Partial => TaskStatus::Partial,
            Self::Failed => TaskStatus::Failed,
            Self::Stopped => TaskStatus::Paused,
            Self::Blocked => TaskStatus::Blocked,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the agent ended its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyEnd {
    /// Completion marker seen.
    Completed,
    /// Error marker seen.
    ErrorMarker,
    /// Output went quiet with a non-empty buffer.
    Idle,
    /// Hard timeout; `text` holds whatever arrived first.
    TimedOut,
}

/// Text collected from one agent exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    pub text: String,
    pub ended: ReplyEnd,
    /// Last stderr lines seen during the exchange.
    #[serde(default)]
    pub stderr_tail: String,
}

impl AgentReply {
    pub fn completed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ended: ReplyEnd::Completed,
            stderr_tail: String::new(),
        }
    }

    pub fn timed_out(partial: impl Into<String>) -> Self {
        Self {
            text: partial.into(),
            ended: ReplyEnd::TimedOut,
            stderr_tail: String::new(),
        }
    }
}

/// Append-only audit entry for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub task_id: TaskId,
    pub iteration: u32,
    pub prompt: String,
    pub output: String,
    pub reply_end: ReplyEnd,
    pub validation: ValidationOutcome,
    pub quality: QualityAssessment,
    pub confidence: ConfidenceResult,
    pub decision: Decision,
    pub rule: DecisionRule,
    /// Operator guidance included in this iteration's prompt.
    pub guidance: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub agent_ms: u64,
    pub scoring_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_parses_operator_spellings() {
        assert_eq!("Retry".parse::<Decision>(), Ok(Decision::Retry));
        assert_eq!(" accept ".parse::<Decision>(), Ok(Decision::Proceed));
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn outcomes_map_onto_persisted_statuses() {
        assert_eq!(TaskOutcome::SuccessWithLimits.status(), TaskStatus::Completed);
        assert_eq!(TaskOutcome::Stopped.status(), TaskStatus::Paused);
        assert_eq!(TaskOutcome::Partial.status(), TaskStatus::Partial);
        assert!(Decision::Escalate.is_final());
        assert!(!Decision::Clarify.is_final());
    }
}
