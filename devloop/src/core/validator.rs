//! Local structural checks on agent output.
//!
//! Nothing here calls a model: these are cheap rules that catch output which is
//! obviously unusable before the reviewer is asked to grade it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{AgentReply, ReplyEnd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    NonEmpty,
    NoFailureMarker,
    NoErrorMarker,
    NotCutOff,
    BalancedFences,
    NoReplacementChars,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Output is unusable; the reviewer is not consulted.
    Hard,
    /// Output is suspect but still graded.
    Soft,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: ValidationRule,
    pub severity: Severity,
    pub detail: String,
}

/// Every rule an output violated.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("output failed {} validation rule(s): {}", .violations.len(), summarize(.violations))]
pub struct ValidationFailure {
    pub violations: Vec<Violation>,
}

impl ValidationFailure {
    pub fn is_hard(&self) -> bool {
        self.violations.iter().any(|v| v.severity == Severity::Hard)
    }
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.detail.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Serializable validation result stored in each iteration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Passed,
    Failed { hard: bool, violations: Vec<Violation> },
}

impl ValidationOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn hard_failed(&self) -> bool {
        matches!(self, Self::Failed { hard: true, .. })
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Passed => &[],
            Self::Failed { violations, .. } => violations,
        }
    }
}

impl From<Result<(), ValidationFailure>> for ValidationOutcome {
    fn from(result: Result<(), ValidationFailure>) -> Self {
        match result {
            Ok(()) => Self::Passed,
            Err(failure) => Self::Failed {
                hard: failure.is_hard(),
                violations: failure.violations,
            },
        }
    }
}

pub fn default_failure_markers() -> Vec<String> {
    [
        "panicked at",
        "traceback (most recent call last)",
        "fatal error:",
        "segmentation fault",
        "i cannot complete",
        "unable to complete the task",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Debug, Clone)]
pub struct ResponseValidator {
    failure_markers: Vec<String>,
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self::new(&default_failure_markers())
    }
}

impl ResponseValidator {
    /// Markers are matched case-insensitively.
    pub fn new(failure_markers: &[String]) -> Self {
        Self {
            failure_markers: failure_markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn validate(&self, reply: &AgentReply) -> Result<(), ValidationFailure> {
        let mut violations = Vec::new();
        let text = reply.text.as_str();

        if text.trim().is_empty() {
            violations.push(Violation {
                rule: ValidationRule::NonEmpty,
                severity: Severity::Hard,
                detail: "agent output is empty".to_string(),
            });
        }

        let lowered = text.to_lowercase();
        let hits: Vec<&str> = self
            .failure_markers
            .iter()
            .filter(|marker| lowered.contains(marker.as_str()))
            .map(String::as_str)
            .collect();
        if !hits.is_empty() {
            violations.push(Violation {
                rule: ValidationRule::NoFailureMarker,
                severity: Severity::Hard,
                detail: format!("failure marker present: {}", hits.join(", ")),
            });
        }

        match reply.ended {
            ReplyEnd::ErrorMarker => violations.push(Violation {
                rule: ValidationRule::NoErrorMarker,
                severity: Severity::Hard,
                detail: "agent reported an error".to_string(),
            }),
            ReplyEnd::TimedOut => violations.push(Violation {
                rule: ValidationRule::NotCutOff,
                severity: Severity::Hard,
                detail: "agent output cut off by timeout".to_string(),
            }),
            ReplyEnd::Completed | ReplyEnd::Idle => {}
        }

        let fences = text
            .lines()
            .filter(|line| line.trim_start().starts_with("```"))
            .count();
        if fences % 2 != 0 {
            violations.push(Violation {
                rule: ValidationRule::BalancedFences,
                severity: Severity::Soft,
                detail: format!("unbalanced code fences ({fences} fence lines)"),
            });
        }

        let replacements = text.chars().filter(|c| *c == '\u{FFFD}').count();
        if replacements > 0 {
            violations.push(Violation {
                rule: ValidationRule::NoReplacementChars,
                severity: Severity::Soft,
                detail: format!("{replacements} replacement character(s) in output"),
            });
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure { violations })
        }
    }
}
