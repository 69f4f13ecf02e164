//! Task model: the unit of work the engine drives to a terminal state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::types::TaskOutcome;

pub type TaskId = String;

/// Parse confidence below which a materialized task must be confirmed by an operator.
pub const LOW_PARSE_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Blocked,
    Paused,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
            Self::Paused => "PAUSED",
        }
    }

    /// Statuses the engine will not start a task from.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size class of a task. Drives the default iteration budget and the risk modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Atomic,
    Deliverable,
    FeatureGroup,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Deliverable => "deliverable",
            Self::FeatureGroup => "feature_group",
        }
    }

    /// Best-effort mapping from an operation target type.
    pub fn for_target_type(target_type: &str) -> Self {
        match target_type.trim().to_ascii_lowercase().as_str() {
            "module" | "component" | "endpoint" | "service" | "package" | "class" => {
                Self::Deliverable
            }
            "feature" | "epic" | "system" | "project" | "subsystem" => Self::FeatureGroup,
            _ => Self::Atomic,
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "atomic" => Ok(Self::Atomic),
            "deliverable" => Ok(Self::Deliverable),
            "feature_group" | "feature" => Ok(Self::FeatureGroup),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters accumulated across every run of a task, including resumed runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMetrics {
    /// Iterations executed, clarifications included.
    pub iterations: u32,
    /// Iterations charged against the soft budget.
    pub counted_iterations: u32,
    pub clarifications: u32,
    /// The last iteration ended in CLARIFY, so the next one is not charged.
    pub clarifying: bool,
    pub agent_ms: u64,
    pub scoring_ms: u64,
    pub agent_restarts: u32,
    pub best_confidence: Option<f64>,
    pub last_confidence: Option<f64>,
}

/// What the engine persists alongside a status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub outcome: TaskOutcome,
    pub summary: String,
    pub iterations: u32,
    pub final_confidence: Option<f64>,
    pub metrics: TaskMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub granularity: Granularity,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Per-task soft budget; falls back to the granularity default.
    #[serde(default)]
    pub iteration_budget: Option<u32>,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub metrics: TaskMetrics,
    #[serde(default)]
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>, granularity: Granularity) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            description: title.clone(),
            title,
            granularity,
            status: TaskStatus::Pending,
            priority: 0,
            dependencies: Vec::new(),
            iteration_budget: None,
            requires_confirmation: false,
            workdir: None,
            metrics: TaskMetrics::default(),
            result: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_budget(mut self, budget: u32) -> Self {
        self.iteration_budget = Some(budget);
        self
    }

    /// Materialize a task from a parsed operation. The context is not kept.
    pub fn from_operation(id: impl Into<TaskId>, op: &OperationContext) -> Self {
        let param = |key: &str| {
            op.parameters
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let granularity = param("granularity")
            .and_then(|g| g.parse().ok())
            .unwrap_or_else(|| Granularity::for_target_type(&op.target_type));
        let title = format!(
            "{} {} {}",
            op.operation.verb(),
            op.target_type.trim(),
            op.target_id.trim()
        );
        let mut task = Task::new(id, title.trim().to_string(), granularity);
        if let Some(description) = param("description") {
            task.description = description.to_string();
        }
        task.iteration_budget = param("max_iterations").and_then(|v| v.parse().ok());
        task.priority = param("priority").and_then(|v| v.parse().ok()).unwrap_or(0);
        task.dependencies = param("depends_on")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        task.requires_confirmation =
            op.operation == OperationKind::Remove || op.parse_confidence < LOW_PARSE_CONFIDENCE;
        task
    }

    /// Text used to judge how relevant a context snippet is to this task.
    pub fn focus_text(&self) -> String {
        format!("{}\n{}", self.title, self.description)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Modify,
    Fix,
    Refactor,
    Test,
    Document,
    Remove,
}

impl OperationKind {
    fn verb(self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Modify => "Modify",
            Self::Fix => "Fix",
            Self::Refactor => "Refactor",
            Self::Test => "Test",
            Self::Document => "Document",
            Self::Remove => "Remove",
        }
    }
}

/// Parsed natural-language command. External input; never mutated after a task is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    pub operation: OperationKind,
    pub target_type: String,
    pub target_id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub parse_confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind, target_type: &str, confidence: f64) -> OperationContext {
        OperationContext {
            operation: kind,
            target_type: target_type.to_string(),
            target_id: "auth".to_string(),
            parameters: BTreeMap::new(),
            parse_confidence: confidence,
        }
    }

    #[test]
    fn operation_maps_target_type_to_granularity() {
        let task = Task::from_operation("t1", &op(OperationKind::Create, "module", 0.9));
        assert_eq!(task.granularity, Granularity::Deliverable);
        assert_eq!(task.title, "Create module auth");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.requires_confirmation);
    }

    #[test]
    fn operation_parameters_override_defaults() {
        let mut ctx = op(OperationKind::Fix, "function", 0.95);
        ctx.parameters
            .insert("granularity".into(), "feature-group".into());
        ctx.parameters.insert("max_iterations".into(), "6".into());
        ctx.parameters.insert("depends_on".into(), "a, b,,c".into());
        ctx.parameters
            .insert("description".into(), "fix the login flow".into());

        let task = Task::from_operation("t2", &ctx);
        assert_eq!(task.granularity, Granularity::FeatureGroup);
        assert_eq!(task.iteration_budget, Some(6));
        assert_eq!(task.dependencies, vec!["a", "b", "c"]);
        assert_eq!(task.description, "fix the login flow");
    }

    #[test]
    fn low_parse_confidence_or_removal_requires_confirmation() {
        let vague = Task::from_operation("t3", &op(OperationKind::Modify, "file", 0.4));
        assert!(vague.requires_confirmation);

        let removal = Task::from_operation("t4", &op(OperationKind::Remove, "file", 0.99));
        assert!(removal.requires_confirmation);
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&TaskStatus::Paused).expect("serialize");
        assert_eq!(json, "\"PAUSED\"");
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
    }
}
