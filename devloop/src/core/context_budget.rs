//! Token-budgeted selection of context snippets.
//!
//! Every consumption site ranks the same kinds of snippets differently: the
//! reviewer cares most about declared importance, error analysis about what
//! happened last. [`ContextBudgeter::build`] scores each item, sorts by score,
//! and admits items greedily until the budget runs out.
//!
//! Selection is deterministic: ties break on type priority, then id, then input
//! position.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::core::budget::estimate_tokens;

/// Separator between admitted snippets; its cost is charged to each snippet.
const SEPARATOR: &str = "\n\n";

/// Weight of the per-consumer type priority in the total score.
const TYPE_PRIORITY_WEIGHT: f64 = 0.15;

/// Where the assembled context will be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerKind {
    Execution,
    Validation,
    ErrorAnalysis,
    Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnippetKind {
    TaskSpec,
    OperatorNote,
    DependencyNote,
    PriorOutput,
    ValidationIssue,
    QualityIssue,
    Suggestion,
    ErrorLog,
}

impl SnippetKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::TaskSpec => "task",
            Self::OperatorNote => "operator note",
            Self::DependencyNote => "dependency",
            Self::PriorOutput => "previous output",
            Self::ValidationIssue => "validation issue",
            Self::QualityIssue => "review issue",
            Self::Suggestion => "suggestion",
            Self::ErrorLog => "error log",
        }
    }
}

/// Relative weight of each scoring axis. Need not sum to one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisWeights {
    pub recency: f64,
    pub relevance: f64,
    pub importance: f64,
    pub efficiency: f64,
}

impl ConsumerKind {
    pub fn weights(self) -> AxisWeights {
        match self {
            Self::Execution => AxisWeights {
                recency: 0.25,
                relevance: 0.35,
                importance: 0.25,
                efficiency: 0.15,
            },
            Self::Validation => AxisWeights {
                recency: 0.15,
                relevance: 0.25,
                importance: 0.45,
                efficiency: 0.15,
            },
            Self::ErrorAnalysis => AxisWeights {
                recency: 0.45,
                relevance: 0.2,
                importance: 0.2,
                efficiency: 0.15,
            },
            Self::Decision => AxisWeights {
                recency: 0.3,
                relevance: 0.2,
                importance: 0.3,
                efficiency: 0.2,
            },
        }
    }

    /// Snippet kinds in descending priority for this consumer.
    pub fn priority(self) -> &'static [SnippetKind] {
        use SnippetKind as K;
        match self {
            Self::Execution => &[
                K::TaskSpec,
                K::OperatorNote,
                K::DependencyNote,
                K::Suggestion,
                K::ValidationIssue,
                K::QualityIssue,
                K::PriorOutput,
                K::ErrorLog,
            ],
            Self::Validation => &[
                K::TaskSpec,
                K::PriorOutput,
                K::ValidationIssue,
                K::QualityIssue,
                K::Suggestion,
                K::OperatorNote,
                K::DependencyNote,
                K::ErrorLog,
            ],
            Self::ErrorAnalysis => &[
                K::ErrorLog,
                K::ValidationIssue,
                K::QualityIssue,
                K::PriorOutput,
                K::Suggestion,
                K::TaskSpec,
                K::OperatorNote,
                K::DependencyNote,
            ],
            Self::Decision => &[
                K::QualityIssue,
                K::ValidationIssue,
                K::PriorOutput,
                K::ErrorLog,
                K::OperatorNote,
                K::TaskSpec,
                K::Suggestion,
                K::DependencyNote,
            ],
        }
    }

    fn type_score(self, kind: SnippetKind) -> (f64, usize) {
        let order = self.priority();
        match order.iter().position(|k| *k == kind) {
            Some(rank) => (1.0 - rank as f64 / order.len() as f64, rank),
            None => (0.0, order.len()),
        }
    }
}

/// A typed snippet offered to the budgeter.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextItem {
    pub id: String,
    pub kind: SnippetKind,
    pub content: String,
    /// Iteration the snippet was produced in; newer scores higher on recency.
    pub iteration: u32,
    /// Task relevance in `[0, 1]`.
    pub relevance: f64,
    /// Declared importance in `[0, 1]`.
    pub importance: f64,
}

impl ContextItem {
    pub fn new(id: impl Into<String>, kind: SnippetKind, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            content: content.into(),
            iteration: 0,
            relevance: 0.5,
            importance: 0.5,
        }
    }

    pub fn at_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance;
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    fn render(&self) -> String {
        format!("[{}] {}", self.kind.label(), self.content.trim())
    }
}

/// Outcome of a budgeted selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Admitted item ids in output order.
    pub admitted: Vec<String>,
    /// Ids skipped because they did not fit.
    pub skipped: Vec<String>,
    pub used_tokens: usize,
    pub text: String,
}

pub struct ContextBudgeter;

impl ContextBudgeter {
    /// Render the highest-value items that fit within `max_tokens`.
    pub fn build(items: &[ContextItem], max_tokens: usize, consumer: ConsumerKind) -> String {
        Self::select(items, max_tokens, consumer).text
    }

    pub fn select(items: &[ContextItem], max_tokens: usize, consumer: ConsumerKind) -> Selection {
        let mut selection = Selection {
            admitted: Vec::new(),
            skipped: Vec::new(),
            used_tokens: 0,
            text: String::new(),
        };
        if max_tokens == 0 || items.is_empty() {
            selection.skipped = items.iter().map(|item| item.id.clone()).collect();
            return selection;
        }

        let newest = items.iter().map(|item| item.iteration).max().unwrap_or(0);
        let weights = consumer.weights();

        let mut ranked: Vec<Ranked<'_>> = items
            .iter()
            .enumerate()
            .map(|(position, item)| {
                let rendered = item.render();
                let cost = estimate_tokens(&rendered) + estimate_tokens(SEPARATOR);
                let recency = 1.0 / (1.0 + f64::from(newest - item.iteration));
                let efficiency = 1.0 - (cost as f64 / max_tokens as f64).min(1.0);
                let (type_score, rank) = consumer.type_score(item.kind);
                let score = weights.recency * recency
                    + weights.relevance * item.relevance.clamp(0.0, 1.0)
                    + weights.importance * item.importance.clamp(0.0, 1.0)
                    + weights.efficiency * efficiency
                    + TYPE_PRIORITY_WEIGHT * type_score;
                Ranked {
                    item,
                    position,
                    rank,
                    score,
                    cost,
                    rendered,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.rank.cmp(&b.rank))
                .then_with(|| a.item.id.cmp(&b.item.id))
                .then(a.position.cmp(&b.position))
        });

        let mut pieces = Vec::new();
        for entry in ranked {
            let remaining = max_tokens - selection.used_tokens;
            if remaining == 0 {
                selection.skipped.push(entry.item.id.clone());
                continue;
            }
            if entry.cost > remaining {
                debug!(
                    id = %entry.item.id,
                    cost = entry.cost,
                    remaining,
                    "context item skipped for budget"
                );
                selection.skipped.push(entry.item.id.clone());
                continue;
            }
            selection.used_tokens += entry.cost;
            selection.admitted.push(entry.item.id.clone());
            pieces.push(entry.rendered);
        }

        selection.text = pieces.join(SEPARATOR);
        selection
    }
}

struct Ranked<'a> {
    item: &'a ContextItem,
    position: usize,
    rank: usize,
    score: f64,
    cost: usize,
    rendered: String,
}

/// Fraction of the focus text's keywords found in `content`.
///
/// Keywords are lowercase alphanumeric words of three or more characters. An
/// empty focus yields a neutral 0.5.
pub fn keyword_relevance(content: &str, focus: &str) -> f64 {
    let focus_words = keywords(focus);
    if focus_words.is_empty() {
        return 0.5;
    }
    let content_words = keywords(content);
    let hits = focus_words
        .iter()
        .filter(|word| content_words.contains(*word))
        .count();
    hits as f64 / focus_words.len() as f64
}

fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}
