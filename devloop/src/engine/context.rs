//! Turning the loop's memory into budgeted context for each consumer.

use crate::core::budget::{estimate_tokens, tail_chars};
use crate::core::context_budget::{
    ConsumerKind, ContextBudgeter, ContextItem, SnippetKind, keyword_relevance,
};
use crate::core::types::{IterationRecord, ReplyEnd};
use crate::core::validator::{Severity, Violation};
use crate::core::verdict::QualityAssessment;
use crate::task::{Task, TaskStatus};

const PRIOR_OUTPUT_CHARS: usize = 1_500;
const ERROR_TAIL_CHARS: usize = 400;

/// Token budgets per consumer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContextBudgets {
    pub execution: usize,
    pub error_analysis: usize,
    pub validation: usize,
    pub decision: usize,
}

/// Snippets derived from completed dependencies and earlier iterations.
pub(crate) fn loop_items(
    task: &Task,
    dependencies: &[Task],
    records: &[IterationRecord],
    current_guidance: Option<&str>,
) -> Vec<ContextItem> {
    let focus = task.focus_text();
    let mut items = Vec::new();

    for dep in dependencies.iter().filter(|d| d.status == TaskStatus::Completed) {
        let summary = dep
            .result
            .as_ref()
            .map_or("completed", |r| r.summary.as_str());
        let content = format!("{} ({}): {}", dep.id, dep.title, summary);
        items.push(
            ContextItem::new(format!("dep-{}", dep.id), SnippetKind::DependencyNote, content)
                .with_importance(0.6)
                .with_relevance(0.5),
        );
    }

    for record in records {
        let i = record.iteration;
        let output = tail_chars(record.output.trim(), PRIOR_OUTPUT_CHARS);
        if !output.is_empty() {
            items.push(
                ContextItem::new(format!("output-{i}"), SnippetKind::PriorOutput, output)
                    .at_iteration(i)
                    .with_relevance(keyword_relevance(output, &focus))
                    .with_importance(0.4),
            );
        }
        for (n, violation) in record.validation.violations().iter().enumerate() {
            items.push(violation_item(i, n, violation));
        }
        items.extend(quality_items(i, &record.quality, &focus));
        if matches!(record.reply_end, ReplyEnd::TimedOut | ReplyEnd::ErrorMarker) {
            let content = format!(
                "iteration {i}: reply ended {:?}; last output: {}",
                record.reply_end,
                tail_chars(record.output.trim(), ERROR_TAIL_CHARS)
            );
            items.push(
                ContextItem::new(format!("error-{i}"), SnippetKind::ErrorLog, content)
                    .at_iteration(i)
                    .with_importance(0.8),
            );
        }
        if let Some(note) = record.guidance.as_deref()
            && Some(note) != current_guidance
        {
            items.push(
                ContextItem::new(format!("note-{i}"), SnippetKind::OperatorNote, note)
                    .at_iteration(i)
                    .with_importance(0.5),
            );
        }
    }

    items
}

fn violation_item(iteration: u32, n: usize, violation: &Violation) -> ContextItem {
    let importance = match violation.severity {
        Severity::Hard => 0.9,
        Severity::Soft => 0.5,
    };
    ContextItem::new(
        format!("violation-{iteration}-{n}"),
        SnippetKind::ValidationIssue,
        violation.detail.clone(),
    )
    .at_iteration(iteration)
    .with_relevance(0.7)
    .with_importance(importance)
}

fn quality_items(iteration: u32, quality: &QualityAssessment, focus: &str) -> Vec<ContextItem> {
    // Synthetic verdicts describe the reviewer, not the output.
    if quality.is_synthetic() {
        return Vec::new();
    }
    let issues = quality.issues.iter().enumerate().map(|(n, issue)| {
        ContextItem::new(
            format!("issue-{iteration}-{n}"),
            SnippetKind::QualityIssue,
            issue.clone(),
        )
        .at_iteration(iteration)
        .with_relevance(keyword_relevance(issue, focus))
        .with_importance(0.7)
    });
    let suggestions = quality.suggestions.iter().enumerate().map(|(n, s)| {
        ContextItem::new(
            format!("suggestion-{iteration}-{n}"),
            SnippetKind::Suggestion,
            s.clone(),
        )
        .at_iteration(iteration)
        .with_relevance(keyword_relevance(s, focus))
        .with_importance(0.6)
    });
    issues.chain(suggestions).collect()
}

/// Context for the next agent prompt.
///
/// After a failed or cut-off reply, an error-analysis bundle goes first and
/// the execution bundle gets what is left of the budget.
pub(crate) fn execution_context(
    items: &[ContextItem],
    last: Option<&IterationRecord>,
    budgets: ContextBudgets,
) -> String {
    let troubled = last.is_some_and(|r| {
        r.validation.hard_failed()
            || matches!(r.reply_end, ReplyEnd::TimedOut | ReplyEnd::ErrorMarker)
    });
    if !troubled {
        return ContextBudgeter::build(items, budgets.execution, ConsumerKind::Execution);
    }

    let error_budget = budgets.error_analysis.min(budgets.execution);
    let errors = ContextBudgeter::select(items, error_budget, ConsumerKind::ErrorAnalysis);
    let rest: Vec<ContextItem> = items
        .iter()
        .filter(|item| !errors.admitted.contains(&item.id))
        .cloned()
        .collect();
    let remaining = budgets
        .execution
        .saturating_sub(errors.used_tokens + estimate_tokens("\n\n"));
    let general = ContextBudgeter::build(&rest, remaining, ConsumerKind::Execution);

    [errors.text, general]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Notes for the reviewer: soft violations of this output and what the
/// previous review asked for.
pub(crate) fn validation_context(
    task: &Task,
    current: &[Violation],
    iteration: u32,
    previous: Option<&IterationRecord>,
    budget: usize,
) -> String {
    let mut items: Vec<ContextItem> = current
        .iter()
        .enumerate()
        .map(|(n, v)| violation_item(iteration, n, v))
        .collect();
    if let Some(prev) = previous {
        items.extend(quality_items(prev.iteration, &prev.quality, &task.focus_text()));
    }
    ContextBudgeter::build(&items, budget, ConsumerKind::Validation)
}

/// The open points that justify an escalation or a clarification.
pub(crate) fn decision_context(task: &Task, record: &IterationRecord, budget: usize) -> String {
    let mut items: Vec<ContextItem> = record
        .validation
        .violations()
        .iter()
        .enumerate()
        .map(|(n, v)| violation_item(record.iteration, n, v))
        .collect();
    items.extend(quality_items(record.iteration, &record.quality, &task.focus_text()));
    ContextBudgeter::build(&items, budget, ConsumerKind::Decision)
}

/// One line per iteration for the attempt history section.
pub(crate) fn history_line(record: &IterationRecord) -> String {
    let mut line = format!(
        "iteration {}: {} at confidence {:.2} ({})",
        record.iteration,
        record.decision,
        record.confidence.score,
        record.rule.as_str()
    );
    if let Some(issue) = record
        .validation
        .violations()
        .first()
        .map(|v| v.detail.as_str())
        .or_else(|| record.quality.issues.first().map(String::as_str))
    {
        line.push_str("; ");
        line.push_str(issue);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Decision;
    use crate::core::validator::{ValidationOutcome, ValidationRule};
    use crate::task::Granularity;
    use crate::test_support::sample_record;

    fn budgets() -> ContextBudgets {
        ContextBudgets {
            execution: 200,
            error_analysis: 60,
            validation: 100,
            decision: 50,
        }
    }

    fn hard_failed(iteration: u32) -> IterationRecord {
        let mut record = sample_record("t-1", iteration, Decision::Retry);
        record.reply_end = ReplyEnd::TimedOut;
        record.validation = ValidationOutcome::Failed {
            hard: true,
            violations: vec![Violation {
                rule: ValidationRule::NotCutOff,
                severity: Severity::Hard,
                detail: "reply was cut off by a timeout".to_string(),
            }],
        };
        record
    }

    #[test]
    fn items_cover_outputs_issues_and_errors() {
        let task = Task::new("t-1", "Add retry", Granularity::Atomic);
        let records = [sample_record("t-1", 1, Decision::Retry), hard_failed(2)];
        let items = loop_items(&task, &[], &records, None);
        let kinds: Vec<SnippetKind> = items.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&SnippetKind::PriorOutput));
        assert!(kinds.contains(&SnippetKind::Suggestion));
        assert!(kinds.contains(&SnippetKind::ValidationIssue));
        assert!(kinds.contains(&SnippetKind::ErrorLog));
    }

    #[test]
    fn only_completed_dependencies_contribute() {
        let task = Task::new("t-2", "Use retry", Granularity::Atomic);
        let mut done = Task::new("t-1", "Add retry", Granularity::Atomic);
        done.status = TaskStatus::Completed;
        let pending = Task::new("t-0", "Other", Granularity::Atomic);
        let items = loop_items(&task, &[done, pending], &[], None);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "dep-t-1");
    }

    /// Verifies that the error bundle leads after a cut-off reply and the total stays in budget.
    #[test]
    fn error_bundle_leads_after_a_failed_reply() {
        let task = Task::new("t-1", "Add retry", Granularity::Atomic);
        let records = vec![sample_record("t-1", 1, Decision::Retry), hard_failed(2)];
        let items = loop_items(&task, &[], &records, None);
        let text = execution_context(&items, records.last(), budgets());
        let error = text.find("[error log]").expect("error log admitted");
        let older = text.find("[previous output] output 1").expect("older output admitted");
        assert!(error < older);
        assert!(estimate_tokens(&text) <= budgets().execution);
    }

    #[test]
    fn current_guidance_is_not_repeated_as_a_note() {
        let task = Task::new("t-1", "Add retry", Granularity::Atomic);
        let mut record = sample_record("t-1", 1, Decision::Retry);
        record.guidance = Some("use the helper".to_string());
        let items = loop_items(&task, &[], &[record.clone()], Some("use the helper"));
        assert!(items.iter().all(|i| i.kind != SnippetKind::OperatorNote));
        let items = loop_items(&task, &[], &[record], None);
        assert!(items.iter().any(|i| i.kind == SnippetKind::OperatorNote));
    }

    #[test]
    fn history_line_names_decision_and_first_issue() {
        let line = history_line(&hard_failed(2));
        assert_eq!(
            line,
            "iteration 2: RETRY at confidence 0.50 (below threshold); reply was cut off by a timeout"
        );
    }
}
