//! Prompt assembly for the two consumption sites: the agent (execution) and
//! the quality reviewer (validation).
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds its token budget, droppable sections go
//! first in a per-site order; if that is not enough the largest remaining
//! section is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::budget::{estimate_tokens, truncate_to_tokens};
use crate::task::Task;

const EXECUTION_TEMPLATE: &str = include_str!("prompts/execution.md");
const VALIDATION_TEMPLATE: &str = include_str!("prompts/validation.md");

const EXECUTION_DROP_ORDER: &[&str] = &["context", "history", "clarification"];
const VALIDATION_DROP_ORDER: &[&str] = &["context"];

const TRUNCATION_NOTE: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

/// Inputs for an agent prompt.
#[derive(Debug, Clone)]
pub struct ExecutionPrompt<'a> {
    pub task: &'a Task,
    pub iteration: u32,
    /// Soft iteration budget, shown to the agent.
    pub budget: Option<u32>,
    /// Operator message. Never dropped, but counted against the budget.
    pub guidance: Option<&'a str>,
    /// Open points after a CLARIFY decision.
    pub clarification: Option<&'a str>,
    /// One line per earlier iteration.
    pub history: &'a [String],
    /// Budgeted context bundle.
    pub context: &'a str,
}

/// Inputs for a quality review prompt.
#[derive(Debug, Clone)]
pub struct ValidationPrompt<'a> {
    pub task: &'a Task,
    pub output: &'a str,
    pub context: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub content: String,
    pub tokens: usize,
    /// Keys of sections removed to fit the budget.
    pub dropped: Vec<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

pub struct PromptAssembler {
    env: Environment<'static>,
    execution_budget: usize,
    validation_budget: usize,
}

impl PromptAssembler {
    pub fn new(execution_budget_tokens: usize, validation_budget_tokens: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("execution", EXECUTION_TEMPLATE)
            .expect("execution template should be valid");
        env.add_template("validation", VALIDATION_TEMPLATE)
            .expect("validation template should be valid");
        Self {
            env,
            execution_budget: execution_budget_tokens,
            validation_budget: validation_budget_tokens,
        }
    }

    pub fn execution(&self, input: &ExecutionPrompt<'_>) -> Result<RenderedPrompt> {
        let task = input.task;
        let rendered = self
            .env
            .get_template("execution")?
            .render(context! {
                task => context! {
                    id => task.id,
                    title => task.title,
                    granularity => task.granularity.as_str(),
                    description => task.description.trim(),
                },
                iteration => input.iteration,
                budget => input.budget,
                guidance => non_empty(input.guidance),
                clarification => non_empty(input.clarification),
                history => input.history,
                context => non_empty(Some(input.context)),
            })
            .context("render execution prompt")?;
        Ok(fit(&rendered, self.execution_budget, EXECUTION_DROP_ORDER))
    }

    pub fn validation(&self, input: &ValidationPrompt<'_>) -> Result<RenderedPrompt> {
        let task = input.task;
        let rendered = self
            .env
            .get_template("validation")?
            .render(context! {
                task => context! {
                    title => task.title,
                    granularity => task.granularity.as_str(),
                    description => task.description.trim(),
                },
                context => non_empty(Some(input.context)),
                output => input.output.trim(),
            })
            .context("render validation prompt")?;
        Ok(fit(&rendered, self.validation_budget, VALIDATION_DROP_ORDER))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn fit(rendered: &str, budget: usize, drop_order: &[&str]) -> RenderedPrompt {
    let mut sections = parse_sections(rendered);
    let (dropped, truncated) = apply_budget(&mut sections, budget, drop_order);
    let content = render_sections(&sections);
    RenderedPrompt {
        tokens: estimate_tokens(&content),
        content,
        dropped,
        truncated,
    }
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Returns the dropped section keys and whether anything was truncated.
fn apply_budget(
    sections: &mut Vec<ParsedSection>,
    budget: usize,
    drop_order: &[&str],
) -> (Vec<String>, bool) {
    let over = |secs: &[ParsedSection]| estimate_tokens(&render_sections(secs)) > budget;
    let mut dropped = Vec::new();

    for key in drop_order {
        if !over(sections) {
            return (dropped, false);
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            let section = sections.remove(idx);
            debug!(
                section = *key,
                tokens_dropped = estimate_tokens(&section.content),
                "dropped section for budget"
            );
            dropped.push(section.key);
        }
    }

    if !over(sections) {
        return (dropped, false);
    }

    let Some(largest) = sections
        .iter()
        .enumerate()
        .max_by_key(|(_, s)| s.content.len())
        .map(|(i, _)| i)
    else {
        return (dropped, false);
    };
    let others_chars = render_sections(sections)
        .chars()
        .count()
        .saturating_sub(sections[largest].content.chars().count());
    let others = others_chars.div_ceil(4);
    let note = estimate_tokens(TRUNCATION_NOTE);
    let allowed = budget.saturating_sub(others).saturating_sub(note);

    let section = &mut sections[largest];
    let before = estimate_tokens(&section.content);
    let mut kept = truncate_to_tokens(&section.content, allowed).to_string();
    kept.push_str(TRUNCATION_NOTE);
    section.content = kept;
    debug!(
        section = %section.key,
        before,
        after = estimate_tokens(&section.content),
        "truncated section for budget"
    );
    (dropped, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Granularity;

    fn task() -> Task {
        Task::new("t-1", "Add retry to the fetcher", Granularity::Atomic)
            .with_description("Wrap the HTTP fetch in a bounded retry loop.")
    }

    fn execution<'a>(
        task: &'a Task,
        history: &'a [String],
        context: &'a str,
    ) -> ExecutionPrompt<'a> {
        ExecutionPrompt {
            task,
            iteration: 2,
            budget: Some(3),
            guidance: None,
            clarification: None,
            history,
            context,
        }
    }

    /// Verifies execution sections appear in a fixed order.
    #[test]
    fn execution_sections_are_ordered() {
        let task = task();
        let history = vec!["iteration 1: RETRY at 0.41".to_string()];
        let mut input = execution(&task, &history, "[error log] panic at fetch.rs:10");
        input.guidance = Some("use the existing backoff helper");
        input.clarification = Some("- which errors count as retryable?");

        let prompt = PromptAssembler::new(10_000, 10_000)
            .execution(&input)
            .expect("render");
        let content = &prompt.content;

        let contract = content.find("### Agent Contract").expect("contract");
        let task_pos = content.find("### Task").expect("task");
        let guidance = content.find("### Operator Guidance").expect("guidance");
        let clarify = content.find("### Clarification").expect("clarification");
        let history_pos = content.find("### Attempt History").expect("history");
        let context_pos = content.find("### Context").expect("context");
        assert!(contract < task_pos);
        assert!(task_pos < guidance);
        assert!(guidance < clarify);
        assert!(clarify < history_pos);
        assert!(history_pos < context_pos);
        assert!(content.contains("attempt: 2 (budget 3)"));
        assert!(!content.contains("<!-- section"));
        assert!(prompt.dropped.is_empty());
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let task = task();
        let prompt = PromptAssembler::new(10_000, 10_000)
            .execution(&execution(&task, &[], "  "))
            .expect("render");
        assert!(!prompt.content.contains("### Operator Guidance"));
        assert!(!prompt.content.contains("### Context"));
        assert!(!prompt.content.contains("### Attempt History"));
    }

    /// Verifies that context goes before history and that guidance survives.
    #[test]
    fn budget_drops_context_first_and_keeps_guidance() {
        let task = task();
        let history = vec!["iteration 1: RETRY at 0.41".to_string()];
        let context = "stale log line ".repeat(400);
        let mut input = execution(&task, &history, &context);
        input.guidance = Some("keep the public API unchanged");

        let prompt = PromptAssembler::new(400, 10_000)
            .execution(&input)
            .expect("render");
        assert_eq!(prompt.dropped, vec!["context".to_string()]);
        assert!(prompt.content.contains("### Attempt History"));
        assert!(prompt.content.contains("keep the public API unchanged"));
        assert!(prompt.tokens <= 400);
    }

    #[test]
    fn oversized_output_is_truncated_within_budget() {
        let task = task();
        let output = "x".repeat(20_000);
        let prompt = PromptAssembler::new(10_000, 800)
            .validation(&ValidationPrompt {
                task: &task,
                output: &output,
                context: "",
            })
            .expect("render");
        assert!(prompt.truncated);
        assert!(prompt.content.contains("[truncated]"));
        assert!(prompt.content.contains("### Reviewer Contract"));
        assert!(prompt.tokens <= 800);
    }

    #[test]
    fn validation_prompt_asks_for_the_verdict_shape() {
        let task = task();
        let prompt = PromptAssembler::new(10_000, 10_000)
            .validation(&ValidationPrompt {
                task: &task,
                output: "done: added retry loop",
                context: "[quality issue] no test for the give-up path",
            })
            .expect("render");
        assert!(prompt.content.contains(r#""valid": <bool>"#));
        assert!(prompt.content.contains("### Review Notes"));
        assert!(prompt.content.contains("<output>\ndone: added retry loop\n</output>"));
    }
}
