//! The per-task control loop.
//!
//! Each iteration: checkpoint, budget charge, context, prompt, agent exchange,
//! local validation, review, confidence, decision, persistence. The loop ends
//! on PROCEED or ESCALATE, on an operator stop, or on a fatal agent error.
//!
//! Only fatal and programmer conditions come back as `Err`; everything the
//! loop can grade (budget exhaustion, bad output, unmet dependencies) comes
//! back as an [`ExecutionSummary`]. A task runs in at most one loop at a time;
//! a second call while it runs fails with [`EngineError::AlreadyRunning`].

mod context;
pub mod schedule;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use self::context::{
    ContextBudgets, decision_context, execution_context, history_line, loop_items,
    validation_context,
};
use crate::agents::{ExecutorAgent, QualityScorer};
use crate::core::budget::tail_chars;
use crate::core::confidence::ConfidenceAggregator;
use crate::core::decision::{DecisionEngine, DecisionInput, DecisionOutcome, grade_escalation};
use crate::core::deliverable::{DeliverableAssessment, DeliverableEvidence, classify_deliverables};
use crate::core::dependencies::find_cycle;
use crate::core::retry::{IterationBudget, RetryCoordinator};
use crate::core::types::{Decision, DecisionRule, IterationRecord, TaskOutcome};
use crate::core::validator::{ResponseValidator, ValidationOutcome};
use crate::core::verdict::QualityAssessment;
use crate::error::EngineError;
use crate::interaction::{
    Checkpoint, ConfirmationAnswer, ConfirmationGate, ConfirmationRequest, ControlRegistry,
    InteractionController, gate_for,
};
use crate::io::config::EngineConfig;
use crate::io::deliverables::{DeliverableInspector, GitDeliverableInspector, changed_since};
use crate::io::inference::InferenceClient;
use crate::io::prompt::{ExecutionPrompt, PromptAssembler, ValidationPrompt};
use crate::io::repository::TaskRepository;
use crate::io::session::{Agent, AgentLauncher};
use crate::task::{Task, TaskId, TaskMetrics, TaskResult, TaskStatus};

const CONFIRMATION_EXCERPT_CHARS: usize = 500;

/// Result of one `execute_task` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub outcome: TaskOutcome,
    pub iterations: u32,
    pub summary: String,
    pub final_confidence: Option<f64>,
    pub last_decision: Option<Decision>,
}

/// Called after every recorded iteration.
pub type IterationObserver<'a> = &'a (dyn Fn(&IterationRecord) + Sync);

pub struct TaskExecutionEngine<L, R> {
    config: EngineConfig,
    launcher: L,
    repository: R,
    scorer: QualityScorer,
    assembler: PromptAssembler,
    validator: ResponseValidator,
    aggregator: ConfidenceAggregator,
    decisions: DecisionEngine,
    inspector: Arc<dyn DeliverableInspector>,
    gate: Arc<dyn ConfirmationGate>,
    controls: ControlRegistry,
    workdir: PathBuf,
}

impl<L: AgentLauncher, R: TaskRepository> TaskExecutionEngine<L, R> {
    /// `workdir` is used for tasks without their own workdir.
    pub fn new(
        config: EngineConfig,
        launcher: L,
        repository: R,
        inference: Arc<dyn InferenceClient>,
        workdir: impl Into<PathBuf>,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Config(format!("{e:#}")))?;

        let engine = &config.engine;
        let scorer = QualityScorer::new(
            inference,
            config.inference.options(engine.scoring_timeout()),
        );
        let gate = gate_for(
            config.interaction.gate,
            std::time::Duration::from_secs(config.interaction.confirmation_timeout_secs),
        );
        Ok(Self {
            assembler: PromptAssembler::new(
                engine.prompt_budget_tokens,
                engine.validation_budget_tokens,
            ),
            validator: ResponseValidator::new(&config.validation.failure_markers),
            aggregator: ConfidenceAggregator::new(config.confidence.clone(), config.risk.clone()),
            decisions: DecisionEngine::new(engine.policy()),
            inspector: Arc::new(GitDeliverableInspector),
            gate,
            controls: ControlRegistry::default(),
            workdir: workdir.into(),
            scorer,
            launcher,
            repository,
            config,
        })
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn DeliverableInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// The task's operator controls, created if the task has not started yet.
    pub fn controls(&self, task_id: &str) -> InteractionController {
        self.controls.controller(task_id)
    }

    pub fn pause_task(&self, task_id: &str) {
        self.controls(task_id).pause();
    }

    pub fn resume_task(&self, task_id: &str) {
        self.controls(task_id).resume();
    }

    pub fn inject_context(&self, task_id: &str, message: &str) {
        self.controls(task_id).inject_message(message);
    }

    pub fn override_decision(&self, task_id: &str, decision: Decision) {
        self.controls(task_id).override_decision(decision);
    }

    pub fn stop_task(&self, task_id: &str) {
        self.controls(task_id).request_stop();
    }

    /// Answer a pending confirmation. Returns false if none is pending.
    pub fn confirm(&self, task_id: &str, approved: bool) -> bool {
        self.controls
            .find(task_id)
            .is_some_and(|c| c.answer_confirmation(approved))
    }

    pub fn execute_task(
        &self,
        task_id: &str,
        max_iterations: Option<u32>,
    ) -> Result<ExecutionSummary, EngineError> {
        self.execute_task_with(task_id, max_iterations, &|_| {})
    }

    #[instrument(skip_all, fields(task = task_id))]
    pub fn execute_task_with(
        &self,
        task_id: &str,
        max_iterations: Option<u32>,
        observer: IterationObserver<'_>,
    ) -> Result<ExecutionSummary, EngineError> {
        let _claim = self
            .controls
            .claim(task_id)
            .ok_or_else(|| EngineError::AlreadyRunning(task_id.to_string()))?;
        let mut task = self
            .repository
            .get_task(task_id)?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        if let Some(cycle) = find_cycle(task_id, |id| {
            Ok(self
                .repository
                .get_dependencies(id)?
                .into_iter()
                .map(|t| t.id)
                .collect())
        })? {
            let summary = format!("dependency cycle: {}", cycle.join(" -> "));
            warn!(%summary, "task blocked");
            self.persist_outcome(&task, TaskOutcome::Blocked, summary, &task.metrics, None)?;
            return Err(EngineError::DependencyCycle(cycle));
        }

        let dependencies = self.repository.get_dependencies(task_id)?;
        let unmet: Vec<&str> = dependencies
            .iter()
            .filter(|d| d.status != TaskStatus::Completed)
            .map(|d| d.id.as_str())
            .collect();
        if !unmet.is_empty() {
            let summary = format!("waiting on unfinished dependencies: {}", unmet.join(", "));
            info!(%summary, "task blocked");
            return self.persist_outcome(
                &task,
                TaskOutcome::Blocked,
                summary,
                &task.metrics,
                None,
            );
        }

        let resuming = matches!(task.status, TaskStatus::Paused | TaskStatus::Running);
        if !resuming {
            task.metrics = TaskMetrics::default();
        }
        let records = if resuming {
            let done = task.metrics.iterations;
            let mut records = self.repository.iterations(task_id)?;
            records.retain(|r| r.iteration <= done);
            records
        } else {
            Vec::new()
        };

        let budget = IterationBudget::resolve(
            max_iterations,
            task.iteration_budget,
            task.granularity,
            &self.config.budgets,
            self.config.engine.ceiling_multiplier,
        );
        let coordinator = if resuming {
            RetryCoordinator::resume(budget, self.config.engine.max_clarifications, &task.metrics)
        } else {
            RetryCoordinator::new(budget, self.config.engine.max_clarifications)
        };
        info!(
            soft = budget.soft,
            ceiling = budget.ceiling,
            resumed_at = coordinator.total(),
            "starting task"
        );

        let workdir = task.workdir.clone().unwrap_or_else(|| self.workdir.clone());
        let baseline = self.inspector.changed_paths(&workdir).unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "could not snapshot workdir");
            BTreeSet::new()
        });

        self.repository
            .update_task_status(task_id, TaskStatus::Running, None)?;

        let mut agent = match self.launcher.launch(&workdir) {
            Ok(agent) => agent,
            Err(source) => {
                warn!(err = %source, "agent failed to launch");
                let summary = format!("agent failed to launch: {source}");
                self.persist_outcome(&task, TaskOutcome::Failed, summary, &task.metrics, None)?;
                return Err(EngineError::Agent {
                    task: task_id.to_string(),
                    source,
                });
            }
        };

        let mut run = TaskRun {
            task,
            dependencies,
            records,
            coordinator,
            controls: self.controls(task_id),
            workdir,
            baseline,
        };
        let result = self.run_loop(&mut run, &mut agent, observer);
        agent.shutdown(true);
        run.task.metrics.agent_restarts += agent.restarts();
        run.coordinator.write_metrics(&mut run.task.metrics);

        match result {
            Ok(end) => {
                let summary = self.describe(&run, &end);
                let metrics = run.task.metrics.clone();
                let outcome =
                    self.persist_outcome(&run.task, end.outcome, summary, &metrics, end.decision)?;
                if outcome.status.is_terminal() {
                    self.controls.remove(task_id);
                }
                Ok(outcome)
            }
            Err(err) => {
                if let EngineError::Agent { .. } = &err {
                    let metrics = run.task.metrics.clone();
                    let summary = err.to_string();
                    self.persist_outcome(&run.task, TaskOutcome::Failed, summary, &metrics, None)?;
                    self.controls.remove(task_id);
                }
                Err(err)
            }
        }
    }

    fn run_loop<A: Agent>(
        &self,
        run: &mut TaskRun,
        agent: &mut A,
        observer: IterationObserver<'_>,
    ) -> Result<LoopEnd, EngineError> {
        let executor = ExecutorAgent::new(&self.assembler, self.config.engine.agent_timeout());
        let budgets = self.context_budgets();

        loop {
            if run.controls.checkpoint() == Checkpoint::Stop {
                info!(iterations = run.coordinator.total(), "stopped by operator");
                return Ok(LoopEnd {
                    outcome: TaskOutcome::Stopped,
                    decision: None,
                    rule: None,
                });
            }

            let Some(iteration) = run.coordinator.begin_iteration() else {
                let assessment = self.assess(run, None);
                return Ok(LoopEnd {
                    outcome: grade_escalation(&assessment),
                    decision: Some(Decision::Escalate),
                    rule: Some(DecisionRule::CeilingReached),
                });
            };
            if iteration > 1 && !agent.health_check() {
                warn!(iteration, "agent failed health check; restarting");
                if let Err(err) = agent.restart() {
                    warn!(iteration, err = %err, "restart failed; exchange will retry it");
                }
            }

            let started_at = Utc::now();
            let started = Instant::now();
            let deadline = started + self.config.engine.iteration_timeout();

            let guidance = run.controls.guidance();
            let last = run.records.last();
            let items = loop_items(&run.task, &run.dependencies, &run.records, guidance.as_deref());
            let context = execution_context(&items, last, budgets);
            let clarification = last
                .filter(|r| r.decision == Decision::Clarify)
                .map(|r| decision_context(&run.task, r, budgets.decision));
            let history: Vec<String> = run.records.iter().map(history_line).collect();
            if let Some(text) = guidance.as_deref() {
                info!(iteration, chars = text.len(), "including operator guidance");
            }

            let attempt = executor.run(
                agent,
                &ExecutionPrompt {
                    task: &run.task,
                    iteration,
                    budget: Some(run.coordinator.budget().soft),
                    guidance: guidance.as_deref(),
                    clarification: clarification.as_deref(),
                    history: &history,
                    context: &context,
                },
                deadline,
            )?;

            let validation = ValidationOutcome::from(self.validator.validate(&attempt.reply));
            let scoring_started = Instant::now();
            let quality = if validation.hard_failed() {
                debug!(iteration, "hard validation failure; skipping review");
                let reason = validation
                    .violations()
                    .first()
                    .map_or("hard validation failure", |v| v.detail.as_str());
                QualityAssessment::skipped(reason)
            } else {
                let notes = validation_context(
                    &run.task,
                    validation.violations(),
                    iteration,
                    run.records.last(),
                    budgets.validation,
                );
                let timeout = deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.config.engine.scoring_timeout());
                self.scorer.score(
                    &self.assembler,
                    &ValidationPrompt {
                        task: &run.task,
                        output: &attempt.reply.text,
                        context: &notes,
                    },
                    timeout,
                )
            };
            let scoring_ms = scoring_started.elapsed().as_millis() as u64;

            let confidence =
                self.aggregator
                    .score(&validation, &quality, iteration, run.task.granularity);

            let input = DecisionInput {
                confidence: confidence.score,
                hard_validation_failure: validation.hard_failed(),
                iteration,
                budget: run.coordinator.state(),
            };
            let snapshot: &TaskRun = run;
            let assess = || self.assess(snapshot, Some((&validation, &quality)));
            let mut outcome = self.decisions.decide(&input, assess);
            if let Some(forced) = run.controls.take_override() {
                info!(
                    iteration,
                    computed = %outcome.decision,
                    forced = %forced,
                    "operator override"
                );
                outcome = self.decisions.apply_override(outcome, forced, assess);
            }
            outcome = run.coordinator.enforce(outcome);
            if outcome.decision == Decision::Escalate && outcome.outcome.is_none() {
                outcome.outcome = Some(grade_escalation(&assess()));
            }
            if outcome.decision == Decision::Proceed && self.needs_confirmation(&run.task) {
                let request = ConfirmationRequest {
                    task_id: run.task.id.clone(),
                    iteration,
                    confidence: confidence.score,
                    summary: tail_chars(attempt.reply.text.trim(), CONFIRMATION_EXCERPT_CHARS)
                        .to_string(),
                };
                match self.gate.confirm(&request, &run.controls) {
                    ConfirmationAnswer::Approved => {}
                    ConfirmationAnswer::Rejected => {
                        info!(iteration, "completion rejected at confirmation gate");
                        outcome = DecisionOutcome::new(
                            Decision::Escalate,
                            DecisionRule::ConfirmationRejected,
                            Some(grade_escalation(&assess())),
                        );
                    }
                    ConfirmationAnswer::Stopped => {
                        info!(iteration, "stopped while awaiting confirmation");
                        outcome =
                            DecisionOutcome::new(Decision::Retry, DecisionRule::OperatorStop, None);
                    }
                }
            }

            run.coordinator.record(outcome.decision);
            run.controls.settle(outcome.decision);

            let record = IterationRecord {
                task_id: run.task.id.clone(),
                iteration,
                prompt: attempt.prompt.content,
                output: attempt.reply.text,
                reply_end: attempt.reply.ended,
                validation,
                quality,
                confidence,
                decision: outcome.decision,
                rule: outcome.rule,
                guidance,
                started_at,
                duration_ms: started.elapsed().as_millis() as u64,
                agent_ms: attempt.agent_ms,
                scoring_ms,
            };
            self.repository.record_iteration(&run.task.id, &record)?;
            info!(
                target: "devloop::iteration",
                task = %record.task_id,
                iteration,
                decision = %record.decision,
                confidence = record.confidence.score,
                agent_ms = record.agent_ms,
                scoring_ms = record.scoring_ms,
                "iteration complete"
            );
            observer(&record);

            let metrics = &mut run.task.metrics;
            metrics.agent_ms += record.agent_ms;
            metrics.scoring_ms += record.scoring_ms;
            metrics.last_confidence = Some(record.confidence.score);
            metrics.best_confidence = Some(
                metrics
                    .best_confidence
                    .map_or(record.confidence.score, |b| b.max(record.confidence.score)),
            );
            run.records.push(record);

            if outcome.rule == DecisionRule::OperatorStop {
                return Ok(LoopEnd {
                    outcome: TaskOutcome::Stopped,
                    decision: None,
                    rule: None,
                });
            }
            if outcome.decision.is_final() {
                return Ok(LoopEnd {
                    outcome: outcome.outcome.unwrap_or(TaskOutcome::Failed),
                    decision: Some(outcome.decision),
                    rule: Some(outcome.rule),
                });
            }
        }
    }

    fn needs_confirmation(&self, task: &Task) -> bool {
        task.requires_confirmation || self.config.interaction.confirm_completion
    }

    fn context_budgets(&self) -> ContextBudgets {
        let engine = &self.config.engine;
        ContextBudgets {
            execution: engine.context_tokens,
            error_analysis: engine.error_context_tokens,
            validation: engine.validation_budget_tokens / 4,
            decision: engine.decision_context_tokens,
        }
    }

    fn assess(
        &self,
        run: &TaskRun,
        current: Option<(&ValidationOutcome, &QualityAssessment)>,
    ) -> DeliverableAssessment {
        let mut evidence = DeliverableEvidence::from_records(&run.records);
        if let Some((validation, quality)) = current {
            evidence.observe(validation, quality);
        }
        let changed = match self.inspector.changed_paths(&run.workdir) {
            Ok(now) => changed_since(&run.baseline, &now),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not inspect workdir");
                Vec::new()
            }
        };
        let assessment = classify_deliverables(&evidence.with_changed_paths(changed));
        debug!(verdict = ?assessment.verdict, "deliverable assessment");
        assessment
    }

    fn describe(&self, run: &TaskRun, end: &LoopEnd) -> String {
        let n = run.coordinator.total();
        let confidence = run.task.metrics.last_confidence.unwrap_or(0.0);
        match (end.outcome, end.rule) {
            (TaskOutcome::Stopped, _) => format!("stopped by operator after {n} iteration(s)"),
            (TaskOutcome::Completed, _) => {
                format!("accepted at iteration {n} with confidence {confidence:.2}")
            }
            (outcome, rule) => {
                let rule = rule.map_or("escalated", DecisionRule::as_str);
                let mut text = format!(
                    "{outcome} after {n} iteration(s) ({rule}); last confidence {confidence:.2}"
                );
                if let Some(last) = run.records.last() {
                    let budget = self.config.engine.decision_context_tokens;
                    let open = decision_context(&run.task, last, budget);
                    if !open.is_empty() {
                        text.push_str("\nopen points:\n");
                        text.push_str(&open);
                    }
                }
                text
            }
        }
    }

    fn persist_outcome(
        &self,
        task: &Task,
        outcome: TaskOutcome,
        summary: String,
        metrics: &TaskMetrics,
        last_decision: Option<Decision>,
    ) -> Result<ExecutionSummary, EngineError> {
        let result = TaskResult {
            outcome,
            summary,
            iterations: metrics.iterations,
            final_confidence: metrics.last_confidence,
            metrics: metrics.clone(),
        };
        let status = outcome.status();
        self.repository
            .update_task_status(&task.id, status, Some(&result))?;
        info!(task = %task.id, status = %status, outcome = %outcome, "task finished");
        Ok(ExecutionSummary {
            task_id: task.id.clone(),
            status,
            outcome,
            iterations: result.iterations,
            summary: result.summary,
            final_confidence: result.final_confidence,
            last_decision,
        })
    }
}

/// Mutable state of one task's loop.
struct TaskRun {
    task: Task,
    dependencies: Vec<Task>,
    records: Vec<IterationRecord>,
    coordinator: RetryCoordinator,
    controls: InteractionController,
    workdir: PathBuf,
    baseline: BTreeSet<String>,
}

struct LoopEnd {
    outcome: TaskOutcome,
    decision: Option<Decision>,
    rule: Option<DecisionRule>,
}
