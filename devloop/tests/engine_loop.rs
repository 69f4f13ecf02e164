//! Loop-level tests for the task execution engine.
//!
//! These drive `execute_task` with scripted agents and reviewers through
//! several iterations to check budget accounting, operator controls and the
//! persisted outcome.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use devloop::core::types::{Decision, DecisionRule, IterationRecord, TaskOutcome};
use devloop::engine::TaskExecutionEngine;
use devloop::error::EngineError;
use devloop::interaction::OperatorGate;
use devloop::io::repository::{InMemoryTaskRepository, TaskRepository};
use devloop::task::{Granularity, Task, TaskStatus};
use devloop::test_support::{
    ScriptedInference, ScriptedInspector, ScriptedLauncher, quality_json, test_config,
};

type Engine = TaskExecutionEngine<ScriptedLauncher, InMemoryTaskRepository>;

fn engine_with(
    inference: ScriptedInference,
    inspector: ScriptedInspector,
    tasks: Vec<Task>,
) -> Engine {
    TaskExecutionEngine::new(
        test_config(),
        ScriptedLauncher::new(Vec::new()),
        InMemoryTaskRepository::with_tasks(tasks),
        Arc::new(inference),
        "/tmp",
    )
    .expect("engine")
    .with_inspector(Arc::new(inspector))
}

fn engine(inference: ScriptedInference, tasks: Vec<Task>) -> Engine {
    engine_with(inference, ScriptedInspector::default(), tasks)
}

fn task(id: &str) -> Task {
    Task::new(id, "Add retry to the fetcher", Granularity::Atomic)
}

fn low() -> String {
    quality_json(false, 20.0)
}

fn high() -> String {
    quality_json(true, 90.0)
}

fn decisions(e: &Engine, id: &str) -> Vec<Decision> {
    e.repository()
        .iterations(id)
        .expect("records")
        .iter()
        .map(|r| r.decision)
        .collect()
}

/// Verifies that low confidence retries until the soft budget, then escalates
/// and grades the task by what it produced.
#[test]
fn low_confidence_escalates_at_budget() {
    let e = engine(ScriptedInference::constant(false, 20.0), vec![task("t")]);
    let summary = e.execute_task("t", Some(3)).expect("run");

    assert_eq!(
        decisions(&e, "t"),
        [Decision::Retry, Decision::Retry, Decision::Escalate]
    );
    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.outcome, TaskOutcome::Failed);
    assert_eq!(summary.status, TaskStatus::Failed);
    assert_eq!(summary.last_decision, Some(Decision::Escalate));
    assert!(summary.summary.contains("budget exhausted"));

    let stored = e.repository().get_task("t").expect("get").expect("task");
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.metrics.iterations, 3);
    assert_eq!(stored.result.expect("result").outcome, TaskOutcome::Failed);
}

#[test]
fn changed_files_turn_an_escalation_into_partial() {
    let e = engine_with(
        ScriptedInference::constant(false, 20.0),
        ScriptedInspector::new(["src/fetch.rs"]),
        vec![task("t")],
    );
    let summary = e.execute_task("t", Some(2)).expect("run");
    assert_eq!(summary.outcome, TaskOutcome::Partial);
    assert_eq!(summary.status, TaskStatus::Partial);
}

#[test]
fn high_confidence_proceeds_on_first_iteration() {
    let e = engine(ScriptedInference::constant(true, 90.0), vec![task("t")]);
    let summary = e.execute_task("t", None).expect("run");

    assert_eq!(summary.outcome, TaskOutcome::Completed);
    assert_eq!(summary.iterations, 1);
    let confidence = summary.final_confidence.expect("confidence");
    assert!((confidence - 0.93).abs() < 1e-9);
    assert_eq!(e.launcher().launches(), 1);
    let records = e.repository().iterations("t").expect("records");
    assert_eq!(records[0].rule, DecisionRule::ConfidenceMet);
}

/// Verifies that a stop lands at the next boundary, leaves the task PAUSED,
/// and that the next run continues the iteration count.
#[test]
fn stop_pauses_and_run_resumes() {
    let inference = ScriptedInference::new(vec![Ok(low()), Ok(high())]);
    let e = engine(inference, vec![task("t")]);

    let summary = e
        .execute_task_with("t", Some(5), &|record: &IterationRecord| {
            if record.iteration == 1 {
                e.stop_task("t");
            }
        })
        .expect("run");
    assert_eq!(summary.outcome, TaskOutcome::Stopped);
    assert_eq!(summary.status, TaskStatus::Paused);
    assert_eq!(summary.iterations, 1);

    let resumed = e.execute_task("t", Some(5)).expect("resume");
    assert_eq!(resumed.outcome, TaskOutcome::Completed);
    assert_eq!(resumed.iterations, 2);
    let indexes: Vec<u32> = e
        .repository()
        .iterations("t")
        .expect("records")
        .iter()
        .map(|r| r.iteration)
        .collect();
    assert_eq!(indexes, [1, 2]);
}

#[test]
fn operator_message_persists_until_proceed() {
    let inference = ScriptedInference::new(vec![Ok(low()), Ok(low()), Ok(high())]);
    let e = engine(inference, vec![task("t")]);
    let controls = e.controls("t");
    controls.inject_message("reuse the backoff helper in net.rs");

    let summary = e.execute_task("t", Some(5)).expect("run");
    assert_eq!(summary.outcome, TaskOutcome::Completed);

    let prompts = e.launcher().prompts();
    assert_eq!(prompts.len(), 3);
    for prompt in &prompts {
        assert!(prompt.contains("### Operator Guidance"));
        assert!(prompt.contains("reuse the backoff helper in net.rs"));
    }
    let records = e.repository().iterations("t").expect("records");
    assert!(records.iter().all(|r| r.guidance.is_some()));
    assert_eq!(controls.guidance(), None);
}

/// Verifies that forcing RETRY every iteration still stops at the hard ceiling.
#[test]
fn ceiling_holds_against_repeated_overrides() {
    let e = engine(ScriptedInference::constant(true, 90.0), vec![task("t")]);
    e.override_decision("t", Decision::Retry);

    let summary = e
        .execute_task_with("t", Some(1), &|_: &IterationRecord| {
            e.override_decision("t", Decision::Retry);
        })
        .expect("run");

    let records = e.repository().iterations("t").expect("records");
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].rule, DecisionRule::OperatorOverride);
    assert_eq!(records[2].rule, DecisionRule::CeilingReached);
    assert_eq!(summary.last_decision, Some(Decision::Escalate));
    assert_eq!(summary.outcome, TaskOutcome::Partial);
}

#[test]
fn clarification_does_not_charge_the_soft_budget() {
    let clarify = serde_json::json!({
        "valid": true,
        "score": 50,
        "issues": ["timeout path untested"],
        "suggestions": [],
    })
    .to_string();
    let inference = ScriptedInference::new(vec![Ok(clarify), Ok(low()), Ok(low())]);
    let e = engine(inference, vec![task("t")]);
    let summary = e.execute_task("t", Some(2)).expect("run");

    assert_eq!(
        decisions(&e, "t"),
        [Decision::Clarify, Decision::Retry, Decision::Escalate]
    );
    let stored = e.repository().get_task("t").expect("get").expect("task");
    assert_eq!(stored.metrics.iterations, 3);
    assert_eq!(stored.metrics.counted_iterations, 2);
    assert_eq!(stored.metrics.clarifications, 1);
    assert_eq!(summary.iterations, 3);
}

#[test]
fn unfinished_dependency_blocks_without_launching() {
    let e = engine(
        ScriptedInference::constant(true, 90.0),
        vec![task("base"), task("top").with_dependencies(["base"])],
    );
    let summary = e.execute_task("top", None).expect("run");
    assert_eq!(summary.outcome, TaskOutcome::Blocked);
    assert_eq!(summary.status, TaskStatus::Blocked);
    assert!(summary.summary.contains("base"));
    assert_eq!(e.launcher().launches(), 0);
}

#[test]
fn operator_approves_completion() {
    let mut confirmed = task("t");
    confirmed.requires_confirmation = true;
    let e = engine(ScriptedInference::constant(true, 90.0), vec![confirmed])
        .with_gate(Arc::new(OperatorGate::new(Duration::from_secs(5))));

    let summary = thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..500 {
                if e.confirm("t", true) {
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
        });
        e.execute_task("t", None).expect("run")
    });
    assert_eq!(summary.outcome, TaskOutcome::Completed);
    assert_eq!(summary.last_decision, Some(Decision::Proceed));
}

/// Verifies that a stop during a pending confirmation pauses the task instead
/// of failing it, and that the next run can still complete.
#[test]
fn stop_at_confirmation_pauses_the_task() {
    let mut confirmed = task("t");
    confirmed.requires_confirmation = true;
    let e = engine(ScriptedInference::constant(true, 90.0), vec![confirmed])
        .with_gate(Arc::new(OperatorGate::new(Duration::from_secs(5))));

    let summary = thread::scope(|scope| {
        scope.spawn(|| {
            let controls = e.controls("t");
            for _ in 0..500 {
                if controls.pending_confirmation().is_some() {
                    e.stop_task("t");
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
        });
        e.execute_task("t", None).expect("run")
    });
    assert_eq!(summary.outcome, TaskOutcome::Stopped);
    assert_eq!(summary.status, TaskStatus::Paused);
    assert_eq!(summary.last_decision, None);
    let records = e.repository().iterations("t").expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision, Decision::Retry);
    assert_eq!(records[0].rule, DecisionRule::OperatorStop);
    assert!(!e.controls("t").stop_requested());

    let resumed = thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..500 {
                if e.confirm("t", true) {
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
        });
        e.execute_task("t", None).expect("resume")
    });
    assert_eq!(resumed.outcome, TaskOutcome::Completed);
    assert_eq!(resumed.iterations, 2);
}

#[test]
fn a_running_task_cannot_be_started_twice() {
    let e = TaskExecutionEngine::new(
        test_config(),
        ScriptedLauncher::new(Vec::new()).with_delay(Duration::from_millis(100)),
        InMemoryTaskRepository::with_tasks(vec![task("t")]),
        Arc::new(ScriptedInference::constant(false, 20.0)),
        "/tmp",
    )
    .expect("engine")
    .with_inspector(Arc::new(ScriptedInspector::default()));

    let (first, second) = thread::scope(|scope| {
        let first = scope.spawn(|| e.execute_task("t", Some(3)));
        thread::sleep(Duration::from_millis(50));
        let second = e.execute_task("t", Some(3));
        (first.join().expect("join"), second)
    });

    assert_eq!(first.expect("first run").iterations, 3);
    assert!(matches!(second, Err(EngineError::AlreadyRunning(ref id)) if id == "t"));
    let indexes: Vec<u32> = e
        .repository()
        .iterations("t")
        .expect("records")
        .iter()
        .map(|r| r.iteration)
        .collect();
    assert_eq!(indexes, [1, 2, 3]);
    assert!(e.execute_task("t", Some(3)).is_ok());
}

#[test]
fn resume_after_clarify_keeps_the_iteration_free() {
    let clarify = serde_json::json!({
        "valid": true,
        "score": 50,
        "issues": ["timeout path untested"],
        "suggestions": [],
    })
    .to_string();
    let inference = ScriptedInference::new(vec![Ok(clarify), Ok(high())]);
    let e = engine(inference, vec![task("t")]);

    let stopped = e
        .execute_task_with("t", Some(2), &|_: &IterationRecord| e.stop_task("t"))
        .expect("run");
    assert_eq!(stopped.outcome, TaskOutcome::Stopped);

    let resumed = e.execute_task("t", Some(2)).expect("resume");
    assert_eq!(resumed.outcome, TaskOutcome::Completed);
    let stored = e.repository().get_task("t").expect("get").expect("task");
    assert_eq!(stored.metrics.iterations, 2);
    assert_eq!(stored.metrics.counted_iterations, 1);
    assert_eq!(stored.metrics.clarifications, 1);
}
