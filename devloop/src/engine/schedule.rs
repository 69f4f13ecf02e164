//! Running several tasks in dependency order.

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use tracing::{info, warn};

use super::{ExecutionSummary, TaskExecutionEngine};
use crate::error::EngineError;
use crate::io::repository::TaskRepository;
use crate::io::session::AgentLauncher;
use crate::task::TaskId;

/// Result of one task inside [`TaskExecutionEngine::execute_all`].
pub type TaskRunResult = (TaskId, Result<ExecutionSummary, EngineError>);

impl<L: AgentLauncher, R: TaskRepository> TaskExecutionEngine<L, R> {
    /// Run `ids` in waves: a task starts once every dependency inside the
    /// batch has been attempted. Each wave runs up to `max_parallel_tasks`
    /// loops on scoped threads.
    ///
    /// A dependency that ended without completing leaves its dependents
    /// BLOCKED. Tasks caught in a cycle are attempted last and report
    /// [`EngineError::DependencyCycle`].
    pub fn execute_all(&self, ids: &[TaskId]) -> Result<Vec<TaskRunResult>, EngineError> {
        let mut pending: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();
        for id in ids {
            let task = self
                .repository
                .get_task(id)?
                .ok_or_else(|| EngineError::TaskNotFound(id.clone()))?;
            pending.insert(id.clone(), task.dependencies.into_iter().collect());
        }
        let batch: BTreeSet<TaskId> = pending.keys().cloned().collect();
        for deps in pending.values_mut() {
            deps.retain(|d| batch.contains(d));
        }

        let width = self.config.engine.max_parallel_tasks.max(1);
        let mut attempted: BTreeSet<TaskId> = BTreeSet::new();
        let mut results = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            let mut wave: Vec<TaskId> = pending
                .iter()
                .filter(|(_, deps)| deps.is_subset(&attempted))
                .map(|(id, _)| id.clone())
                .collect();
            if wave.is_empty() {
                warn!(remaining = pending.len(), "dependency cycle in batch");
                wave = pending.keys().cloned().collect();
            }
            info!(tasks = wave.len(), "starting wave");

            for chunk in wave.chunks(width) {
                let finished: Vec<TaskRunResult> = thread::scope(|scope| {
                    let handles: Vec<_> = chunk
                        .iter()
                        .map(|id| (id, scope.spawn(move || self.execute_task(id, None))))
                        .collect();
                    handles
                        .into_iter()
                        .map(|(id, handle)| {
                            let result = handle.join().unwrap_or_else(|_| {
                                Err(EngineError::Internal(anyhow::anyhow!(
                                    "task '{id}' panicked"
                                )))
                            });
                            (id.clone(), result)
                        })
                        .collect()
                });
                results.extend(finished);
            }

            for id in wave {
                pending.remove(&id);
                attempted.insert(id);
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::io::repository::InMemoryTaskRepository;
    use crate::task::{Granularity, Task, TaskStatus};
    use crate::test_support::{ScriptedInference, ScriptedInspector, ScriptedLauncher, test_config};

    fn engine(tasks: Vec<Task>) -> TaskExecutionEngine<ScriptedLauncher, InMemoryTaskRepository> {
        TaskExecutionEngine::new(
            test_config(),
            ScriptedLauncher::new(Vec::new()),
            InMemoryTaskRepository::with_tasks(tasks),
            Arc::new(ScriptedInference::constant(true, 90.0)),
            "/tmp",
        )
        .expect("engine")
        .with_inspector(Arc::new(ScriptedInspector::default()))
    }

    /// Verifies that dependents run after their dependencies and see them completed.
    #[test]
    fn dependents_run_in_later_waves() {
        let e = engine(vec![
            Task::new("c", "third", Granularity::Atomic).with_dependencies(["b"]),
            Task::new("b", "second", Granularity::Atomic).with_dependencies(["a"]),
            Task::new("a", "first", Granularity::Atomic),
        ]);
        let ids: Vec<TaskId> = ["c", "b", "a"].map(String::from).to_vec();
        let results = e.execute_all(&ids).expect("batch");

        let order: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, ["a", "b", "c"]);
        for (_, result) in &results {
            assert_eq!(result.as_ref().expect("ran").status, TaskStatus::Completed);
        }
    }

    #[test]
    fn cycle_members_report_the_cycle() {
        let e = engine(vec![
            Task::new("x", "x", Granularity::Atomic).with_dependencies(["y"]),
            Task::new("y", "y", Granularity::Atomic).with_dependencies(["x"]),
            Task::new("free", "free", Granularity::Atomic),
        ]);
        let ids: Vec<TaskId> = ["x", "y", "free"].map(String::from).to_vec();
        let results = e.execute_all(&ids).expect("batch");

        assert_eq!(results[0].0, "free");
        assert!(results[0].1.is_ok());
        for (_, result) in &results[1..] {
            assert!(matches!(result, Err(EngineError::DependencyCycle(_))));
        }
        let x = e.repository().get_task("x").expect("get").expect("task");
        assert_eq!(x.status, TaskStatus::Blocked);
    }

    #[test]
    fn unknown_id_fails_the_batch() {
        let e = engine(Vec::new());
        let err = e.execute_all(&["nope".to_string()]).expect_err("missing");
        assert!(matches!(err, EngineError::TaskNotFound(_)));
    }
}
