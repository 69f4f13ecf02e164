//! Task storage.
//!
//! The engine only talks to [`TaskRepository`]. Two adapters ship: JSON files
//! under `.devloop/` and an in-memory map for embedding and tests.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::config::write_atomic;
use super::init::StatePaths;
use super::iteration_log::{read_iterations, write_iteration};
use crate::core::types::IterationRecord;
use crate::task::{Task, TaskId, TaskResult, TaskStatus};

pub trait TaskRepository: Send + Sync {
    fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Set the status; a result also replaces the stored metrics.
    fn update_task_status(&self, id: &str, status: TaskStatus, result: Option<&TaskResult>)
    -> Result<()>;

    /// Direct dependencies of `id`. A dependency that does not exist is an error.
    fn get_dependencies(&self, id: &str) -> Result<Vec<Task>>;

    /// Append one iteration to the task's audit trail.
    fn record_iteration(&self, id: &str, record: &IterationRecord) -> Result<()>;

    /// Recorded iterations in index order.
    fn iterations(&self, id: &str) -> Result<Vec<IterationRecord>>;

    fn put_task(&self, task: &Task) -> Result<()>;
}

fn apply_status(task: &mut Task, status: TaskStatus, result: Option<&TaskResult>) {
    task.status = status;
    if let Some(result) = result {
        task.metrics = result.metrics.clone();
        task.result = Some(result.clone());
    }
}

fn missing(id: &str) -> anyhow::Error {
    anyhow!("task '{id}' not found")
}

/// One JSON file per task in `.devloop/tasks/`, written atomically.
pub struct FileTaskRepository {
    paths: StatePaths,
    // Serializes read-modify-write of task files.
    write_lock: Mutex<()>,
}

impl FileTaskRepository {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths,
            write_lock: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    fn write_task(&self, task: &Task) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(task)?;
        buf.push('\n');
        write_atomic(&self.paths.task_path(&task.id), &buf)
    }
}

impl TaskRepository for FileTaskRepository {
    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let path = self.paths.task_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let task = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(task))
    }

    fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&TaskResult>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut task = self.get_task(id)?.ok_or_else(|| missing(id))?;
        apply_status(&mut task, status, result);
        debug!(task = id, status = %status, "persisting task status");
        self.write_task(&task)
    }

    fn get_dependencies(&self, id: &str) -> Result<Vec<Task>> {
        let task = self.get_task(id)?.ok_or_else(|| missing(id))?;
        task.dependencies
            .iter()
            .map(|dep| {
                self.get_task(dep)?
                    .ok_or_else(|| anyhow!("dependency '{dep}' of task '{id}' not found"))
            })
            .collect()
    }

    fn record_iteration(&self, id: &str, record: &IterationRecord) -> Result<()> {
        debug_assert_eq!(record.task_id, id);
        write_iteration(&self.paths, record).map(|_| ())
    }

    fn iterations(&self, id: &str) -> Result<Vec<IterationRecord>> {
        read_iterations(&self.paths, id)
    }

    fn put_task(&self, task: &Task) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_task(task)
    }
}

#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    iterations: Mutex<BTreeMap<TaskId, Vec<IterationRecord>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            for task in tasks {
                map.insert(task.id.clone(), task);
            }
        }
        repo
    }
}

impl TaskRepository for InMemoryTaskRepository {
    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tasks.get(id).cloned())
    }

    fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&TaskResult>,
    ) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tasks.get_mut(id).ok_or_else(|| missing(id))?;
        apply_status(task, status, result);
        Ok(())
    }

    fn get_dependencies(&self, id: &str) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tasks.get(id).ok_or_else(|| missing(id))?;
        task.dependencies
            .iter()
            .map(|dep| {
                tasks
                    .get(dep)
                    .cloned()
                    .ok_or_else(|| anyhow!("dependency '{dep}' of task '{id}' not found"))
            })
            .collect()
    }

    fn record_iteration(&self, id: &str, record: &IterationRecord) -> Result<()> {
        let mut iterations = self.iterations.lock().unwrap_or_else(PoisonError::into_inner);
        iterations
            .entry(id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn iterations(&self, id: &str) -> Result<Vec<IterationRecord>> {
        let iterations = self.iterations.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(iterations.get(id).cloned().unwrap_or_default())
    }

    fn put_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }
}
