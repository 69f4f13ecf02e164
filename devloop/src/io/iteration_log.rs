//! Iteration artifacts under `.devloop/iterations/<task>/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::init::StatePaths;
use crate::core::confidence::ConfidenceResult;
use crate::core::types::{Decision, DecisionRule, IterationRecord, ReplyEnd};
use crate::core::validator::ValidationOutcome;
use crate::core::verdict::QualityAssessment;
use crate::task::TaskId;

/// Everything in an [`IterationRecord`] except the prompt and output bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMeta {
    pub task_id: TaskId,
    pub iteration: u32,
    pub reply_end: ReplyEnd,
    pub validation: ValidationOutcome,
    pub quality: QualityAssessment,
    pub confidence: ConfidenceResult,
    pub decision: Decision,
    pub rule: DecisionRule,
    pub guidance: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub agent_ms: u64,
    pub scoring_ms: u64,
}

impl IterationMeta {
    fn from_record(record: &IterationRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            iteration: record.iteration,
            reply_end: record.reply_end,
            validation: record.validation.clone(),
            quality: record.quality.clone(),
            confidence: record.confidence.clone(),
            decision: record.decision,
            rule: record.rule,
            guidance: record.guidance.clone(),
            started_at: record.started_at,
            duration_ms: record.duration_ms,
            agent_ms: record.agent_ms,
            scoring_ms: record.scoring_ms,
        }
    }

    fn into_record(self, prompt: String, output: String) -> IterationRecord {
        IterationRecord {
            task_id: self.task_id,
            iteration: self.iteration,
            prompt,
            output,
            reply_end: self.reply_end,
            validation: self.validation,
            quality: self.quality,
            confidence: self.confidence,
            decision: self.decision,
            rule: self.rule,
            guidance: self.guidance,
            started_at: self.started_at,
            duration_ms: self.duration_ms,
            agent_ms: self.agent_ms,
            scoring_ms: self.scoring_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub output_path: PathBuf,
}

impl IterationPaths {
    pub fn new(state: &StatePaths, task: &str, iteration: u32) -> Self {
        let dir = state.iteration_dir(task, iteration);
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            output_path: dir.join("output.txt"),
            dir,
        }
    }
}

/// Write one iteration. Records are append-only: an existing directory for the
/// same index is overwritten only by a resumed run replaying that index.
pub fn write_iteration(state: &StatePaths, record: &IterationRecord) -> Result<IterationPaths> {
    let paths = IterationPaths::new(state, &record.task_id, record.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, &IterationMeta::from_record(record))?;
    write_text(&paths.prompt_path, &record.prompt)?;
    write_text(&paths.output_path, &record.output)?;

    Ok(paths)
}

/// Read all recorded iterations of a task in index order.
pub fn read_iterations(state: &StatePaths, task: &str) -> Result<Vec<IterationRecord>> {
    let dir = state.iterations_dir.join(task);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut indices: Vec<u32> = fs::read_dir(&dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    indices.sort_unstable();

    indices
        .into_iter()
        .map(|iteration| {
            let paths = IterationPaths::new(state, task, iteration);
            let meta: IterationMeta = serde_json::from_str(&read_text(&paths.meta_path)?)
                .with_context(|| format!("parse {}", paths.meta_path.display()))?;
            Ok(meta.into_record(read_text(&paths.prompt_path)?, read_text(&paths.output_path)?))
        })
        .collect()
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
