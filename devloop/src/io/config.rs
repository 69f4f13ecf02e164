//! Engine configuration stored under `.devloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::confidence::{ConfidenceWeights, RiskModifiers};
use crate::core::decision::DecisionPolicy;
use crate::core::retry::GranularityBudgets;
use crate::core::validator::default_failure_markers;
use crate::interaction::GateMode;
use crate::io::inference::InferenceSettings;
use crate::io::session::AgentSettings;

/// Engine configuration (TOML).
///
/// Edited by humans; every section is optional and missing fields fall back
/// to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub budgets: GranularityBudgets,
    pub confidence: ConfidenceWeights,
    pub risk: RiskModifiers,
    pub agent: AgentSettings,
    pub inference: InferenceSettings,
    pub validation: ValidationSection,
    pub interaction: InteractionSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Minimum confidence for PROCEED.
    pub threshold: f64,
    /// Width of the CLARIFY band just below the threshold.
    pub clarify_band: f64,
    /// CLARIFY is only considered up to this iteration.
    pub clarify_window: u32,
    pub max_clarifications: u32,
    /// Hard ceiling as a multiple of the soft budget.
    pub ceiling_multiplier: u32,

    /// Wall-clock budget for one iteration (agent + scoring).
    pub iteration_timeout_secs: u64,
    pub agent_timeout_secs: u64,
    pub scoring_timeout_secs: u64,

    pub prompt_budget_tokens: usize,
    pub validation_budget_tokens: usize,
    /// Share of the execution prompt given to the context bundle.
    pub context_tokens: usize,
    pub error_context_tokens: usize,
    pub decision_context_tokens: usize,

    /// Upper bound on concurrently running tasks in `execute_all`.
    pub max_parallel_tasks: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            clarify_band: 0.1,
            clarify_window: 2,
            max_clarifications: 1,
            ceiling_multiplier: 3,
            iteration_timeout_secs: 30 * 60,
            agent_timeout_secs: 20 * 60,
            scoring_timeout_secs: 120,
            prompt_budget_tokens: 8_000,
            validation_budget_tokens: 6_000,
            context_tokens: 3_000,
            error_context_tokens: 800,
            decision_context_tokens: 400,
            max_parallel_tasks: 2,
        }
    }
}

impl EngineSection {
    pub fn policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            threshold: self.threshold,
            clarify_band: self.clarify_band,
            clarify_window: self.clarify_window,
        }
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn scoring_timeout(&self) -> Duration {
        Duration::from_secs(self.scoring_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    /// Case-insensitive substrings that hard-fail an agent reply.
    pub failure_markers: Vec<String>,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            failure_markers: default_failure_markers(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionSection {
    pub gate: GateMode,
    /// Gate every PROCEED, not only tasks flagged `requires_confirmation`.
    pub confirm_completion: bool,
    /// How long an operator gate waits before rejecting.
    pub confirmation_timeout_secs: u64,
}

impl Default for InteractionSection {
    fn default() -> Self {
        Self {
            gate: GateMode::AutoApprove,
            confirm_completion: false,
            confirmation_timeout_secs: 15 * 60,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if !(0.0..=1.0).contains(&engine.threshold) {
            return Err(anyhow!("engine.threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&engine.clarify_band) {
            return Err(anyhow!("engine.clarify_band must be within [0, 1]"));
        }
        if engine.ceiling_multiplier == 0 {
            return Err(anyhow!("engine.ceiling_multiplier must be > 0"));
        }
        if engine.iteration_timeout_secs == 0
            || engine.agent_timeout_secs == 0
            || engine.scoring_timeout_secs == 0
        {
            return Err(anyhow!("engine timeouts must be > 0"));
        }
        if engine.prompt_budget_tokens == 0 || engine.validation_budget_tokens == 0 {
            return Err(anyhow!("engine prompt budgets must be > 0"));
        }
        if engine.context_tokens > engine.prompt_budget_tokens {
            return Err(anyhow!(
                "engine.context_tokens must not exceed engine.prompt_budget_tokens"
            ));
        }
        if engine.max_parallel_tasks == 0 {
            return Err(anyhow!("engine.max_parallel_tasks must be > 0"));
        }
        let budgets = &self.budgets;
        if budgets.atomic == 0 || budgets.deliverable == 0 || budgets.feature_group == 0 {
            return Err(anyhow!("budgets must be > 0"));
        }
        let weights = &self.confidence;
        if weights.quality_weight < 0.0
            || weights.validation_weight < 0.0
            || weights.quality_weight + weights.validation_weight <= 0.0
        {
            return Err(anyhow!("confidence weights must be non-negative and not both zero"));
        }
        if self.agent.completion_marker.trim().is_empty() {
            return Err(anyhow!("agent.completion_marker must not be empty"));
        }
        if self.agent.queue_capacity == 0 {
            return Err(anyhow!("agent.queue_capacity must be > 0"));
        }
        self.inference.validate()?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
