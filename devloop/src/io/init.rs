//! `.devloop/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{EngineConfig, write_config};

const STATE_GITIGNORE: &str = "iterations/\n";

/// Canonical paths within `.devloop/` for a project root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub tasks_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".devloop");
        Self {
            config_path: state_dir.join("config.toml"),
            tasks_dir: state_dir.join("tasks"),
            iterations_dir: state_dir.join("iterations"),
            gitignore_path: state_dir.join(".gitignore"),
            state_dir,
            root,
        }
    }

    pub fn task_path(&self, id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{id}.json"))
    }

    pub fn iteration_dir(&self, task: &str, iteration: u32) -> PathBuf {
        self.iterations_dir.join(task).join(iteration.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite the config file if `.devloop/` already exists.
    pub force: bool,
}

/// Create `.devloop/` with a default config in `root`.
///
/// Task files are never touched, even with `force`.
pub fn init_state(root: &Path, options: &InitOptions) -> Result<StatePaths> {
    let paths = StatePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("devloop init: .devloop exists but is not a directory"));
    }
    if paths.state_dir.exists() && !options.force {
        return Err(anyhow!(
            "devloop init: .devloop already exists (use --force to overwrite)"
        ));
    }

    for dir in [&paths.state_dir, &paths.tasks_dir, &paths.iterations_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, STATE_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &EngineConfig::default())?;

    Ok(paths)
}
