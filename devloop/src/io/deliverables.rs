//! Finding out what a task actually produced in its workdir.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use tracing::debug;

use super::git::Git;

const STATE_PREFIX: &str = ".devloop/";

/// Lists paths that differ from the committed state of a workdir.
///
/// The engine snapshots this at the start of a run and diffs against it when
/// grading an escalation, so files that were already dirty do not count.
pub trait DeliverableInspector: Send + Sync {
    fn changed_paths(&self, workdir: &Path) -> Result<BTreeSet<String>>;
}

/// `git status` based inspector. A workdir that is not a git repository has
/// no observable changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitDeliverableInspector;

impl DeliverableInspector for GitDeliverableInspector {
    fn changed_paths(&self, workdir: &Path) -> Result<BTreeSet<String>> {
        let git = Git::new(workdir);
        if !git.is_repository() {
            debug!(workdir = %workdir.display(), "not a git repository");
            return Ok(BTreeSet::new());
        }
        Ok(git
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .filter(|path| !path.starts_with(STATE_PREFIX))
            .collect())
    }
}

/// Paths changed since `baseline` was taken.
pub fn changed_since(baseline: &BTreeSet<String>, now: &BTreeSet<String>) -> Vec<String> {
    now.difference(baseline).cloned().collect()
}
