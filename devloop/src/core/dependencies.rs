//! Dependency graph checks.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::task::TaskId;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Find a dependency cycle reachable from `start`.
///
/// `deps` returns the direct dependencies of a task. The returned path starts
/// and ends with the same id.
pub fn find_cycle<F>(start: &str, mut deps: F) -> Result<Option<Vec<TaskId>>>
where
    F: FnMut(&str) -> Result<Vec<TaskId>>,
{
    let mut marks: BTreeMap<TaskId, Mark> = BTreeMap::new();
    let mut path: Vec<TaskId> = Vec::new();
    visit(start, &mut deps, &mut marks, &mut path)
}

fn visit<F>(
    id: &str,
    deps: &mut F,
    marks: &mut BTreeMap<TaskId, Mark>,
    path: &mut Vec<TaskId>,
) -> Result<Option<Vec<TaskId>>>
where
    F: FnMut(&str) -> Result<Vec<TaskId>>,
{
    match marks.get(id) {
        Some(Mark::Done) => return Ok(None),
        Some(Mark::Visiting) => {
            let from = path.iter().position(|p| p == id).unwrap_or(0);
            let mut cycle = path[from..].to_vec();
            cycle.push(id.to_string());
            return Ok(Some(cycle));
        }
        None => {}
    }

    marks.insert(id.to_string(), Mark::Visiting);
    path.push(id.to_string());
    // Sorted so the reported cycle is stable.
    let children: BTreeSet<TaskId> = deps(id)?.into_iter().collect();
    for child in &children {
        if let Some(cycle) = visit(child, deps, marks, path)? {
            return Ok(Some(cycle));
        }
    }
    path.pop();
    marks.insert(id.to_string(), Mark::Done);
    Ok(None)
}
