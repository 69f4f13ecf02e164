//! Classify what a task produced when it stops without a clean acceptance.

use serde::{Deserialize, Serialize};

use crate::core::types::IterationRecord;
use crate::core::validator::ValidationOutcome;
use crate::core::verdict::QualityAssessment;

/// Quality at which reviewed output plus changes count as a substantial deliverable.
const SUBSTANTIAL_QUALITY: f64 = 0.5;
/// Quality at which reviewed output alone counts as partial progress.
const PARTIAL_QUALITY: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliverableVerdict {
    Substantial,
    Partial,
    #[serde(rename = "NONE")]
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverableAssessment {
    pub verdict: DeliverableVerdict,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliverableEvidence {
    /// Paths changed in the workdir, state directory excluded.
    pub changed_paths: Vec<String>,
    /// Best reviewer score among outputs that passed hard validation.
    pub best_quality: Option<f64>,
    pub reviewed_outputs: u32,
}

impl DeliverableEvidence {
    pub fn from_records(records: &[IterationRecord]) -> Self {
        let reviewed: Vec<f64> = records
            .iter()
            .filter(|r| !r.validation.hard_failed() && !r.quality.is_synthetic())
            .map(|r| r.quality.score)
            .collect();
        Self {
            changed_paths: Vec::new(),
            best_quality: reviewed.iter().copied().reduce(f64::max),
            reviewed_outputs: u32::try_from(reviewed.len()).unwrap_or(u32::MAX),
        }
    }

    /// Fold in the iteration being decided, which is not recorded yet.
    pub fn observe(&mut self, validation: &ValidationOutcome, quality: &QualityAssessment) {
        if validation.hard_failed() || quality.is_synthetic() {
            return;
        }
        self.reviewed_outputs = self.reviewed_outputs.saturating_add(1);
        self.best_quality = Some(
            self.best_quality
                .map_or(quality.score, |best| best.max(quality.score)),
        );
    }

    pub fn with_changed_paths(mut self, paths: Vec<String>) -> Self {
        self.changed_paths = paths;
        self
    }
}

pub fn classify_deliverables(evidence: &DeliverableEvidence) -> DeliverableAssessment {
    let quality = evidence.best_quality.unwrap_or(0.0);
    let changed = !evidence.changed_paths.is_empty();

    let mut notes = Vec::new();
    if changed {
        let shown: Vec<&str> = evidence
            .changed_paths
            .iter()
            .take(10)
            .map(String::as_str)
            .collect();
        notes.push(format!(
            "{} changed path(s): {}",
            evidence.changed_paths.len(),
            shown.join(", ")
        ));
    } else {
        notes.push("no changes in the working tree".to_string());
    }
    match evidence.best_quality {
        Some(q) => notes.push(format!(
            "best reviewed quality {q:.2} over {} output(s)",
            evidence.reviewed_outputs
        )),
        None => notes.push("no output passed review".to_string()),
    }

    let verdict = if changed && quality >= SUBSTANTIAL_QUALITY {
        DeliverableVerdict::Substantial
    } else if changed || quality >= PARTIAL_QUALITY {
        DeliverableVerdict::Partial
    } else {
        DeliverableVerdict::Nothing
    };
    DeliverableAssessment { verdict, notes }
}
