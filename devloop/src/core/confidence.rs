//! Combines validation, review quality, iteration count and task risk into one score.

use serde::{Deserialize, Serialize};

use crate::core::validator::ValidationOutcome;
use crate::core::verdict::QualityAssessment;
use crate::task::Granularity;

/// Weights and penalties for the confidence score (`[confidence]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub quality_weight: f64,
    pub validation_weight: f64,
    /// Validation credit for output with only soft violations.
    pub soft_failure_credit: f64,
    /// Multiplier applied to the quality score when the reviewer marks output invalid.
    pub invalid_quality_factor: f64,
    /// Iterations before the per-iteration penalty starts.
    pub free_iterations: u32,
    pub iteration_penalty: f64,
    pub max_iteration_penalty: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            quality_weight: 0.7,
            validation_weight: 0.3,
            soft_failure_credit: 0.5,
            invalid_quality_factor: 0.5,
            free_iterations: 2,
            iteration_penalty: 0.05,
            max_iteration_penalty: 0.3,
        }
    }
}

/// Score deductions per granularity (`[risk]` config section). Larger units face a stricter bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskModifiers {
    pub atomic: f64,
    pub deliverable: f64,
    pub feature_group: f64,
}

impl Default for RiskModifiers {
    fn default() -> Self {
        Self {
            atomic: 0.0,
            deliverable: 0.05,
            feature_group: 0.1,
        }
    }
}

impl RiskModifiers {
    pub fn for_granularity(&self, granularity: Granularity) -> f64 {
        match granularity {
            Granularity::Atomic => self.atomic,
            Granularity::Deliverable => self.deliverable,
            Granularity::FeatureGroup => self.feature_group,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceComponent {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceResult {
    pub score: f64,
    pub components: Vec<ConfidenceComponent>,
    pub rationale: String,
}

impl ConfidenceResult {
    pub fn component(&self, name: &str) -> Option<f64> {
        self.components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfidenceAggregator {
    weights: ConfidenceWeights,
    risk: RiskModifiers,
}

impl ConfidenceAggregator {
    pub fn new(weights: ConfidenceWeights, risk: RiskModifiers) -> Self {
        Self { weights, risk }
    }

    pub fn score(
        &self,
        validation: &ValidationOutcome,
        quality: &QualityAssessment,
        iteration: u32,
        granularity: Granularity,
    ) -> ConfidenceResult {
        let w = &self.weights;

        let quality_value = if quality.valid {
            quality.score
        } else {
            quality.score * w.invalid_quality_factor
        }
        .clamp(0.0, 1.0);
        let validation_value = match validation {
            ValidationOutcome::Passed => 1.0,
            ValidationOutcome::Failed { hard: false, .. } => w.soft_failure_credit,
            ValidationOutcome::Failed { hard: true, .. } => 0.0,
        };

        let total_weight = w.quality_weight + w.validation_weight;
        let base = if total_weight > 0.0 {
            (w.quality_weight * quality_value + w.validation_weight * validation_value)
                / total_weight
        } else {
            0.0
        };

        let penalized_iterations = iteration.saturating_sub(w.free_iterations);
        let penalty =
            (f64::from(penalized_iterations) * w.iteration_penalty).min(w.max_iteration_penalty);
        let risk = self.risk.for_granularity(granularity);
        let score = (base - penalty - risk).clamp(0.0, 1.0);

        let rationale = format!(
            "quality {quality_value:.2}{} x{:.2} + validation {validation_value:.2} x{:.2} = base {base:.2}; \
             iteration {iteration} penalty -{penalty:.2}; {granularity} risk -{risk:.2}; confidence {score:.2}",
            if quality.valid { "" } else { " (marked invalid)" },
            w.quality_weight,
            w.validation_weight,
        );

        ConfidenceResult {
            score,
            components: vec![
                component("quality", quality_value),
                component("validation", validation_value),
                component("base", base),
                component("iteration_penalty", penalty),
                component("risk", risk),
            ],
            rationale,
        }
    }
}

fn component(name: &str, value: f64) -> ConfidenceComponent {
    ConfidenceComponent {
        name: name.to_string(),
        value,
    }
}
