//! Quality reviewer: grades agent output against the task through an
//! [`InferenceClient`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::verdict::{QualityAssessment, parse_quality_verdict};
use crate::io::inference::{GenerateOptions, InferenceClient};
use crate::io::prompt::{PromptAssembler, ValidationPrompt};

#[derive(Clone)]
pub struct QualityScorer {
    client: Arc<dyn InferenceClient>,
    options: GenerateOptions,
}

impl QualityScorer {
    pub fn new(client: Arc<dyn InferenceClient>, options: GenerateOptions) -> Self {
        Self { client, options }
    }

    pub fn client(&self) -> &Arc<dyn InferenceClient> {
        &self.client
    }

    /// Grade one output within `timeout`. Never fails; an unreachable reviewer or an
    /// unparseable answer yields a synthetic invalid assessment.
    #[instrument(skip_all, fields(task = %request.task.id, backend = self.client.name()))]
    pub fn score(
        &self,
        assembler: &PromptAssembler,
        request: &ValidationPrompt<'_>,
        timeout: Duration,
    ) -> QualityAssessment {
        let prompt = match assembler.validation(request) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "validation prompt failed");
                return QualityAssessment::unavailable(format!("{err:#}"));
            }
        };

        let options = GenerateOptions {
            timeout,
            ..self.options.clone()
        };
        match self.client.generate(&prompt.content, &options) {
            Ok(raw) => {
                let assessment = parse_quality_verdict(&raw);
                debug!(
                    score = assessment.score,
                    valid = assessment.valid,
                    source = ?assessment.source,
                    "quality verdict"
                );
                assessment
            }
            Err(err) => {
                warn!(err = %err, "quality scoring unavailable");
                QualityAssessment::unavailable(err.to_string())
            }
        }
    }
}
