//! Scripted stand-ins for the agent process, the reviewer backend and the
//! deliverable inspector, plus small record builders.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::confidence::ConfidenceResult;
use crate::core::types::{AgentReply, Decision, DecisionRule, IterationRecord, ReplyEnd};
use crate::core::validator::ValidationOutcome;
use crate::core::verdict::{QualityAssessment, VerdictSource};
use crate::error::{AgentError, InferenceError};
use crate::io::config::EngineConfig;
use crate::io::deliverables::DeliverableInspector;
use crate::io::inference::{GenerateOptions, InferenceClient};
use crate::io::session::{Agent, AgentLauncher};

type ReplyQueue = Arc<Mutex<VecDeque<Result<AgentReply, AgentError>>>>;

/// Agent that answers from a queue, then repeats a fallback reply.
pub struct ScriptedAgent {
    replies: ReplyQueue,
    prompts: Arc<Mutex<Vec<String>>>,
    fallback: AgentReply,
    alive: bool,
    delay: Duration,
    restarts: u32,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<Result<AgentReply, AgentError>>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            prompts: Arc::default(),
            fallback: AgentReply::completed("work complete"),
            alive: true,
            delay: Duration::ZERO,
            restarts: 0,
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Agent for ScriptedAgent {
    fn exchange(&mut self, prompt: &str, _timeout: Duration) -> Result<AgentReply, AgentError> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let next = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    fn health_check(&mut self) -> bool {
        self.alive
    }

    fn restart(&mut self) -> Result<(), AgentError> {
        self.restarts += 1;
        self.alive = true;
        Ok(())
    }

    fn restarts(&self) -> u32 {
        self.restarts
    }

    fn shutdown(&mut self, _graceful: bool) {
        self.alive = false;
    }
}

/// Launcher whose agents share one reply queue and one prompt log.
#[derive(Default)]
pub struct ScriptedLauncher {
    replies: ReplyQueue,
    prompts: Arc<Mutex<Vec<String>>>,
    launches: AtomicU32,
    fail_with: Option<String>,
    delay: Duration,
    unhealthy: bool,
}

impl ScriptedLauncher {
    pub fn new(replies: Vec<Result<AgentReply, AgentError>>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Self::default()
        }
    }

    /// Every launch fails with a startup error.
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Every exchange takes `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Agents fail their health check until restarted.
    pub fn unhealthy(mut self) -> Self {
        self.unhealthy = true;
        self
    }

    pub fn push(&self, reply: Result<AgentReply, AgentError>) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

impl AgentLauncher for ScriptedLauncher {
    type Agent = ScriptedAgent;

    fn launch(&self, _workdir: &Path) -> Result<ScriptedAgent, AgentError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_with {
            return Err(AgentError::Startup {
                reason: reason.clone(),
            });
        }
        Ok(ScriptedAgent {
            replies: Arc::clone(&self.replies),
            prompts: Arc::clone(&self.prompts),
            fallback: AgentReply::completed("work complete"),
            alive: !self.unhealthy,
            delay: self.delay,
            restarts: 0,
        })
    }
}

/// Reviewer backend that answers from a queue, then repeats a fallback.
pub struct ScriptedInference {
    responses: Mutex<VecDeque<Result<String, InferenceError>>>,
    prompts: Mutex<Vec<String>>,
    fallback: String,
}

impl ScriptedInference {
    pub fn new(responses: Vec<Result<String, InferenceError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::default(),
            fallback: quality_json(false, 0.0),
        }
    }

    /// Always answer with the same score.
    pub fn constant(valid: bool, score: f64) -> Self {
        Self {
            fallback: quality_json(valid, score),
            ..Self::new(Vec::new())
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl InferenceClient for ScriptedInference {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, prompt: &str, _opts: &GenerateOptions) -> Result<String, InferenceError> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Reports no changes on the first call (the baseline) and `changed` after.
#[derive(Default)]
pub struct ScriptedInspector {
    changed: BTreeSet<String>,
    calls: AtomicUsize,
}

impl ScriptedInspector {
    pub fn new<I, S>(changed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            changed: changed.into_iter().map(Into::into).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl DeliverableInspector for ScriptedInspector {
    fn changed_paths(&self, _workdir: &Path) -> anyhow::Result<BTreeSet<String>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(BTreeSet::new());
        }
        Ok(self.changed.clone())
    }
}

/// A reviewer verdict on the 0-100 scale.
pub fn quality_json(valid: bool, score: f64) -> String {
    serde_json::json!({
        "valid": valid,
        "score": score,
        "issues": if valid { Vec::<&str>::new() } else { vec!["incomplete"] },
        "suggestions": [],
    })
    .to_string()
}

/// Defaults with short timeouts for fast tests.
pub fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.engine.iteration_timeout_secs = 10;
    cfg.engine.agent_timeout_secs = 5;
    cfg.engine.scoring_timeout_secs = 5;
    cfg
}

/// A plain passed iteration with exactly representable scores.
pub fn sample_record(task: &str, iteration: u32, decision: Decision) -> IterationRecord {
    IterationRecord {
        task_id: task.to_string(),
        iteration,
        prompt: format!("prompt {iteration}"),
        output: format!("output {iteration}"),
        reply_end: ReplyEnd::Completed,
        validation: ValidationOutcome::Passed,
        quality: QualityAssessment {
            valid: true,
            score: 0.5,
            issues: Vec::new(),
            suggestions: vec!["add a test".to_string()],
            source: VerdictSource::Direct,
        },
        confidence: ConfidenceResult {
            score: 0.5,
            components: Vec::new(),
            rationale: "confidence 0.50".to_string(),
        },
        decision,
        rule: DecisionRule::Retry,
        guidance: None,
        started_at: DateTime::<Utc>::from_timestamp(1_767_225_600, 0).unwrap_or_default(),
        duration_ms: 1_000,
        agent_ms: 800,
        scoring_ms: 200,
    }
}
