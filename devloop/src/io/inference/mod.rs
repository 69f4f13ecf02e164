//! Validation reasoning backends.
//!
//! [`InferenceClient`] is text in, text out. Two backends ship: an
//! Ollama-compatible HTTP client and a one-shot command that reads the prompt
//! on stdin. Both are wrapped in [`RetryingClient`], which retries transient
//! failures with the same [`BackoffPolicy`] used for agent restarts and keeps
//! call statistics.

mod command;
mod http;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

pub use command::CommandInferenceClient;
pub use http::HttpInferenceClient;

use crate::core::budget::estimate_tokens;
use crate::core::retry::BackoffPolicy;
use crate::error::InferenceError;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub timeout: Duration,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl GenerateOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            max_tokens: None,
            temperature: None,
        }
    }
}

pub trait InferenceClient: Send + Sync {
    fn name(&self) -> &str;

    fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String, InferenceError>;

    fn is_available(&self) -> bool;

    fn estimate_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn stats(&self) -> InferenceStatsSnapshot {
        InferenceStatsSnapshot::default()
    }
}

/// Lock-free call counters shared across concurrent task loops.
#[derive(Debug, Default)]
pub struct InferenceStats {
    calls: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    latency_ms: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InferenceStatsSnapshot {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
    pub errors: u64,
    pub timeouts: u64,
}

impl InferenceStats {
    fn record(
        &self,
        prompt_tokens: usize,
        outcome: &Result<String, InferenceError>,
        latency: Duration,
    ) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        self.prompt_tokens
            .fetch_add(prompt_tokens as u64, Ordering::Relaxed);
        match outcome {
            Ok(text) => {
                self.completion_tokens
                    .fetch_add(estimate_tokens(text) as u64, Ordering::Relaxed);
            }
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                if err.is_timeout() {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn snapshot(&self) -> InferenceStatsSnapshot {
        InferenceStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            latency_ms: self.latency_ms.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Retries transient failures of an inner client and records statistics per call.
pub struct RetryingClient<C> {
    inner: C,
    policy: BackoffPolicy,
    stats: InferenceStats,
}

impl<C: InferenceClient> RetryingClient<C> {
    pub fn new(inner: C, policy: BackoffPolicy) -> Self {
        Self {
            inner,
            policy,
            stats: InferenceStats::default(),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: InferenceClient> InferenceClient for RetryingClient<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    #[instrument(skip_all, fields(backend = self.inner.name(), prompt_len = prompt.len()))]
    fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String, InferenceError> {
        let prompt_tokens = self.inner.estimate_tokens(prompt);
        let deadline = Instant::now() + opts.timeout;
        let mut attempt_opts = opts.clone();
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            attempt_opts.timeout = deadline.saturating_duration_since(started);
            let result = self.inner.generate(prompt, &attempt_opts);
            self.stats.record(prompt_tokens, &result, started.elapsed());

            let err = match result {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };
            if !err.is_transient() {
                return Err(err);
            }
            attempt += 1;
            if attempt > self.policy.max_attempts {
                warn!(attempts = attempt, error = %err, "inference retries exhausted");
                return Err(InferenceError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            let delay = self.policy.delay_for(attempt);
            if Instant::now() + delay >= deadline {
                warn!(attempts = attempt, error = %err, "no time left to retry inference");
                return Err(InferenceError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying inference call"
            );
            thread::sleep(delay);
        }
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        self.inner.estimate_tokens(text)
    }

    fn stats(&self) -> InferenceStatsSnapshot {
        self.stats.snapshot()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Http,
    Command,
}

/// Inference backend settings (`[inference]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub backend: BackendKind,
    pub url: String,
    pub model: String,
    /// Program and arguments for the command backend.
    pub command: Vec<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub output_limit_bytes: usize,
    pub retry: BackoffPolicy,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Http,
            url: "http://localhost:11434".to_string(),
            model: "qwen2.5-coder:7b".to_string(),
            command: Vec::new(),
            max_tokens: Some(1_024),
            temperature: Some(0.1),
            output_limit_bytes: 200_000,
            retry: BackoffPolicy::default(),
        }
    }
}

impl InferenceSettings {
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            BackendKind::Http if self.url.trim().is_empty() || self.model.trim().is_empty() => {
                Err(anyhow!("inference.url and inference.model are required for the http backend"))
            }
            BackendKind::Command
                if self.command.is_empty() || self.command[0].trim().is_empty() =>
            {
                Err(anyhow!("inference.command must be a non-empty array for the command backend"))
            }
            _ => Ok(()),
        }
    }

    pub fn options(&self, timeout: Duration) -> GenerateOptions {
        GenerateOptions {
            timeout,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Build the configured backend wrapped in retries.
pub fn build_client(settings: &InferenceSettings) -> Result<Arc<dyn InferenceClient>> {
    settings.validate()?;
    let client: Arc<dyn InferenceClient> = match settings.backend {
        BackendKind::Http => Arc::new(RetryingClient::new(
            HttpInferenceClient::new(&settings.url, &settings.model)?,
            settings.retry.clone(),
        )),
        BackendKind::Command => Arc::new(RetryingClient::new(
            CommandInferenceClient::new(settings.command.clone(), settings.output_limit_bytes),
            settings.retry.clone(),
        )),
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    struct Flaky {
        results: Mutex<VecDeque<Result<String, InferenceError>>>,
    }

    impl Flaky {
        fn new(results: Vec<Result<String, InferenceError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
            }
        }
    }

    impl InferenceClient for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn generate(
            &self,
            _prompt: &str,
            _opts: &GenerateOptions,
        ) -> Result<String, InferenceError> {
            self.results
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err(InferenceError::Unavailable("script exhausted".into())))
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn opts() -> GenerateOptions {
        GenerateOptions::with_timeout(Duration::from_secs(1))
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let client = RetryingClient::new(
            Flaky::new(vec![
                Err(InferenceError::Timeout(Duration::from_millis(5))),
                Err(InferenceError::Transport("reset".into())),
                Ok("verdict".into()),
            ]),
            fast_policy(3),
        );
        assert_eq!(client.generate("prompt", &opts()).expect("generate"), "verdict");
        let stats = client.stats();
        assert_eq!(stats.calls, 3);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.completion_tokens, 2);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let client = RetryingClient::new(
            Flaky::new(vec![
                Err(InferenceError::Timeout(Duration::from_millis(5))),
                Err(InferenceError::Timeout(Duration::from_millis(5))),
            ]),
            fast_policy(1),
        );
        let err = client.generate("prompt", &opts()).expect_err("exhausted");
        assert!(matches!(err, InferenceError::Exhausted { attempts: 2, .. }));
        assert!(err.is_timeout());
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let client = RetryingClient::new(
            Flaky::new(vec![
                Err(InferenceError::Malformed("not json".into())),
                Ok("unused".into()),
            ]),
            fast_policy(3),
        );
        assert!(matches!(
            client.generate("prompt", &opts()),
            Err(InferenceError::Malformed(_))
        ));
        assert_eq!(client.stats().calls, 1);
    }

    /// Backend that uses its whole timeout and then reports it.
    struct Stalling {
        timeouts: Mutex<Vec<Duration>>,
    }

    impl InferenceClient for Stalling {
        fn name(&self) -> &str {
            "stalling"
        }

        fn generate(
            &self,
            _prompt: &str,
            opts: &GenerateOptions,
        ) -> Result<String, InferenceError> {
            self.timeouts.lock().expect("lock").push(opts.timeout);
            thread::sleep(opts.timeout);
            Err(InferenceError::Timeout(opts.timeout))
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    #[test]
    fn retries_share_the_caller_timeout() {
        let client = RetryingClient::new(
            Stalling {
                timeouts: Mutex::default(),
            },
            BackoffPolicy::default(),
        );
        let started = Instant::now();
        let err = client
            .generate("prompt", &GenerateOptions::with_timeout(Duration::from_millis(200)))
            .expect_err("timed out");
        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(err.is_timeout());
        let timeouts = client.inner().timeouts.lock().expect("lock").clone();
        assert!(timeouts.iter().all(|t| *t <= Duration::from_millis(200)));
    }

    #[test]
    fn command_backend_requires_a_command() {
        let settings = InferenceSettings {
            backend: BackendKind::Command,
            ..InferenceSettings::default()
        };
        assert!(build_client(&settings).is_err());
    }
}
