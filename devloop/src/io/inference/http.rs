//! Ollama-compatible `/api/generate` backend.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{GenerateOptions, InferenceClient};
use crate::error::InferenceError;

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ModelOptions>,
}

#[derive(Debug, Serialize)]
struct ModelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

pub struct HttpInferenceClient {
    client: Client,
    base_url: String,
    model: String,
    name: String,
}

impl HttpInferenceClient {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            name: format!("http:{model}"),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn classify(err: &reqwest::Error, timeout: Duration) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout(timeout)
    } else if err.is_connect() {
        InferenceError::Unavailable(err.to_string())
    } else if err.is_decode() {
        InferenceError::Malformed(err.to_string())
    } else {
        InferenceError::Transport(err.to_string())
    }
}

impl InferenceClient for HttpInferenceClient {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        skip_all,
        fields(
            model = %self.model,
            timeout_ms = opts.timeout.as_millis() as u64
        )
    )]
    fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String, InferenceError> {
        let options = (opts.temperature.is_some() || opts.max_tokens.is_some()).then_some(
            ModelOptions {
                temperature: opts.temperature,
                num_predict: opts.max_tokens,
            },
        );
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options,
        };

        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .timeout(opts.timeout)
            .json(&request)
            .send()
            .map_err(|e| classify(&e, opts.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response.json().map_err(|e| classify(&e, opts.timeout))?;
        debug!(done = parsed.done, len = parsed.response.len(), "inference response");
        Ok(parsed.response)
    }

    fn is_available(&self) -> bool {
        self.client
            .get(self.endpoint("/api/tags"))
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
