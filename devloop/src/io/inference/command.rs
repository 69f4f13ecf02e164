//! One-shot command backend: prompt on stdin, completion on stdout.

use std::process::Command;
use std::time::Duration;

use tracing::{instrument, warn};

use super::{GenerateOptions, InferenceClient};
use crate::core::budget::tail_chars;
use crate::error::InferenceError;
use crate::io::process::run_command_with_timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CommandInferenceClient {
    command: Vec<String>,
    output_limit_bytes: usize,
    name: String,
}

impl CommandInferenceClient {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        let name = format!(
            "command:{}",
            command.first().map(String::as_str).unwrap_or_default()
        );
        Self {
            command,
            output_limit_bytes,
            name,
        }
    }

    fn build(&self) -> Result<Command, InferenceError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| InferenceError::Unavailable("inference command is empty".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl InferenceClient for CommandInferenceClient {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        skip_all,
        fields(
            backend = %self.name,
            timeout_ms = opts.timeout.as_millis() as u64
        )
    )]
    fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String, InferenceError> {
        let cmd = self.build()?;
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            opts.timeout,
            self.output_limit_bytes,
        )
        .map_err(|e| InferenceError::Unavailable(format!("{e:#}")))?;

        if output.timed_out {
            return Err(InferenceError::Timeout(opts.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(code = ?output.status.code(), "inference command failed");
            return Err(InferenceError::Exit {
                code: output.status.code(),
                stderr: tail_chars(stderr.trim(), 500).to_string(),
            });
        }
        Ok(output.stdout_lossy())
    }

    /// Runs the program with `--version`.
    fn is_available(&self) -> bool {
        let Ok(mut cmd) = self.build() else {
            return false;
        };
        cmd.arg("--version");
        run_command_with_timeout(cmd, None, PROBE_TIMEOUT, 4_096)
            .map(|out| out.status.success() && !out.timed_out)
            .unwrap_or(false)
    }
}
