//! Typed errors crossing the engine's classification boundaries.
//!
//! File and config helpers stay on `anyhow`; these enums exist where callers
//! need to branch on the kind of failure.

use std::time::Duration;

use thiserror::Error;

use crate::task::TaskId;

/// How the engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Single call failure; retried at the call layer.
    Transient,
    /// Bad or missing output; fed into the decision flow as a validation failure.
    Structural,
    /// Never auto-retried; the task ends FAILED or BLOCKED.
    Fatal,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent failed to start: {reason}")]
    Startup { reason: String },

    #[error("agent produced no completion within {timeout:?}")]
    Timeout { timeout: Duration, partial: String },

    #[error("agent process exited unexpectedly ({status})")]
    Crashed { status: String },

    #[error("agent i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent session is not running")]
    NotRunning,

    #[error("agent unrecoverable after {attempts} restart attempts: {last}")]
    Unrecoverable { attempts: u32, last: String },
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Crashed { .. } | Self::Io(_) | Self::NotRunning => ErrorClass::Transient,
            Self::Timeout { .. } => ErrorClass::Structural,
            Self::Startup { .. } | Self::Unrecoverable { .. } => ErrorClass::Fatal,
        }
    }

    /// Whether a process restart can clear this error.
    pub(crate) fn needs_restart(&self) -> bool {
        matches!(
            self,
            Self::Crashed { .. } | Self::Io(_) | Self::NotRunning | Self::Startup { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference call timed out after {0:?}")]
    Timeout(Duration),

    #[error("inference backend unavailable: {0}")]
    Unavailable(String),

    #[error("inference transport failure: {0}")]
    Transport(String),

    #[error("inference backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference command exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("inference response malformed: {0}")]
    Malformed(String),

    #[error("inference failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<InferenceError>,
    },
}

impl InferenceError {
    /// Failures worth another attempt with the same request.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) | Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Exit { .. } | Self::Malformed(_) | Self::Exhausted { .. } => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Exhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Malformed(_) => ErrorClass::Structural,
            Self::Exhausted { .. } | Self::Exit { .. } => ErrorClass::Fatal,
            other if other.is_transient() => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task '{0}' not found")]
    TaskNotFound(TaskId),

    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<TaskId>),

    #[error("task '{0}' is already running")]
    AlreadyRunning(TaskId),

    #[error("task '{task}': {source}")]
    Agent {
        task: TaskId,
        #[source]
        source: AgentError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Repository, prompt rendering and other failures outside the loop's control.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_errors_classify_by_recoverability() {
        let crashed = AgentError::Crashed {
            status: "exit status: 1".to_string(),
        };
        assert_eq!(crashed.class(), ErrorClass::Transient);
        assert!(crashed.needs_restart());

        let timeout = AgentError::Timeout {
            timeout: Duration::from_secs(1),
            partial: "half".to_string(),
        };
        assert_eq!(timeout.class(), ErrorClass::Structural);
        assert!(!timeout.needs_restart());

        let gone = AgentError::Unrecoverable {
            attempts: 3,
            last: "boom".to_string(),
        };
        assert_eq!(gone.class(), ErrorClass::Fatal);
    }

    #[test]
    fn inference_status_codes_split_transient_and_fatal() {
        let throttled = InferenceError::Status {
            status: 429,
            body: String::new(),
        };
        let missing = InferenceError::Status {
            status: 404,
            body: String::new(),
        };
        assert!(throttled.is_transient());
        assert!(!missing.is_transient());
        assert_eq!(missing.class(), ErrorClass::Fatal);
    }

    #[test]
    fn exhausted_timeout_is_still_a_timeout() {
        let err = InferenceError::Exhausted {
            attempts: 3,
            last: Box::new(InferenceError::Timeout(Duration::from_millis(5))),
        };
        assert!(err.is_timeout());
        assert!(!err.is_transient());
    }

    #[test]
    fn cycle_error_renders_path() {
        let err = EngineError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }
}
