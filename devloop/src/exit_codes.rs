//! Stable exit codes for devloop CLI commands.

/// Command succeeded; for `run`, the task was accepted.
pub const OK: i32 = 0;
/// Invalid arguments, config or state, or any other command error.
pub const INVALID: i32 = 1;
/// `run` ended PARTIAL or SUCCESS_WITH_LIMITS.
pub const PARTIAL: i32 = 2;
/// `run` ended FAILED.
pub const FAILED: i32 = 3;
/// `run` was stopped by the operator; the task is PAUSED and resumable.
pub const STOPPED: i32 = 4;
/// `run` could not start: unmet or cyclic dependencies.
pub const BLOCKED: i32 = 5;
/// The agent could not be started or recovered.
pub const FATAL: i32 = 6;
