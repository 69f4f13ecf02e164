//! Autonomous development loop.
//!
//! A task is handed to a long-running coding agent, the reply is checked
//! locally and graded by a reviewing model, and a confidence score drives a
//! PROCEED / RETRY / CLARIFY / ESCALATE decision until the task is accepted
//! or escalated. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (validation, verdict parsing,
//!   confidence, decisions, budgets, context selection). No I/O.
//! - **[`io`]**: Side effects (agent processes, inference backends, prompt
//!   rendering, config, task storage, git).
//!
//! [`engine`] wires both into the per-task loop; [`agents`] holds the two
//! model-facing roles and [`interaction`] the operator controls.

pub mod agents;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod interaction;
pub mod io;
pub mod logging;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
