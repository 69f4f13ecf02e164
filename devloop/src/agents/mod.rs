//! The two external roles the loop drives each iteration: the coding agent
//! and the quality reviewer.

pub mod executor;
pub mod scorer;

pub use executor::{ExecutionAttempt, ExecutorAgent};
pub use scorer::QualityScorer;
