//! Deterministic, pure logic for the iteration loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod confidence;
pub mod context_budget;
pub mod decision;
pub mod deliverable;
pub mod dependencies;
pub mod retry;
pub mod types;
pub mod validator;
pub mod verdict;
