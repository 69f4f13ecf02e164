//! Side-effecting adapters: processes, inference backends, files and git.

pub mod config;
pub mod deliverables;
pub mod git;
pub mod inference;
pub mod init;
pub mod iteration_log;
pub mod process;
pub mod prompt;
pub mod repository;
pub mod session;
