//! Side-effecting collaborators: processes, agents, files, git and prompts.

pub mod agents;
pub mod atomic;
pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod git;
pub mod paths;
pub mod preflight;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod test_runner;
pub mod transcript;
