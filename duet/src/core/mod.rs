//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod classify;
pub mod contract;
pub mod findings;
pub mod path;
pub mod report;
pub mod text;
pub mod types;
