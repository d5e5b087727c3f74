//! Two-agent, two-phase approval orchestrator.
//!
//! Two agent CLIs first converge on a plan (phase 1, alignment) and then on an
//! implementation that passes an external test command (phase 2, execution).
//! Every answer must follow a marker protocol before it is accepted. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (marker parsing, finding
//!   bookkeeping, error classification, text bounds). No I/O.
//! - **[`io`]**: Side-effecting collaborators (processes, agent adapters,
//!   config, state and checkpoints, transcripts, git, prompts).
//!
//! [`controller`] wraps single agent attempts in bounded retries with quota
//! fallback, [`phase`] runs the two cycle loops, and [`pipeline`] wires a
//! whole `duet run`.

pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod phase;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
