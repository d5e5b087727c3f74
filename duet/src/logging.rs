//! Tracing setup for the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: progress, retries, live agent lines and the
//!   run summary, written to stderr. Filtered by `RUST_LOG` when set.
//!
//! - **Run artifacts (`io/transcript`)**: transcripts and per-attempt logs
//!   under `.orchestrator/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` (e.g. `info`) applies.
///
/// # Example
/// ```bash
/// RUST_LOG=duet=debug duet run --task-file task.md
/// ```
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
