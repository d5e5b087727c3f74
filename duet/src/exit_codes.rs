//! Stable exit codes for `duet` commands.

/// Command succeeded; for `run`, both phases completed.
pub const OK: i32 = 0;
/// Invalid config or layout, a failed phase, or any other error.
pub const FAILED: i32 = 1;
/// The run froze on a quota or rate limit; resume later with `--resume`.
pub const FROZEN: i32 = 2;
