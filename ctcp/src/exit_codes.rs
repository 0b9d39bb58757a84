//! Stable exit codes for CLI commands.

/// Run is progressing or cleanly parked (pass, running, or blocked).
pub const OK: i32 = 0;
/// Run failed, or the command itself was invalid.
pub const INVALID: i32 = 1;
