//! Stable exit codes for `signin-shell` commands.

/// Command succeeded, or the shell quit after a clean backend shutdown.
pub const OK: i32 = 0;
/// Invalid invocation or configuration, or a helper command failed.
pub const INVALID: i32 = 1;
/// The backend never became ready (preflight, spawn, readiness timeout, early exit).
pub const STARTUP_FAILED: i32 = 2;
/// The backend stopped unexpectedly while the shell was running.
pub const BACKEND_CRASHED: i32 = 3;
