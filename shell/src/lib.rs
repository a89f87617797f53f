//! Desktop shell that supervises the Secure Sign-In backend.
//!
//! The shell frees the backend port, validates the install, spawns the backend,
//! waits for its health endpoint, shows the login page and stops the backend
//! again on exit. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, readiness policy,
//!   diagnostics). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, subprocesses, HTTP).
//!   Each external capability sits behind a trait so tests can script it.
//!
//! [`supervisor`] coordinates core logic with I/O; [`lifecycle`] turns its
//! outcome into what the user sees and the shell's exit code.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod shutdown;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
