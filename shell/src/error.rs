//! Fatal failure taxonomy for the supervisor.
//!
//! Port-clear failures are deliberately absent: they are logged and ignored.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::diagnostic::{self, Hint, Platform};
use crate::core::state::SupervisorState;
use crate::exit_codes;
use crate::io::backend::ExitInfo;
use crate::io::paths::BackendPaths;

/// Preflight validation failures. Fatal, never retried.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "Encryption key not found at: {primary}\n\nNo fallback key at {fallback} either. \
         Please ensure the encryption key file exists at 'keys/encryption.key' next to the backend."
    )]
    MissingKey { primary: PathBuf, fallback: PathBuf },

    #[error(
        "Encryption key not found at: {to}\n\nAttempted to copy from {from} but failed: {source}"
    )]
    CopyKey {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Backend executable not found at: {path}")]
    MissingExecutable { path: PathBuf },

    #[error("Failed to set execute permissions on {path}: {source}")]
    Permission {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("preflight checks did not complete: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

/// Everything that ends the supervisor in `Failed` (plus misuse of its state machine).
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error("Failed to start backend process {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("a backend process (pid {pid:?}) is still tracked as running")]
    AlreadyRunning { pid: Option<u32> },

    #[error("The backend service failed to start in time ({attempts} health checks against {url}).")]
    ReadinessTimeout { attempts: u32, url: String },

    #[error("The backend server exited before it became ready ({exit}).")]
    ExitedEarly { exit: ExitInfo },

    #[error("The backend server stopped unexpectedly ({exit}).")]
    Crashed { exit: ExitInfo },

    #[error("invalid supervisor transition {from} -> {to}")]
    InvalidTransition {
        from: SupervisorState,
        to: SupervisorState,
    },
}

impl SupervisorError {
    /// Dialog title for the fatal diagnostic.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Preflight(PreflightError::MissingKey { .. } | PreflightError::CopyKey { .. }) => {
                "Encryption Key Error"
            }
            _ => "Backend Error",
        }
    }

    /// Shell exit code once this failure has been reported.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Crashed { .. } => exit_codes::BACKEND_CRASHED,
            Self::InvalidTransition { .. } => exit_codes::INVALID,
            _ => exit_codes::STARTUP_FAILED,
        }
    }

    /// Full user-facing diagnostic, including platform troubleshooting hints.
    pub fn diagnostic(&self, paths: &BackendPaths) -> String {
        self.diagnostic_for(paths, Platform::current())
    }

    pub fn diagnostic_for(&self, paths: &BackendPaths, platform: Platform) -> String {
        let hint = match self {
            Self::Preflight(PreflightError::MissingExecutable { .. }) => Hint::MissingExecutable,
            Self::Spawn { path, .. } => Hint::SpawnFailed { executable: path },
            Self::Crashed { .. } | Self::ExitedEarly { .. } => Hint::Crashed {
                database_path: &paths.database_path,
                key_file: &paths.key_file,
            },
            _ => Hint::None,
        };
        diagnostic::render(&self.to_string(), hint, platform)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn paths() -> BackendPaths {
        BackendPaths::new("/opt/b/main", Path::new("/home/u"), "/data", None)
    }

    #[test]
    fn key_errors_use_the_key_title() {
        let err = SupervisorError::from(PreflightError::MissingKey {
            primary: PathBuf::from("/opt/b/keys/encryption.key"),
            fallback: PathBuf::from("/home/u/.securesignin/encryption.key"),
        });
        assert_eq!(err.title(), "Encryption Key Error");
        assert_eq!(err.exit_code(), exit_codes::STARTUP_FAILED);
        let text = err.diagnostic_for(&paths(), Platform::Other);
        assert!(text.contains("/opt/b/keys/encryption.key"));
        assert!(text.contains("/home/u/.securesignin/encryption.key"));
    }

    #[test]
    fn crash_maps_to_crash_exit_code() {
        let err = SupervisorError::Crashed {
            exit: ExitInfo::from_code(2),
        };
        assert_eq!(err.title(), "Backend Error");
        assert_eq!(err.exit_code(), exit_codes::BACKEND_CRASHED);
        assert_eq!(
            err.diagnostic_for(&paths(), Platform::Other),
            "The backend server stopped unexpectedly (code: 2)."
        );
    }

    #[test]
    fn windows_spawn_failure_points_at_the_executable() {
        let err = SupervisorError::Spawn {
            path: PathBuf::from("C:/app/backend/main.exe"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        let text = err.diagnostic_for(&paths(), Platform::Windows);
        assert!(text.contains("Verify the backend executable exists at: C:/app/backend/main.exe"));
    }
}
