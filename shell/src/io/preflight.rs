//! Checks run before the backend is spawned.
//!
//! Order matters: directories first (the key copy needs `keys/`), then the
//! encryption key, then the executable and its permissions.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, instrument, warn};

use super::paths::BackendPaths;
use crate::error::PreflightError;

/// What preflight had to repair on the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub created_dirs: Vec<PathBuf>,
    /// Set when the key was copied from the fallback location.
    pub key_copied_from: Option<PathBuf>,
    pub permissions_fixed: bool,
}

/// Validate (and where possible repair) the backend install.
#[instrument(skip_all, fields(executable = %paths.executable.display()))]
pub fn run_preflight(paths: &BackendPaths) -> Result<PreflightReport, PreflightError> {
    let mut report = PreflightReport::default();

    for dir in paths.required_dirs() {
        if dir.is_dir() {
            continue;
        }
        info!(path = %dir.display(), "creating directory");
        fs::create_dir_all(&dir).map_err(|source| PreflightError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        report.created_dirs.push(dir);
    }

    report.key_copied_from = ensure_key(paths)?;

    if !paths.executable.is_file() {
        error!(path = %paths.executable.display(), "backend executable not found");
        return Err(PreflightError::MissingExecutable {
            path: paths.executable.clone(),
        });
    }

    report.permissions_fixed = ensure_executable(&paths.executable)?;
    debug!(?report, "preflight passed");
    Ok(report)
}

fn ensure_key(paths: &BackendPaths) -> Result<Option<PathBuf>, PreflightError> {
    if paths.key_file.is_file() {
        return Ok(None);
    }
    warn!(path = %paths.key_file.display(), "encryption key not found");

    if !paths.fallback_key_file.is_file() {
        return Err(PreflightError::MissingKey {
            primary: paths.key_file.clone(),
            fallback: paths.fallback_key_file.clone(),
        });
    }

    info!(
        from = %paths.fallback_key_file.display(),
        to = %paths.key_file.display(),
        "copying fallback encryption key"
    );
    fs::copy(&paths.fallback_key_file, &paths.key_file).map_err(|source| {
        PreflightError::CopyKey {
            from: paths.fallback_key_file.clone(),
            to: paths.key_file.clone(),
            source,
        }
    })?;
    Ok(Some(paths.fallback_key_file.clone()))
}

/// Make sure the backend can be executed. Returns true if permissions were changed.
#[cfg(unix)]
fn ensure_executable(path: &Path) -> Result<bool, PreflightError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).map_err(|source| PreflightError::Permission {
        path: path.to_path_buf(),
        source,
    })?;
    if metadata.permissions().mode() & 0o111 != 0 {
        return Ok(false);
    }

    warn!(path = %path.display(), "backend executable lacks execute permission, fixing");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|source| {
        PreflightError::Permission {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(true)
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> Result<bool, PreflightError> {
    Ok(false)
}
