//! Filesystem layout of the backend and its supporting files.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::config::{APP_DIR_NAME, ShellConfig};

/// Environment variable that overrides the database path for both shell and backend.
pub const SQLITE_DB_PATH_ENV: &str = "SQLITE_DB_PATH";

const USER_DATA_DIR_NAME: &str = ".securesignin";
const DATABASE_FILE_NAME: &str = "securesignin.db";
const KEY_DIR_NAME: &str = "keys";
const KEY_FILE_NAME: &str = "encryption.key";

/// File name of the backend binary on this platform.
pub fn executable_name() -> &'static str {
    if cfg!(windows) { "main.exe" } else { "main" }
}

/// All canonical paths the supervisor touches for one backend install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPaths {
    pub executable: PathBuf,
    /// Directory containing the executable; the backend's working directory.
    pub backend_dir: PathBuf,
    pub key_dir: PathBuf,
    pub key_file: PathBuf,
    /// `<home>/.securesignin`
    pub user_data_dir: PathBuf,
    /// Key copied into `key_file` when the bundled key is missing.
    pub fallback_key_file: PathBuf,
    pub database_path: PathBuf,
    /// Per-user application data directory for the shell itself.
    pub app_data_dir: PathBuf,
}

impl BackendPaths {
    pub fn new(
        executable: impl Into<PathBuf>,
        home: &Path,
        app_data_dir: impl Into<PathBuf>,
        database_override: Option<PathBuf>,
    ) -> Self {
        let executable = executable.into();
        let backend_dir = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let key_dir = backend_dir.join(KEY_DIR_NAME);
        let user_data_dir = home.join(USER_DATA_DIR_NAME);
        Self {
            executable,
            backend_dir,
            key_file: key_dir.join(KEY_FILE_NAME),
            key_dir,
            fallback_key_file: user_data_dir.join(KEY_FILE_NAME),
            database_path: database_override
                .unwrap_or_else(|| user_data_dir.join(DATABASE_FILE_NAME)),
            user_data_dir,
            app_data_dir: app_data_dir.into(),
        }
    }

    /// Resolve the layout for this machine from CLI override, config, and environment.
    pub fn resolve(cfg: &ShellConfig, executable_override: Option<&Path>) -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
        let app_data_dir = dirs::data_dir()
            .unwrap_or_else(|| home.join(".local").join("share"))
            .join(APP_DIR_NAME);

        let executable = match executable_override.or(cfg.backend.executable.as_deref()) {
            Some(path) => path.to_path_buf(),
            None => {
                let shell_exe = std::env::current_exe().context("locate shell executable")?;
                let shell_dir = shell_exe
                    .parent()
                    .ok_or_else(|| anyhow!("shell executable has no parent directory"))?;
                default_executable(shell_dir)
            }
        };

        let database = std::env::var_os(SQLITE_DB_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| cfg.backend.database_path.clone());

        let paths = Self::new(executable, &home, app_data_dir, database);
        debug!(
            executable = %paths.executable.display(),
            database = %paths.database_path.display(),
            key_file = %paths.key_file.display(),
            "resolved backend paths"
        );
        Ok(paths)
    }

    /// Directories that must exist before the backend starts, in creation order.
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        let mut required = vec![self.app_data_dir.clone(), self.user_data_dir.clone()];
        if let Some(parent) = self.database_path.parent()
            && !parent.as_os_str().is_empty()
        {
            required.push(parent.to_path_buf());
        }
        required.push(self.key_dir.clone());
        required.dedup();
        required
    }

    /// Environment layered over the inherited one when spawning the backend.
    pub fn backend_env(&self) -> Vec<(String, OsString)> {
        vec![
            ("USE_SQLITE".to_string(), OsString::from("1")),
            (
                SQLITE_DB_PATH_ENV.to_string(),
                self.database_path.clone().into_os_string(),
            ),
            ("KEY_DIR".to_string(), self.key_dir.clone().into_os_string()),
            ("KEY_FILE".to_string(), self.key_file.clone().into_os_string()),
        ]
    }
}

/// Pick the backend executable relative to the shell binary.
///
/// Prefers the packaged layout (`<shell-dir>/backend/main`), then a binary next
/// to the shell. When neither exists the packaged path is returned so preflight
/// reports where the backend was expected.
pub fn default_executable(shell_dir: &Path) -> PathBuf {
    let packaged = shell_dir.join("backend").join(executable_name());
    let sibling = shell_dir.join(executable_name());
    if packaged.exists() {
        packaged
    } else if sibling.exists() {
        sibling
    } else {
        packaged
    }
}
