//! Shell configuration stored in `<config_dir>/secure-sign-in/shell.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::readiness::ReadinessPolicy;

/// Directory name shared by the config file and application data.
pub const APP_DIR_NAME: &str = "secure-sign-in";
const CONFIG_FILE_NAME: &str = "shell.toml";

/// Shell configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values the
/// packaged backend expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    /// Host name used for health checks and the login URL.
    pub host: String,

    /// TCP port the backend listens on.
    pub port: u16,

    pub health_path: String,

    pub login_path: String,

    /// Pause after re-clearing the port when the health endpoint answers before spawn.
    pub recheck_delay_ms: u64,

    /// Upper bound for each port lookup / kill command.
    pub port_command_timeout_secs: u64,

    /// Open the login URL with the system browser once the backend is ready.
    pub open_browser: bool,

    pub readiness: ReadinessConfig,

    pub shutdown: ShutdownConfig,

    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Wait after the graceful signal before escalating to a forceful kill.
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Explicit backend executable. Resolved next to the shell binary when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,

    /// SQLite database path. `SQLITE_DB_PATH` in the shell environment takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        let policy = ReadinessPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            interval_ms: duration_ms(policy.interval),
            probe_timeout_ms: duration_ms(policy.probe_timeout),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 1_000,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            health_path: "/health".to_string(),
            login_path: "/login".to_string(),
            recheck_delay_ms: 1_000,
            port_command_timeout_secs: 10,
            open_browser: true,
            readiness: ReadinessConfig::default(),
            shutdown: ShutdownConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl ShellConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("host must be non-empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("port must be > 0"));
        }
        if !self.health_path.starts_with('/') {
            return Err(anyhow!("health_path must start with '/'"));
        }
        if !self.login_path.starts_with('/') {
            return Err(anyhow!("login_path must start with '/'"));
        }
        if self.port_command_timeout_secs == 0 {
            return Err(anyhow!("port_command_timeout_secs must be > 0"));
        }
        if self.readiness.max_attempts == 0 {
            return Err(anyhow!("readiness.max_attempts must be > 0"));
        }
        if self.readiness.interval_ms == 0 {
            return Err(anyhow!("readiness.interval_ms must be > 0"));
        }
        if self.readiness.probe_timeout_ms == 0 {
            return Err(anyhow!("readiness.probe_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn health_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.health_path)
    }

    pub fn login_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.login_path)
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            max_attempts: self.readiness.max_attempts,
            interval: Duration::from_millis(self.readiness.interval_ms),
            probe_timeout: Duration::from_millis(self.readiness.probe_timeout_ms),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }

    pub fn recheck_delay(&self) -> Duration {
        Duration::from_millis(self.recheck_delay_ms)
    }

    pub fn port_command_timeout(&self) -> Duration {
        Duration::from_secs(self.port_command_timeout_secs)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Default config location, `None` when the platform has no config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ShellConfig::default()`.
pub fn load_config(path: &Path) -> Result<ShellConfig> {
    if !path.exists() {
        let cfg = ShellConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ShellConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ShellConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ShellConfig::default());
    }

    #[test]
    fn write_then_load_preserves_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("shell.toml");
        let cfg = ShellConfig {
            port: 9191,
            backend: BackendConfig {
                executable: Some(PathBuf::from("/opt/backend/main")),
                database_path: None,
            },
            ..ShellConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("shell.toml");
        fs::write(&path, "port = 9000\n[readiness]\nmax_attempts = 5\n").expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.readiness.max_attempts, 5);
        assert_eq!(cfg.readiness.interval_ms, 1_000);
        assert_eq!(cfg.health_url(), "http://localhost:9000/health");
        assert_eq!(cfg.login_url(), "http://localhost:9000/login");
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("shell.toml");
        fs::write(&path, "[readiness]\nmax_attempts = 0\n").expect("write");

        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("max_attempts"));
    }

    #[test]
    fn relative_health_path_is_rejected() {
        let cfg = ShellConfig {
            health_path: "health".to_string(),
            ..ShellConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
