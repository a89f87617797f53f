//! Secure Sign-In desktop shell.
//!
//! `run` supervises the backend and shows its login page; `check`,
//! `free-port`, `init-config` and `preserve` expose the individual steps for
//! packaging and troubleshooting.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use signin_shell::error::SupervisorError;
use signin_shell::exit_codes;
use signin_shell::io::config::{ShellConfig, default_config_path, load_config, write_config};
use signin_shell::io::paths::BackendPaths;
use signin_shell::io::port::{PortReclaimer, platform_reclaimer};
use signin_shell::io::preflight::run_preflight;
use signin_shell::io::preserve::{
    BackupOutcome, PreservePaths, backup_database, restore_database,
};
use signin_shell::{lifecycle, logging};

#[derive(Parser, Debug)]
#[command(
    name = "signin-shell",
    version,
    about = "Launch and supervise the Secure Sign-In backend"
)]
struct Cli {
    /// Config file (default: <config_dir>/secure-sign-in/shell.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the backend, open the login page, and stop the backend on exit.
    Run {
        /// Backend executable (overrides config and the packaged location).
        #[arg(long)]
        backend: Option<PathBuf>,
        /// Backend port (overrides config).
        #[arg(long)]
        port: Option<u16>,
        /// Print the login URL instead of opening a browser.
        #[arg(long)]
        no_browser: bool,
    },
    /// Run preflight checks and print the resolved backend layout.
    Check {
        #[arg(long)]
        backend: Option<PathBuf>,
    },
    /// Kill whatever is listening on the backend port.
    FreePort {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write the effective config to the config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Back up or restore the database around a rebuild.
    Preserve {
        #[command(subcommand)]
        action: PreserveAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum PreserveAction {
    /// Copy the database to the pre-build backup.
    Backup,
    /// Copy the pre-build backup back into place.
    Restore,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    logging::init();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            backend,
            port,
            no_browser,
        } => {
            let mut cfg = load(cli.config)?;
            if let Some(port) = port {
                cfg.port = port;
            }
            if no_browser {
                cfg.open_browser = false;
            }
            cfg.validate().context("invalid config")?;
            let paths = BackendPaths::resolve(&cfg, backend.as_deref())?;

            let runtime = runtime()?;
            let code = runtime.block_on(lifecycle::run(cfg, paths))?;
            // Dropping the runtime kills a backend that is somehow still attached.
            drop(runtime);
            Ok(code)
        }
        Command::Check { backend } => {
            let cfg = load(cli.config)?;
            cfg.validate().context("invalid config")?;
            cmd_check(&cfg, backend)
        }
        Command::FreePort { port } => {
            let mut cfg = load(cli.config)?;
            if let Some(port) = port {
                cfg.port = port;
            }
            cfg.validate().context("invalid config")?;
            let reclaimer = platform_reclaimer(cfg.port_command_timeout());
            let report = runtime()?.block_on(reclaimer.reclaim(cfg.port))?;
            if report.killed.is_empty() {
                println!("port {} is free", report.port);
            } else {
                println!("port {}: killed {:?}", report.port, report.killed);
            }
            Ok(exit_codes::OK)
        }
        Command::InitConfig { force } => {
            let path = cli
                .config
                .or_else(default_config_path)
                .context("no config directory on this platform; pass --config")?;
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            let cfg = load(Some(path.clone()))?;
            write_config(&path, &cfg)?;
            println!("wrote {}", path.display());
            Ok(exit_codes::OK)
        }
        Command::Preserve { action } => cmd_preserve(action),
    }
}

fn load(path: Option<PathBuf>) -> Result<ShellConfig> {
    match path.or_else(default_config_path) {
        Some(path) => load_config(&path),
        None => Ok(ShellConfig::default()),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

fn cmd_check(cfg: &ShellConfig, backend: Option<PathBuf>) -> Result<i32> {
    let paths = BackendPaths::resolve(cfg, backend.as_deref())?;
    println!("executable:   {}", paths.executable.display());
    println!("key file:     {}", paths.key_file.display());
    println!("fallback key: {}", paths.fallback_key_file.display());
    println!("database:     {}", paths.database_path.display());
    println!("health url:   {}", cfg.health_url());

    match run_preflight(&paths) {
        Ok(report) => {
            for dir in &report.created_dirs {
                println!("created {}", dir.display());
            }
            if let Some(from) = &report.key_copied_from {
                println!("copied encryption key from {}", from.display());
            }
            if report.permissions_fixed {
                println!("made backend executable");
            }
            println!("preflight ok");
            Ok(exit_codes::OK)
        }
        Err(err) => {
            let err = SupervisorError::from(err);
            eprintln!("{}: {}", err.title(), err.diagnostic(&paths));
            Ok(err.exit_code())
        }
    }
}

fn cmd_preserve(action: PreserveAction) -> Result<i32> {
    let paths = PreservePaths::detect()?;
    match action {
        PreserveAction::Backup => match backup_database(&paths)? {
            BackupOutcome::Saved { from, to } => {
                println!("backed up {} to {}", from.display(), to.display());
            }
            BackupOutcome::NothingToBackUp => println!("no database found, nothing to back up"),
        },
        PreserveAction::Restore => match restore_database(&paths, chrono::Utc::now())? {
            Some(report) => {
                for path in &report.restored {
                    println!("restored {}", path.display());
                }
                for (path, reason) in &report.failures {
                    println!("could not restore {}: {reason}", path.display());
                }
                println!("archived {}", report.archived.display());
            }
            None => println!("no backup found, nothing to restore"),
        },
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "signin-shell",
            "--config",
            "/tmp/shell.toml",
            "run",
            "--port",
            "9090",
            "--no-browser",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/shell.toml")));
        match cli.command {
            Command::Run {
                backend,
                port,
                no_browser,
            } => {
                assert!(backend.is_none());
                assert_eq!(port, Some(9090));
                assert!(no_browser);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["signin-shell", "check", "--config", "/tmp/s.toml"])
            .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/s.toml")));
    }

    #[test]
    fn preserve_requires_an_action() {
        assert!(Cli::try_parse_from(["signin-shell", "preserve"]).is_err());
        let cli = Cli::try_parse_from(["signin-shell", "preserve", "restore"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::Preserve {
                action: PreserveAction::Restore
            }
        ));
    }

    #[test]
    fn port_must_be_numeric() {
        assert!(Cli::try_parse_from(["signin-shell", "free-port", "--port", "http"]).is_err());
    }
}
