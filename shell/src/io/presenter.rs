//! Where the login page and fatal diagnostics are shown.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};

use super::process::run_control_command;

const OPENER_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Presenter: Send + Sync {
    /// Show the backend's login page.
    async fn open_window(&self, url: &str) -> Result<()>;

    /// Blocking fatal diagnostic.
    fn show_error(&self, title: &str, message: &str);
}

/// Prints the URL and diagnostics to the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolePresenter;

#[async_trait]
impl Presenter for ConsolePresenter {
    async fn open_window(&self, url: &str) -> Result<()> {
        println!("Secure Sign-In is running at {url}");
        Ok(())
    }

    fn show_error(&self, title: &str, message: &str) {
        eprintln!("{title}: {message}");
    }
}

/// Opens the URL with the platform's default browser, falling back to the console.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserPresenter {
    console: ConsolePresenter,
}

impl BrowserPresenter {
    fn opener(url: &str) -> Result<Command> {
        let (program, prefix): (&str, &[&str]) = if cfg!(windows) {
            ("cmd", &["/C", "start", ""])
        } else if cfg!(target_os = "macos") {
            ("open", &[])
        } else {
            ("xdg-open", &[])
        };
        let resolved =
            which::which(program).with_context(|| format!("{program} not found on PATH"))?;
        let mut cmd = Command::new(resolved);
        cmd.args(prefix).arg(url);
        Ok(cmd)
    }
}

#[async_trait]
impl Presenter for BrowserPresenter {
    async fn open_window(&self, url: &str) -> Result<()> {
        let opened = async {
            let output = run_control_command(Self::opener(url)?, OPENER_TIMEOUT).await?;
            if !output.status.success() {
                bail!("browser opener failed: {}", output.stderr_text());
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match opened {
            Ok(()) => {
                info!(url, "opened login page");
                Ok(())
            }
            Err(err) => {
                warn!(url, err = %format!("{err:#}"), "could not open browser");
                self.console.open_window(url).await
            }
        }
    }

    fn show_error(&self, title: &str, message: &str) {
        self.console.show_error(title, message);
    }
}
