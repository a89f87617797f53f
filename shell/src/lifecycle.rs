//! Shell lifecycle: start the backend, show the login page, wait for quit,
//! shut down. Every fatal path shows one diagnostic and yields an exit code.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::state::SupervisorState;
use crate::error::SupervisorError;
use crate::exit_codes;
use crate::io::backend::{BackendLauncher, ProcessLauncher};
use crate::io::config::ShellConfig;
use crate::io::health::{HealthProbe, HttpHealthProbe};
use crate::io::paths::BackendPaths;
use crate::io::port::{PortReclaimer, platform_reclaimer};
use crate::io::presenter::{BrowserPresenter, ConsolePresenter, Presenter};
use crate::shutdown::ShutdownLatch;
use crate::supervisor::Supervisor;

/// Drive one supervisor from `Idle` to a terminal state and return the shell exit code.
pub async fn run_shell<R, H, L>(
    supervisor: &mut Supervisor<R, H, L>,
    presenter: &dyn Presenter,
) -> i32
where
    R: PortReclaimer,
    H: HealthProbe,
    L: BackendLauncher,
{
    match supervisor.start().await {
        Ok(SupervisorState::Ready) => {
            let url = supervisor.config().login_url();
            if let Err(err) = presenter.open_window(&url).await {
                warn!(url, err = %format!("{err:#}"), "could not show login page");
            }
            if let Err(err) = supervisor.supervise().await {
                return report_fatal(supervisor.paths(), presenter, &err);
            }
        }
        Ok(state) => info!(%state, "startup interrupted"),
        Err(err) => return report_fatal(supervisor.paths(), presenter, &err),
    }

    match supervisor.shutdown().await {
        Ok(_) => exit_codes::OK,
        Err(err) => report_fatal(supervisor.paths(), presenter, &err),
    }
}

fn report_fatal(paths: &BackendPaths, presenter: &dyn Presenter, err: &SupervisorError) -> i32 {
    error!(err = %err, "fatal backend error");
    presenter.show_error(err.title(), &err.diagnostic(paths));
    err.exit_code()
}

/// Wire the real components together and run the shell.
pub async fn run(config: ShellConfig, paths: BackendPaths) -> Result<i32> {
    let latch = ShutdownLatch::new();
    let listener = spawn_signal_listener(Arc::clone(&latch));

    let policy = config.readiness_policy();
    let probe = HttpHealthProbe::new(config.health_url(), policy.probe_timeout)
        .context("create health probe")?;
    let control_timeout = config.port_command_timeout();
    let presenter: Box<dyn Presenter> = if config.open_browser {
        Box::new(BrowserPresenter::default())
    } else {
        Box::new(ConsolePresenter)
    };

    info!(
        port = config.port,
        executable = %paths.executable.display(),
        "starting Secure Sign-In shell"
    );
    let mut supervisor = Supervisor::new(
        config,
        paths,
        platform_reclaimer(control_timeout),
        probe,
        ProcessLauncher::new(control_timeout),
        latch,
    );
    let code = run_shell(&mut supervisor, presenter.as_ref()).await;
    listener.abort();
    Ok(code)
}

/// Turn Ctrl-C (and SIGTERM on Unix) into a quit request.
pub fn spawn_signal_listener(latch: Arc<ShutdownLatch>) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(stream) => Some(stream),
                Err(err) => {
                    warn!(err = %err, "failed to install SIGTERM handler");
                    None
                }
            }
        };

        loop {
            #[cfg(unix)]
            let name = tokio::select! {
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => "SIGINT",
                    Err(err) => {
                        warn!(err = %err, "failed to listen for Ctrl-C");
                        return;
                    }
                },
                () = recv_or_pending(&mut sigterm) => "SIGTERM",
            };
            #[cfg(not(unix))]
            let name = match tokio::signal::ctrl_c().await {
                Ok(()) => "Ctrl-C",
                Err(err) => {
                    warn!(err = %err, "failed to listen for Ctrl-C");
                    return;
                }
            };

            if latch.request_quit() {
                info!(signal = name, "quit requested");
            } else {
                warn!(signal = name, "already shutting down, signal ignored");
            }
        }
    })
}

#[cfg(unix)]
async fn recv_or_pending(signal: &mut Option<tokio::signal::unix::Signal>) {
    match signal {
        Some(stream) => {
            if stream.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}
