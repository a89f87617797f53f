//! The backend supervisor: one state machine, one child process, one port.
//!
//! Each phase method moves the supervisor forward and returns the state it
//! left it in. Fatal failures come back as [`SupervisorError`] with the
//! supervisor already in [`SupervisorState::Failed`] and any child torn down.

use std::sync::Arc;

use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::core::state::{SupervisorState, can_transition};
use crate::error::{PreflightError, SupervisorError};
use crate::io::backend::{
    BackendChild, BackendCommand, BackendEvent, BackendLauncher, EventReceiver, ExitInfo,
    SupervisedProcess,
};
use crate::io::config::ShellConfig;
use crate::io::health::HealthProbe;
use crate::io::paths::BackendPaths;
use crate::io::port::PortReclaimer;
use crate::io::preflight::run_preflight;
use crate::shutdown::ShutdownLatch;

pub type PhaseResult = Result<SupervisorState, SupervisorError>;

pub struct Supervisor<R, H, L: BackendLauncher> {
    config: ShellConfig,
    paths: BackendPaths,
    reclaimer: R,
    probe: H,
    launcher: L,
    latch: Arc<ShutdownLatch>,
    state: SupervisorState,
    history: Vec<SupervisorState>,
    process: SupervisedProcess<L::Child>,
    events: Option<EventReceiver>,
    readiness_attempts: u32,
}

impl<R, H, L> Supervisor<R, H, L>
where
    R: PortReclaimer,
    H: HealthProbe,
    L: BackendLauncher,
{
    pub fn new(
        config: ShellConfig,
        paths: BackendPaths,
        reclaimer: R,
        probe: H,
        launcher: L,
        latch: Arc<ShutdownLatch>,
    ) -> Self {
        let command = BackendCommand::from_paths(&paths);
        Self {
            config,
            paths,
            reclaimer,
            probe,
            launcher,
            latch,
            state: SupervisorState::Idle,
            history: vec![SupervisorState::Idle],
            process: SupervisedProcess::new(command),
            events: None,
            readiness_attempts: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[SupervisorState] {
        &self.history
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn paths(&self) -> &BackendPaths {
        &self.paths
    }

    pub fn latch(&self) -> &Arc<ShutdownLatch> {
        &self.latch
    }

    pub fn process(&self) -> &SupervisedProcess<L::Child> {
        &self.process
    }

    /// Health probes issued by the last readiness wait.
    pub fn readiness_attempts(&self) -> u32 {
        self.readiness_attempts
    }

    /// Clear the port, validate, spawn and wait for readiness.
    ///
    /// Returns `Ready` on success. Any other `Ok` state means a quit request
    /// interrupted startup and [`Self::shutdown`] should follow.
    pub async fn start(&mut self) -> PhaseResult {
        if self.latch.is_quitting() {
            info!("quit requested before startup");
            return Ok(self.state);
        }
        self.clear_port().await?;
        self.validate().await?;
        self.spawn().await?;
        self.await_ready().await
    }

    pub async fn clear_port(&mut self) -> PhaseResult {
        self.transition(SupervisorState::ClearingPort)?;
        self.reclaim_port().await;
        Ok(self.state)
    }

    pub async fn validate(&mut self) -> PhaseResult {
        self.transition(SupervisorState::Validating)?;
        let paths = self.paths.clone();
        let preflight = tokio::task::spawn_blocking(move || run_preflight(&paths))
            .await
            .map_err(PreflightError::from)
            .and_then(|result| result);
        match preflight {
            Ok(report) => {
                debug!(?report, "preflight passed");
                Ok(self.state)
            }
            Err(err) => Err(self.fail(err.into()).await),
        }
    }

    pub async fn spawn(&mut self) -> PhaseResult {
        self.transition(SupervisorState::Spawning)?;

        if self.process.is_live() {
            let pid = self.process.pid();
            return Err(self.fail(SupervisorError::AlreadyRunning { pid }).await);
        }

        if self.probe.probe().await {
            warn!(
                port = self.config.port,
                "health endpoint answered before spawn, clearing port again"
            );
            self.reclaim_port().await;
            sleep(self.config.recheck_delay()).await;
        }

        let command = self.process.command.clone();
        match self.launcher.launch(&command).await {
            Ok((child, events)) => {
                info!(pid = ?child.pid(), "backend started");
                self.process.attach(child);
                self.events = Some(events);
                Ok(self.state)
            }
            Err(source) => {
                let err = SupervisorError::Spawn {
                    path: command.program,
                    source,
                };
                Err(self.fail(err).await)
            }
        }
    }

    /// Poll the health endpoint until it answers, the budget runs out, the
    /// backend exits, or quit is requested (returns `AwaitingReady`).
    pub async fn await_ready(&mut self) -> PhaseResult {
        self.transition(SupervisorState::AwaitingReady)?;
        let policy = self.config.readiness_policy();
        self.readiness_attempts = 0;
        debug!(
            max_attempts = policy.max_attempts,
            budget_ms = policy.worst_case().as_millis() as u64,
            "waiting for backend health"
        );

        loop {
            if self.latch.is_quitting() {
                info!(
                    attempts = self.readiness_attempts,
                    "quit requested while waiting for backend"
                );
                return Ok(self.state);
            }
            if let Some(exit) = self.drain_events() {
                self.process.release(Some(exit));
                return Err(self.fail(SupervisorError::ExitedEarly { exit }).await);
            }

            self.readiness_attempts += 1;
            let attempt = self.readiness_attempts;
            let healthy = timeout(policy.probe_timeout, self.probe.probe())
                .await
                .unwrap_or(false);
            if healthy {
                info!(attempt, url = %self.config.health_url(), "backend ready");
                self.transition(SupervisorState::Ready)?;
                return Ok(self.state);
            }
            debug!(attempt, "backend not ready yet");

            if !policy.has_next(attempt) {
                break;
            }
            let latch = Arc::clone(&self.latch);
            tokio::select! {
                () = sleep(policy.interval) => {}
                () = latch.quit_requested() => {}
            }
        }

        let err = SupervisorError::ReadinessTimeout {
            attempts: self.readiness_attempts,
            url: self.config.health_url(),
        };
        Err(self.fail(err).await)
    }

    /// Forward backend output until quit is requested or the backend exits.
    ///
    /// A clean exit requests quit; any other exit while not quitting is a crash.
    pub async fn supervise(&mut self) -> PhaseResult {
        if self.state != SupervisorState::Ready {
            return Ok(self.state);
        }
        let latch = Arc::clone(&self.latch);

        loop {
            let Some(events) = self.events.as_mut() else {
                latch.quit_requested().await;
                return Ok(self.state);
            };
            let next = tokio::select! {
                biased;
                () = latch.quit_requested() => None,
                event = events.recv() => Some(event),
            };
            match next {
                None => return Ok(self.state),
                Some(Some(BackendEvent::Exited(exit))) => return self.on_exit(exit).await,
                Some(Some(event)) => log_output(&event),
                Some(None) => {
                    warn!("backend event channel closed without an exit status");
                    return self.on_exit(ExitInfo::unknown()).await;
                }
            }
        }
    }

    /// Stop the backend and release the port. Only the first call does work.
    ///
    /// Called in the middle of startup (before `AwaitingReady`), the
    /// supervisor cannot enter `Terminating`: it fails instead, still
    /// stopping any launched child and clearing the port.
    pub async fn shutdown(&mut self) -> PhaseResult {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        let from = self.state;
        if !can_transition(from, SupervisorState::Terminating) {
            self.latch.request_quit();
            let err = SupervisorError::InvalidTransition {
                from,
                to: SupervisorState::Terminating,
            };
            if self.process.was_launched() {
                return Err(self.fail(err).await);
            }
            warn!(state = %from, "shutdown requested mid-startup");
            if self.latch.try_begin_termination() {
                self.reclaim_port().await;
            }
            return Err(err);
        }
        if !self.latch.try_begin_termination() {
            debug!(state = %self.state, "termination already in progress");
            return Ok(self.state);
        }
        self.latch.request_quit();
        self.transition(SupervisorState::Terminating)?;
        self.stop_child().await;
        self.reclaim_port().await;
        self.transition(SupervisorState::Terminated)?;
        info!("backend supervisor terminated");
        Ok(self.state)
    }

    async fn on_exit(&mut self, exit: ExitInfo) -> PhaseResult {
        self.process.release(Some(exit));
        self.events = None;
        if self.latch.is_quitting() {
            debug!(%exit, "backend exited during quit");
            return Ok(self.state);
        }
        if exit.is_clean() {
            info!("backend exited cleanly, quitting");
            self.latch.request_quit();
            return Ok(self.state);
        }
        error!(%exit, "backend stopped unexpectedly");
        Err(self.fail(SupervisorError::Crashed { exit }).await)
    }

    fn transition(&mut self, to: SupervisorState) -> Result<(), SupervisorError> {
        let from = self.state;
        if !can_transition(from, to) {
            return Err(SupervisorError::InvalidTransition { from, to });
        }
        info!(%from, %to, "supervisor state");
        self.state = to;
        self.history.push(to);
        Ok(())
    }

    /// Enter `Failed` and tear down whatever was launched.
    async fn fail(&mut self, err: SupervisorError) -> SupervisorError {
        error!(state = %self.state, err = %err, "backend supervisor failed");
        if let Err(invalid) = self.transition(SupervisorState::Failed) {
            warn!(err = %invalid, "could not record failure state");
        }
        if self.process.was_launched() && self.latch.try_begin_termination() {
            self.stop_child().await;
            self.reclaim_port().await;
        }
        err
    }

    /// Graceful stop, bounded wait, then a forced kill if still running.
    async fn stop_child(&mut self) {
        let grace = self.config.grace_period();
        if let Some(child) = self.process.handle_mut()
            && child.is_running()
        {
            let pid = child.pid();
            info!(pid = ?pid, "stopping backend");
            if let Err(err) = child.terminate().await {
                warn!(pid = ?pid, err = %format!("{err:#}"), "graceful stop failed");
            }
            let _ = timeout(grace, child.wait_exit()).await;

            if child.is_running() {
                warn!(pid = ?pid, grace_ms = grace.as_millis() as u64, "backend still running, killing");
                if let Err(err) = child.kill().await {
                    warn!(pid = ?pid, err = %format!("{err:#}"), "kill failed");
                }
                let _ = timeout(grace, child.wait_exit()).await;
            }
        }

        let exit = self.process.handle_mut().and_then(|child| child.exit_info());
        if let Some(exit) = exit {
            debug!(%exit, "backend stopped");
        }
        self.process.release(exit);
        self.drain_events();
        self.events = None;
    }

    /// Best effort: failures are logged and ignored.
    async fn reclaim_port(&self) {
        let port = self.config.port;
        match self.reclaimer.reclaim(port).await {
            Ok(report) if !report.killed.is_empty() => {
                info!(port, killed = ?report.killed, "port cleared");
            }
            Ok(_) => debug!(port, "port already free"),
            Err(err) => warn!(port, err = %format!("{err:#}"), "failed to clear port, continuing"),
        }
    }

    /// Log pending output. Returns the exit status if the backend has exited.
    fn drain_events(&mut self) -> Option<ExitInfo> {
        let events = self.events.as_mut()?;
        while let Ok(event) = events.try_recv() {
            if let BackendEvent::Exited(exit) = event {
                return Some(exit);
            }
            log_output(&event);
        }
        None
    }
}

fn log_output(event: &BackendEvent) {
    match event {
        BackendEvent::Stdout(line) => info!(target: "backend", "{line}"),
        BackendEvent::Stderr(line) => warn!(target: "backend", "{line}"),
        BackendEvent::Exited(_) => {}
    }
}
