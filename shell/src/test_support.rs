//! Test helpers: a temporary backend install and a scripted world of fakes
//! standing in for the port, the health endpoint and the backend process.

use std::fs;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::io::backend::{
    BackendChild, BackendCommand, BackendEvent, BackendLauncher, EventReceiver, ExitInfo,
};
use crate::io::config::ShellConfig;
use crate::io::health::HealthProbe;
use crate::io::paths::{BackendPaths, executable_name};
use crate::io::port::{PortReclaimer, ReclaimReport};
use crate::io::presenter::Presenter;
use crate::shutdown::ShutdownLatch;
use crate::supervisor::Supervisor;

/// A complete backend install under a temp dir: every required directory,
/// an executable `backend/main` and the bundled key. No fallback key.
pub struct BackendLayout {
    pub dir: TempDir,
    pub paths: BackendPaths,
}

impl BackendLayout {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let root = dir.path();
        let executable = root.join("app").join("backend").join(executable_name());
        let paths = BackendPaths::new(&executable, &root.join("home"), root.join("data"), None);

        for required in paths.required_dirs() {
            fs::create_dir_all(&required)
                .with_context(|| format!("create {}", required.display()))?;
        }
        fs::write(&executable, "#!/bin/sh\nexit 0\n").context("write executable")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&executable, fs::Permissions::from_mode(0o755))
                .context("chmod executable")?;
        }
        fs::write(&paths.key_file, "test-key").context("write key")?;

        Ok(Self { dir, paths })
    }
}

/// Whether `pid` names a process that has not exited. A zombie counts as
/// exited: a killed child lingers until the runtime reaps it.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat"))
        && let Some(rest) = stat.rsplit(')').next()
        && let Some(state) = rest.trim_start().chars().next()
    {
        return state != 'Z';
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_ok()
}

/// Poll until `pid` has exited or `within` elapses. Returns whether it exited.
#[cfg(unix)]
pub async fn wait_for_pid_exit(pid: u32, within: std::time::Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    !pid_alive(pid)
}

/// Who holds the backend port in the scripted world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    /// Left over from an earlier run.
    Stale,
    /// The backend this supervisor launched.
    Backend,
    /// A listener that outlived its backend.
    Orphan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSignal {
    Terminate,
    Kill,
}

/// Knobs and observations for one scripted run.
#[derive(Debug)]
pub struct WorldState {
    pub listener: Option<Listener>,
    /// Listeners that survive reclamation (e.g. owned by another user).
    pub unkillable: bool,
    pub reclaim_fails: bool,
    /// A stale listener reappears once right after the next reclaim.
    pub stale_returns_once: bool,
    /// A stale listener answers health checks.
    pub stale_is_healthy: bool,

    /// Post-launch probe number from which the backend reports healthy.
    pub healthy_from: Option<u32>,
    /// The backend exits on its own after this post-launch probe.
    pub exit_after_probe: Option<(u32, ExitInfo)>,
    pub launch_fails: bool,
    pub exits_on_terminate: bool,
    pub orphan_on_exit: bool,

    pub reclaim_calls: u32,
    pub launches: u32,
    pub launched_commands: Vec<BackendCommand>,
    pub probes: u32,
    pub probes_since_launch: u32,
    pub signals: Vec<(ChildSignal, Instant)>,
    /// Set when a reclaim call finishes with the port free.
    pub port_free_after_reclaim: Vec<bool>,

    events: Option<mpsc::UnboundedSender<BackendEvent>>,
    exit: Option<watch::Sender<Option<ExitInfo>>>,
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            listener: None,
            unkillable: false,
            reclaim_fails: false,
            stale_returns_once: false,
            stale_is_healthy: false,
            healthy_from: Some(1),
            exit_after_probe: None,
            launch_fails: false,
            exits_on_terminate: true,
            orphan_on_exit: false,
            reclaim_calls: 0,
            launches: 0,
            launched_commands: Vec::new(),
            probes: 0,
            probes_since_launch: 0,
            signals: Vec::new(),
            port_free_after_reclaim: Vec::new(),
            events: None,
            exit: None,
        }
    }
}

impl WorldState {
    fn child_running(&self) -> bool {
        self.exit
            .as_ref()
            .is_some_and(|exit| exit.borrow().is_none())
    }

    fn finish(&mut self, exit: ExitInfo) {
        let Some(sender) = self.exit.as_ref() else {
            return;
        };
        if sender.borrow().is_some() {
            return;
        }
        sender.send_replace(Some(exit));
        if let Some(events) = &self.events {
            let _ = events.send(BackendEvent::Exited(exit));
        }
        if self.listener == Some(Listener::Backend) {
            self.listener = self.orphan_on_exit.then_some(Listener::Orphan);
        }
    }
}

/// Shared handle to the scripted world; every fake holds a clone.
#[derive(Debug, Clone, Default)]
pub struct ScriptedWorld {
    state: Arc<Mutex<WorldState>>,
}

impl ScriptedWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(configure: impl FnOnce(&mut WorldState)) -> Self {
        let world = Self::new();
        configure(&mut world.lock());
        world
    }

    pub fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn port_free(&self) -> bool {
        self.lock().listener.is_none()
    }

    pub fn signals(&self) -> Vec<ChildSignal> {
        self.lock().signals.iter().map(|(signal, _)| *signal).collect()
    }

    pub fn child_running(&self) -> bool {
        self.lock().child_running()
    }

    /// Emit one stdout line from the running backend.
    pub fn emit_stdout(&self, line: &str) {
        if let Some(events) = &self.lock().events {
            let _ = events.send(BackendEvent::Stdout(line.to_string()));
        }
    }

    /// Make the running backend exit on its own.
    pub fn exit_backend(&self, exit: ExitInfo) {
        self.lock().finish(exit);
    }

    pub fn reclaimer(&self) -> ScriptedReclaimer {
        ScriptedReclaimer {
            world: self.clone(),
        }
    }

    pub fn probe(&self) -> ScriptedProbe {
        ScriptedProbe {
            world: self.clone(),
        }
    }

    pub fn launcher(&self) -> ScriptedLauncher {
        ScriptedLauncher {
            world: self.clone(),
        }
    }

    /// A supervisor wired entirely to this world.
    pub fn supervisor(
        &self,
        config: ShellConfig,
        paths: BackendPaths,
    ) -> Supervisor<ScriptedReclaimer, ScriptedProbe, ScriptedLauncher> {
        Supervisor::new(
            config,
            paths,
            self.reclaimer(),
            self.probe(),
            self.launcher(),
            ShutdownLatch::new(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedReclaimer {
    world: ScriptedWorld,
}

#[async_trait]
impl PortReclaimer for ScriptedReclaimer {
    async fn reclaim(&self, port: u16) -> Result<ReclaimReport> {
        let mut guard = self.world.lock();
        let state = &mut *guard;
        state.reclaim_calls += 1;
        if state.reclaim_fails {
            state.port_free_after_reclaim.push(state.listener.is_none());
            bail!("lsof exploded");
        }

        let mut report = ReclaimReport {
            port,
            killed: Vec::new(),
        };
        if state.listener.is_some() && !state.unkillable {
            report.killed.push(9000 + state.reclaim_calls);
            if state.listener == Some(Listener::Backend) {
                state.finish(ExitInfo::from_signal(9));
            }
            state.listener = None;
        }
        let free = state.listener.is_none();
        state.port_free_after_reclaim.push(free);
        if state.stale_returns_once && free {
            state.stale_returns_once = false;
            state.listener = Some(Listener::Stale);
        }
        Ok(report)
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    world: ScriptedWorld,
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> bool {
        let mut guard = self.world.lock();
        let state = &mut *guard;
        state.probes += 1;
        let listener = state.listener;
        match listener {
            Some(Listener::Backend) if state.child_running() => {
                state.probes_since_launch += 1;
                let attempt = state.probes_since_launch;
                if let Some((after, exit)) = state.exit_after_probe
                    && attempt == after
                {
                    state.finish(exit);
                    return false;
                }
                state.healthy_from.is_some_and(|from| attempt >= from)
            }
            Some(Listener::Stale) => state.stale_is_healthy,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedLauncher {
    world: ScriptedWorld,
}

#[async_trait]
impl BackendLauncher for ScriptedLauncher {
    type Child = ScriptedChild;

    async fn launch(&self, command: &BackendCommand) -> io::Result<(ScriptedChild, EventReceiver)> {
        let mut guard = self.world.lock();
        let state = &mut *guard;
        if state.launch_fails {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        state.launches += 1;
        state.launched_commands.push(command.clone());
        state.probes_since_launch = 0;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        state.events = Some(events_tx);
        state.exit = Some(exit_tx);
        // A stale listener still holding the port wins the bind race.
        if state.listener.is_none() {
            state.listener = Some(Listener::Backend);
        }

        let child = ScriptedChild {
            world: self.world.clone(),
            pid: 4000 + state.launches,
            exit: exit_rx,
        };
        Ok((child, events_rx))
    }
}

#[derive(Debug)]
pub struct ScriptedChild {
    world: ScriptedWorld,
    pid: u32,
    exit: watch::Receiver<Option<ExitInfo>>,
}

#[async_trait]
impl BackendChild for ScriptedChild {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    async fn terminate(&mut self) -> Result<()> {
        let mut guard = self.world.lock();
        let state = &mut *guard;
        state.signals.push((ChildSignal::Terminate, Instant::now()));
        if state.exits_on_terminate {
            state.finish(ExitInfo::from_signal(15));
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        let mut guard = self.world.lock();
        let state = &mut *guard;
        state.signals.push((ChildSignal::Kill, Instant::now()));
        state.finish(ExitInfo::from_signal(9));
        Ok(())
    }

    async fn wait_exit(&mut self) -> ExitInfo {
        let observed = self.exit.wait_for(Option::is_some).await.map(|exit| *exit);
        match observed {
            Ok(Some(exit)) => exit,
            _ => ExitInfo::unknown(),
        }
    }
}

/// Presenter that records what it was asked to show.
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    pub opened: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<(String, String)>>,
}

impl RecordingPresenter {
    pub fn opened(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Presenter for RecordingPresenter {
    async fn open_window(&self, url: &str) -> Result<()> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());
        Ok(())
    }

    fn show_error(&self, title: &str, message: &str) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((title.to_string(), message.to_string()));
    }
}
