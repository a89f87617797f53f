//! Launching the backend and talking to its process.
//!
//! [`BackendLauncher`] spawns the child and hands back a [`BackendChild`] plus a
//! channel of [`BackendEvent`]s. Output lines always arrive before the
//! `Exited` event for the same process.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::paths::BackendPaths;

/// How long the watcher waits for the output readers after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How the backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Terminating signal, Unix only.
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Only an explicit exit code of zero is clean.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code: {code}"),
            (None, Some(signal)) => write!(f, "signal: {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Something the backend process did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Stdout(String),
    Stderr(String),
    /// Always the last event on the channel.
    Exited(ExitInfo),
}

pub type EventReceiver = mpsc::UnboundedReceiver<BackendEvent>;

/// Launch recipe: executable, working directory and environment overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    pub program: PathBuf,
    pub working_dir: PathBuf,
    /// Layered on top of the inherited environment.
    pub env: Vec<(String, OsString)>,
}

impl BackendCommand {
    pub fn from_paths(paths: &BackendPaths) -> Self {
        Self {
            program: paths.executable.clone(),
            working_dir: paths.backend_dir.clone(),
            env: paths.backend_env(),
        }
    }
}

/// Handle to a running backend.
#[async_trait]
pub trait BackendChild: Send {
    fn pid(&self) -> Option<u32>;

    /// `Some` once the process has been reaped.
    fn exit_info(&self) -> Option<ExitInfo>;

    fn is_running(&self) -> bool {
        self.exit_info().is_none()
    }

    /// Ask the process to stop (SIGTERM / `taskkill /T`).
    async fn terminate(&mut self) -> Result<()>;

    /// Force the process to stop (SIGKILL / `taskkill /T /F`).
    async fn kill(&mut self) -> Result<()>;

    /// Wait until the process has been reaped.
    async fn wait_exit(&mut self) -> ExitInfo;
}

/// Spawns backend processes.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    type Child: BackendChild;

    async fn launch(&self, command: &BackendCommand) -> io::Result<(Self::Child, EventReceiver)>;
}

/// Real launcher built on `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Bound for `taskkill` on Windows.
    control_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(control_timeout: Duration) -> Self {
        Self { control_timeout }
    }
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    type Child = ChildProcess;

    async fn launch(&self, command: &BackendCommand) -> io::Result<(ChildProcess, EventReceiver)> {
        let mut cmd = Command::new(&command.program);
        cmd.current_dir(&command.working_dir)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        info!(pid = ?pid, program = %command.program.display(), "backend spawned");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, tx.clone(), BackendEvent::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, tx.clone(), BackendEvent::Stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let watcher = tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(err) => {
                    warn!(pid = ?pid, err = %err, "failed to wait for backend");
                    ExitInfo::unknown()
                }
            };
            for reader in readers {
                if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                    debug!(pid = ?pid, "backend output still open after exit");
                }
            }
            exit_tx.send_replace(Some(exit));
            let _ = tx.send(BackendEvent::Exited(exit));
        });

        Ok((
            ChildProcess {
                pid,
                exit: exit_rx,
                watcher,
                control_timeout: self.control_timeout,
            },
            rx,
        ))
    }
}

/// Forward each line of `reader` as an event. Lines are decoded lossily.
fn forward_lines<R>(
    reader: R,
    tx: mpsc::UnboundedSender<BackendEvent>,
    wrap: fn(String) -> BackendEvent,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    // Keep draining even if nobody listens, or the child blocks on a full pipe.
                    let _ = tx.send(wrap(line));
                }
                Err(err) => {
                    debug!(err = %err, "backend output read failed");
                    break;
                }
            }
        }
    })
}

/// A backend spawned by [`ProcessLauncher`]. The watcher task owns the OS
/// handle; this side only signals by pid and observes the exit.
///
/// Dropping it aborts the watcher, which drops the kill-on-drop handle and so
/// kills a backend that is still running.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitInfo>>,
    watcher: JoinHandle<()>,
    #[cfg_attr(unix, allow(dead_code))]
    control_timeout: Duration,
}

impl ChildProcess {
    #[cfg(unix)]
    async fn stop(&self, force: bool) -> Result<()> {
        use anyhow::Context;
        use nix::errno::Errno;
        use nix::sys::signal::Signal;
        use nix::unistd::Pid;

        let Some(pid) = self.pid.filter(|_| self.is_running()) else {
            return Ok(());
        };
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        let raw = i32::try_from(pid).context("pid out of range")?;
        debug!(pid, %signal, "signalling backend");
        match nix::sys::signal::kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("send {signal} to backend pid {pid}")),
        }
    }

    #[cfg(windows)]
    async fn stop(&self, force: bool) -> Result<()> {
        use super::process::run_control_command;

        let Some(pid) = self.pid.filter(|_| self.is_running()) else {
            return Ok(());
        };
        let mut cmd = std::process::Command::new("taskkill");
        cmd.arg("/PID").arg(pid.to_string()).arg("/T");
        if force {
            cmd.arg("/F");
        }
        let output = run_control_command(cmd, self.control_timeout).await?;
        if !output.status.success() {
            debug!(pid, stderr = %output.stderr_text(), "taskkill reported failure");
        }
        Ok(())
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.watcher.is_finished() {
            debug!(pid = ?self.pid, "backend handle dropped while running, killing");
            self.watcher.abort();
        }
    }
}

#[async_trait]
impl BackendChild for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    async fn terminate(&mut self) -> Result<()> {
        self.stop(false).await
    }

    async fn kill(&mut self) -> Result<()> {
        self.stop(true).await
    }

    async fn wait_exit(&mut self) -> ExitInfo {
        let observed = self.exit.wait_for(Option::is_some).await.map(|exit| *exit);
        match observed {
            Ok(Some(exit)) => exit,
            _ => self.exit_info().unwrap_or_else(ExitInfo::unknown),
        }
    }
}

/// The one backend the supervisor owns: its launch recipe, live handle and
/// the last exit observed.
#[derive(Debug)]
pub struct SupervisedProcess<C> {
    pub command: BackendCommand,
    handle: Option<C>,
    pub last_exit: Option<ExitInfo>,
    pub desired_running: bool,
}

impl<C: BackendChild> SupervisedProcess<C> {
    pub fn new(command: BackendCommand) -> Self {
        Self {
            command,
            handle: None,
            last_exit: None,
            desired_running: false,
        }
    }

    /// A handle is tracked and its process has not been reaped.
    pub fn is_live(&self) -> bool {
        self.handle.as_ref().is_some_and(BackendChild::is_running)
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(BackendChild::pid)
    }

    /// A child was started since the last [`Self::attach`], live or not.
    pub fn was_launched(&self) -> bool {
        self.handle.is_some() || self.last_exit.is_some()
    }

    pub fn attach(&mut self, child: C) {
        self.handle = Some(child);
        self.last_exit = None;
        self.desired_running = true;
    }

    pub fn handle_mut(&mut self) -> Option<&mut C> {
        self.handle.as_mut()
    }

    /// Drop the handle, recording how the process ended.
    pub fn release(&mut self, exit: Option<ExitInfo>) -> Option<C> {
        self.desired_running = false;
        if exit.is_some() {
            self.last_exit = exit;
        }
        self.handle.take()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use super::*;

    fn script_command(program: PathBuf) -> BackendCommand {
        BackendCommand {
            program,
            working_dir: std::env::temp_dir(),
            env: vec![("STUB_GREETING".to_string(), OsString::from("hello"))],
        }
    }

    async fn launch_script(script: &str) -> (ChildProcess, EventReceiver) {
        use std::os::unix::fs::PermissionsExt;

        let path = tempfile::Builder::new()
            .suffix(".sh")
            .tempfile()
            .expect("tempfile")
            .into_temp_path()
            .keep()
            .expect("keep");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        ProcessLauncher::new(Duration::from_secs(5))
            .launch(&script_command(path))
            .await
            .expect("launch")
    }

    async fn drain(rx: &mut EventReceiver) -> Vec<BackendEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, BackendEvent::Exited(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn exit_info_display() {
        assert_eq!(ExitInfo::from_code(3).to_string(), "code: 3");
        assert_eq!(ExitInfo::from_signal(9).to_string(), "signal: 9");
        assert_eq!(ExitInfo::unknown().to_string(), "unknown exit status");
        assert!(ExitInfo::from_code(0).is_clean());
        assert!(!ExitInfo::from_signal(15).is_clean());
    }

    #[test]
    fn command_carries_backend_environment() {
        let paths = BackendPaths::new("/opt/b/main", Path::new("/home/u"), "/data", None);
        let command = BackendCommand::from_paths(&paths);
        assert_eq!(command.working_dir, PathBuf::from("/opt/b"));
        let keys: Vec<&str> = command.env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["USE_SQLITE", "SQLITE_DB_PATH", "KEY_DIR", "KEY_FILE"]);
    }

    #[tokio::test]
    async fn output_precedes_exit() {
        let (_child, mut rx) = launch_script("echo one; echo two >&2; echo three; exit 4").await;
        let events = drain(&mut rx).await;

        let stdout: Vec<&BackendEvent> = events
            .iter()
            .filter(|e| matches!(e, BackendEvent::Stdout(_)))
            .collect();
        assert_eq!(
            stdout,
            [
                &BackendEvent::Stdout("one".to_string()),
                &BackendEvent::Stdout("three".to_string())
            ]
        );
        assert!(events.contains(&BackendEvent::Stderr("two".to_string())));
        assert_eq!(events.last(), Some(&BackendEvent::Exited(ExitInfo::from_code(4))));
    }

    #[tokio::test]
    async fn environment_and_working_dir_are_applied() {
        let (_child, mut rx) = launch_script("echo \"$STUB_GREETING\"; pwd -P").await;
        let events = drain(&mut rx).await;
        let cwd = std::env::temp_dir().canonicalize().expect("canonical tmp");
        assert_eq!(events[0], BackendEvent::Stdout("hello".to_string()));
        assert_eq!(events[1], BackendEvent::Stdout(cwd.display().to_string()));
    }

    #[tokio::test]
    async fn terminate_stops_a_sleeping_child() {
        let (mut child, _rx) = launch_script("exec sleep 30").await;
        assert!(child.is_running());
        child.terminate().await.expect("terminate");
        let exit = tokio::time::timeout(Duration::from_secs(5), child.wait_exit())
            .await
            .expect("exit in time");
        assert_eq!(exit.signal, Some(nix::sys::signal::Signal::SIGTERM as i32));
        assert!(!child.is_running());
        // Signalling a reaped child is a no-op.
        child.kill().await.expect("kill after exit");
    }

    #[tokio::test]
    async fn dropping_the_handle_kills_a_running_child() {
        let (child, _rx) = launch_script("exec sleep 30").await;
        let pid = child.pid().expect("pid");
        assert!(crate::test_support::pid_alive(pid));

        drop(child);

        assert!(
            crate::test_support::wait_for_pid_exit(pid, Duration::from_secs(5)).await,
            "pid {pid} still alive after its handle was dropped"
        );
    }

    #[tokio::test]
    async fn supervised_process_tracks_liveness() {
        let (child, _rx) = launch_script("exec sleep 30").await;
        let mut process = SupervisedProcess::new(script_command(PathBuf::from("/bin/true")));
        assert!(!process.is_live());

        process.attach(child);
        assert!(process.is_live());
        assert!(process.desired_running);

        let handle = process.handle_mut().expect("handle");
        handle.kill().await.expect("kill");
        let exit = handle.wait_exit().await;
        assert!(!process.is_live());

        process.release(Some(exit));
        assert_eq!(process.last_exit, Some(exit));
        assert!(!process.desired_running);
        assert!(process.pid().is_none());
    }
}
