//! Find and terminate whatever is listening on the backend port.
//!
//! [`PortReclaimer`] is the capability; [`LsofReclaimer`] (Unix) and
//! [`NetstatReclaimer`] (Windows) implement it with the platform's own tools.
//! Callers treat every failure as non-fatal.

use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::process::run_control_command;

/// Processes terminated by one reclaim pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub port: u16,
    pub killed: Vec<u32>,
}

/// Forcibly frees a TCP port by terminating its listeners.
#[async_trait]
pub trait PortReclaimer: Send + Sync {
    /// Kill every listener on `port`. Finding none is success.
    async fn reclaim(&self, port: u16) -> Result<ReclaimReport>;
}

/// The reclaimer for the platform the shell was built for.
#[cfg(unix)]
pub fn platform_reclaimer(timeout: Duration) -> LsofReclaimer {
    LsofReclaimer::new(timeout)
}

#[cfg(windows)]
pub fn platform_reclaimer(timeout: Duration) -> NetstatReclaimer {
    NetstatReclaimer::new(timeout)
}

/// Parse `lsof -t` output: one pid per line.
pub fn parse_lsof_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Parse `netstat -ano` output for pids in `LISTENING` state on `port`.
pub fn parse_netstat_listeners(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // Proto  Local Address  Foreign Address  State  PID
            if fields.len() < 5 || !fields[0].eq_ignore_ascii_case("tcp") {
                return None;
            }
            if !fields[1].ends_with(&suffix) || fields[3] != "LISTENING" {
                return None;
            }
            fields[4].parse().ok()
        })
        .filter(|pid| *pid != 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Unix reclaimer: `lsof` to find listeners, SIGKILL to remove them.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct LsofReclaimer {
    timeout: Duration,
}

#[cfg(unix)]
impl LsofReclaimer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn listeners(&self, port: u16) -> Result<Vec<u32>> {
        if which::which("lsof").is_err() {
            warn!(port, "lsof not found; cannot look up port listeners");
            return Ok(Vec::new());
        }
        let mut cmd = Command::new("lsof");
        cmd.arg("-nP")
            .arg("-t")
            .arg(format!("-iTCP:{port}"))
            .arg("-sTCP:LISTEN");
        let output = run_control_command(cmd, self.timeout).await?;
        if output.timed_out {
            anyhow::bail!("lsof timed out looking up port {port}");
        }
        // lsof exits 1 when nothing matches.
        Ok(parse_lsof_pids(&output.stdout_text()))
    }
}

#[cfg(unix)]
#[async_trait]
impl PortReclaimer for LsofReclaimer {
    async fn reclaim(&self, port: u16) -> Result<ReclaimReport> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let own_pid = std::process::id();
        let mut report = ReclaimReport {
            port,
            killed: Vec::new(),
        };
        for pid in self.listeners(port).await? {
            if pid == own_pid {
                continue;
            }
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            match kill(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) => {
                    info!(port, pid, "killed process holding port");
                    report.killed.push(pid);
                }
                Err(Errno::ESRCH) => debug!(port, pid, "listener already gone"),
                Err(err) => warn!(port, pid, err = %err, "failed to kill listener"),
            }
        }
        if report.killed.is_empty() {
            debug!(port, "no listeners to reclaim");
        }
        Ok(report)
    }
}

/// Windows reclaimer: `netstat -ano` to find listeners, `taskkill /F` to remove them.
#[cfg(windows)]
#[derive(Debug, Clone)]
pub struct NetstatReclaimer {
    timeout: Duration,
}

#[cfg(windows)]
impl NetstatReclaimer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[cfg(windows)]
#[async_trait]
impl PortReclaimer for NetstatReclaimer {
    async fn reclaim(&self, port: u16) -> Result<ReclaimReport> {
        let mut cmd = Command::new("netstat");
        cmd.arg("-ano").arg("-p").arg("TCP");
        let output = run_control_command(cmd, self.timeout).await?;
        if output.timed_out {
            anyhow::bail!("netstat timed out looking up port {port}");
        }

        let own_pid = std::process::id();
        let mut report = ReclaimReport {
            port,
            killed: Vec::new(),
        };
        for pid in parse_netstat_listeners(&output.stdout_text(), port) {
            if pid == own_pid {
                continue;
            }
            let mut kill = Command::new("taskkill");
            kill.arg("/F").arg("/PID").arg(pid.to_string());
            match run_control_command(kill, self.timeout).await {
                Ok(out) if out.status.success() => {
                    info!(port, pid, "killed process holding port");
                    report.killed.push(pid);
                }
                Ok(out) => warn!(port, pid, stderr = %out.stderr_text(), "taskkill failed"),
                Err(err) => warn!(port, pid, err = %format!("{err:#}"), "taskkill failed"),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsof_output_is_deduplicated_and_sorted() {
        let pids = parse_lsof_pids("812\n77\n\n812\nnot-a-pid\n");
        assert_eq!(pids, vec![77, 812]);
    }

    #[test]
    fn netstat_only_matches_listeners_on_the_exact_port() {
        let output = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:8080           0.0.0.0:0              LISTENING       4312
  TCP    0.0.0.0:18080          0.0.0.0:0              LISTENING       999
  TCP    127.0.0.1:8080         127.0.0.1:50123        ESTABLISHED     4312
  TCP    127.0.0.1:50123        127.0.0.1:8080         ESTABLISHED     7000
  TCP    [::]:8080              [::]:0                 LISTENING       4312
  TCP    [::]:8080              [::]:0                 LISTENING       0
";
        assert_eq!(parse_netstat_listeners(output, 8080), vec![4312]);
        assert_eq!(parse_netstat_listeners(output, 18080), vec![999]);
        assert!(parse_netstat_listeners(output, 9090).is_empty());
    }
}
