//! The backend cannot outlive the supervisor that launched it.
#![cfg(unix)]

use std::fs;
use std::time::Duration;

use signin_shell::core::state::SupervisorState;
use signin_shell::io::backend::ProcessLauncher;
use signin_shell::io::config::ShellConfig;
use signin_shell::shutdown::ShutdownLatch;
use signin_shell::supervisor::Supervisor;
use signin_shell::test_support::{BackendLayout, ScriptedWorld, pid_alive, wait_for_pid_exit};

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_supervisor_kills_the_backend() {
    let layout = BackendLayout::new().expect("layout");
    fs::write(&layout.paths.executable, "#!/bin/sh\nexec sleep 30\n").expect("write backend");
    let world = ScriptedWorld::new();
    let mut supervisor = Supervisor::new(
        ShellConfig::default(),
        layout.paths.clone(),
        world.reclaimer(),
        world.probe(),
        ProcessLauncher::new(Duration::from_secs(5)),
        ShutdownLatch::new(),
    );

    supervisor.clear_port().await.expect("clear");
    supervisor.validate().await.expect("validate");
    let state = supervisor.spawn().await.expect("spawn");
    assert_eq!(state, SupervisorState::Spawning);
    let pid = supervisor.process().pid().expect("pid");
    assert!(pid_alive(pid));

    drop(supervisor);

    assert!(
        wait_for_pid_exit(pid, Duration::from_secs(5)).await,
        "backend pid {pid} outlived its supervisor"
    );
}
