//! Stand-in for the Secure Sign-In backend.
//!
//! Honours the contract the shell expects from the real backend: `/health`
//! and `/login` on `--port`, the storage environment variables, and a clean
//! exit on SIGTERM. Extra flags script misbehaviour for end-to-end tests.

mod routes;
mod state;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tracing::{info, warn};

use crate::state::AppState;

/// Variables the shell sets for the backend.
const CONTRACT_VARS: [&str; 4] = ["USE_SQLITE", "SQLITE_DB_PATH", "KEY_DIR", "KEY_FILE"];

#[derive(Parser)]
#[command(name = "backend-stub")]
#[command(about = "Stand-in backend for exercising signin-shell")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Answer /health with 503 until this many milliseconds have passed
    #[arg(long, default_value = "0")]
    ready_after_ms: u64,

    /// Write the received environment contract and working directory as JSON
    #[arg(long)]
    env_dump: Option<PathBuf>,

    /// Exit on our own after this many milliseconds
    #[arg(long)]
    exit_after_ms: Option<u64>,

    /// Exit code used with --exit-after-ms
    #[arg(long, default_value = "0")]
    exit_code: i32,

    /// Keep running when asked to terminate gracefully
    #[arg(long)]
    ignore_sigterm: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("backend_stub=info".parse()?),
        )
        .init();

    let args = Args::parse();

    if let Some(path) = &args.env_dump {
        dump_env(path)?;
    }

    if let Some(ms) = args.exit_after_ms {
        let code = args.exit_code;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            warn!(code, "exiting on schedule");
            std::process::exit(code);
        });
    }

    let state = AppState::new(Duration::from_millis(args.ready_after_ms));
    let app: Router = routes::router().with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "listening");
    // The shell forwards stdout lines to its log.
    println!("backend-stub listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(args.ignore_sigterm))
        .await?;

    info!("stopped");
    Ok(())
}

fn dump_env(path: &Path) -> anyhow::Result<()> {
    let mut dump: BTreeMap<String, String> = CONTRACT_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
        .collect();
    let cwd = std::env::current_dir().context("read working directory")?;
    dump.insert("cwd".to_string(), cwd.display().to_string());

    let mut payload = serde_json::to_string_pretty(&dump).context("serialize env dump")?;
    payload.push('\n');
    std::fs::write(path, payload).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM unless `ignore_sigterm` is set.
async fn shutdown_signal(ignore_sigterm: bool) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(err = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return,
                _ = sigterm.recv() => {
                    if !ignore_sigterm {
                        info!("SIGTERM received, shutting down");
                        return;
                    }
                    warn!("ignoring SIGTERM");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ignore_sigterm;
        let _ = tokio::signal::ctrl_c().await;
    }
}
